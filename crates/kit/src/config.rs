//! Runtime settings shared by the command runner and the orchestrator.
//!
//! The whole tool is driven by one [`Settings`] value passed by reference;
//! there is no global mutable state. Temporary adjustments (for example a
//! different chroot during a test) go through [`SettingsOverride`], which
//! restores the previous values when dropped.

use camino::{Utf8Path, Utf8PathBuf};

/// Default chroot target for the new guest's root filesystem.
pub const DEFAULT_CHROOT: &str = "/target";

/// Default template domain to clone from.
pub const DEFAULT_TEMPLATE: &str = "wheezy";

/// Runtime configuration for a single invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    /// When set, no external command is spawned and no file is written;
    /// read-only probes still run.
    pub dry_run: bool,

    /// Directory where the new root filesystem is mounted for customization.
    /// Must not exist when the clone starts.
    pub chroot: Utf8PathBuf,

    /// Optional hypervisor connection URI passed to virsh as `-c`.
    pub connect: Option<String>,

    /// Prefix for the guest's public IPv4 address; the numeric id is
    /// appended as the final octet.
    pub ipv4_prefix: String,

    /// Prefix for the guest's private IPv4 address.
    pub ipv4_priv_prefix: String,

    /// Prefix for the guest's public IPv6 address.
    pub ipv6_prefix: String,

    /// Prefix for the guest's private IPv6 address.
    pub ipv6_priv_prefix: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dry_run: false,
            chroot: Utf8PathBuf::from(DEFAULT_CHROOT),
            connect: None,
            ipv4_prefix: "128.130.95.".to_string(),
            ipv4_priv_prefix: "192.168.1.".to_string(),
            ipv6_prefix: "2001:629:3200:95::1:".to_string(),
            ipv6_priv_prefix: "fc00::".to_string(),
        }
    }
}

impl Settings {
    /// Path of a file inside the chroot, given a path relative to its root.
    pub fn chroot_path(&self, rel: &str) -> Utf8PathBuf {
        self.chroot.join(rel.trim_start_matches('/'))
    }

    /// The chroot directory as a path.
    pub fn chroot_dir(&self) -> &Utf8Path {
        &self.chroot
    }
}

/// Scoped override of a [`Settings`] value.
///
/// Captures the current state on construction and restores it when dropped,
/// so a block-local tweak can never leak into the rest of the run.
#[derive(Debug)]
pub struct SettingsOverride<'a> {
    target: &'a mut Settings,
    saved: Settings,
}

impl<'a> SettingsOverride<'a> {
    /// Begin an override scope on `target`.
    pub fn new(target: &'a mut Settings) -> Self {
        let saved = target.clone();
        Self { target, saved }
    }

    /// Access the settings for in-scope mutation.
    pub fn settings(&mut self) -> &mut Settings {
        self.target
    }
}

impl Drop for SettingsOverride<'_> {
    fn drop(&mut self) {
        *self.target = self.saved.clone();
    }
}

/// Scoped umask change, restored on drop.
///
/// Used around key generation so private key material is created unreadable
/// to group and world regardless of the ambient umask.
#[derive(Debug)]
pub struct ScopedUmask {
    saved: rustix::fs::Mode,
}

impl ScopedUmask {
    /// Set the process umask to `mask`, remembering the previous value.
    pub fn new(mask: rustix::fs::Mode) -> Self {
        let saved = rustix::process::umask(mask);
        Self { saved }
    }
}

impl Drop for ScopedUmask {
    fn drop(&mut self) {
        let _ = rustix::process::umask(self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_override_restores() {
        let mut settings = Settings::default();
        {
            let mut scope = SettingsOverride::new(&mut settings);
            scope.settings().dry_run = true;
            scope.settings().chroot = Utf8PathBuf::from("/elsewhere");
            assert!(scope.settings().dry_run);
        }
        assert!(!settings.dry_run);
        assert_eq!(settings.chroot, Utf8PathBuf::from(DEFAULT_CHROOT));
    }

    #[test]
    fn test_chroot_path_join() {
        let settings = Settings::default();
        assert_eq!(
            settings.chroot_path("/etc/hostname"),
            Utf8PathBuf::from("/target/etc/hostname")
        );
        assert_eq!(
            settings.chroot_path("etc/hostname"),
            Utf8PathBuf::from("/target/etc/hostname")
        );
    }
}
