//! Mount tracking for the chroot phase.
//!
//! Every mount created while assembling the new guest's chroot is recorded
//! in a [`MountSet`] so teardown can unmount in exactly reverse creation
//! order, children before parents. The set doubles as a scope guard: if the
//! transaction unwinds before the explicit teardown, `Drop` attempts the
//! same reverse-order unmounts on a best-effort basis.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::cmdrun::{CommandRunner, RunOpts};
use crate::error::Result;

/// Ordered record of mount points created during the transaction.
#[derive(Debug)]
pub struct MountSet<'a> {
    runner: CommandRunner<'a>,
    mounted: Vec<Utf8PathBuf>,
    armed: bool,
}

impl<'a> MountSet<'a> {
    /// Create an empty, armed mount set.
    pub fn new(runner: CommandRunner<'a>) -> Self {
        Self {
            runner,
            mounted: Vec::new(),
            armed: true,
        }
    }

    /// Mount `device` at `target` and record the mount point.
    pub fn mount(&mut self, device: &str, target: &Utf8Path) -> Result<()> {
        self.runner
            .run(&["mount", device, target.as_str()], RunOpts::default())?;
        self.mounted.push(target.to_owned());
        Ok(())
    }

    /// Bind-mount `source` at `target` and record the mount point.
    pub fn bind(&mut self, source: &str, target: &Utf8Path) -> Result<()> {
        self.runner.run(
            &["mount", "-o", "bind", source, target.as_str()],
            RunOpts::default(),
        )?;
        self.mounted.push(target.to_owned());
        Ok(())
    }

    /// Mount points in creation order.
    pub fn mounted(&self) -> &[Utf8PathBuf] {
        &self.mounted
    }

    /// Mount points in unmount order: exact reverse of creation.
    pub fn unmount_order(&self) -> Vec<&Utf8Path> {
        self.mounted.iter().rev().map(|p| p.as_path()).collect()
    }

    /// Unmount every tracked mount point in reverse creation order.
    ///
    /// Any unmount failure is fatal; the remaining mounts are left for the
    /// operator (there is no rollback in this transaction).
    pub fn unmount_all(&mut self) -> Result<()> {
        while let Some(target) = self.mounted.pop() {
            self.runner
                .run(&["umount", target.as_str()], RunOpts::default())?;
        }
        self.armed = false;
        Ok(())
    }

    /// Disarm the drop guard without unmounting.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for MountSet<'_> {
    fn drop(&mut self) {
        if !self.armed || self.mounted.is_empty() {
            return;
        }
        debug!("unwinding {} leftover mounts", self.mounted.len());
        while let Some(target) = self.mounted.pop() {
            let _ = self.runner.run(
                &["umount", target.as_str()],
                RunOpts {
                    quiet: true,
                    ignore_errors: true,
                    dry: false,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn dry_settings() -> Settings {
        Settings {
            dry_run: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_unmount_order_is_exact_reverse() {
        let settings = dry_settings();
        let runner = CommandRunner::new(&settings);
        let mut mounts = MountSet::new(runner);
        mounts
            .mount("/dev/vm_testvm/root", Utf8Path::new("/target"))
            .unwrap();
        mounts
            .mount("/dev/vm_testvm/boot", Utf8Path::new("/target/boot"))
            .unwrap();
        mounts.bind("/dev/", Utf8Path::new("/target/dev")).unwrap();
        mounts.bind("/proc/", Utf8Path::new("/target/proc")).unwrap();

        assert_eq!(
            mounts.unmount_order(),
            vec![
                Utf8Path::new("/target/proc"),
                Utf8Path::new("/target/dev"),
                Utf8Path::new("/target/boot"),
                Utf8Path::new("/target"),
            ]
        );

        mounts.unmount_all().unwrap();
        assert!(mounts.mounted().is_empty());
    }
}
