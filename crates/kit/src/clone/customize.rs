//! Chroot customization: rewriting the guest's identity on disk.
//!
//! All paths here are relative to the chroot, which is the working directory
//! for this phase (the process chdirs in before and out after, as the
//! surrounding orchestrator arranges). File writes are gated on dry-run;
//! command invocations are suppressed by the runner itself.

use std::fs;
use std::io::Write as _;

use camino::Utf8PathBuf;
use tracing::{debug, info};

use crate::cmdrun::{CommandRunner, RunOpts};
use crate::config::{ScopedUmask, Settings};
use crate::error::{Error, Result};

use super::{ClonePlan, OsKind};

/// Sentinel line terminating PEM certificate material.
pub const END_CERTIFICATE: &str = "-----END CERTIFICATE-----";

/// Service-manager inhibitor inside the chroot; while present, package
/// operations will not start daemons.
pub const POLICY_RC_D: &str = "usr/sbin/policy-rc.d";

fn sed(runner: &CommandRunner<'_>, expr: &str, file: &str) -> Result<()> {
    runner.run(&["sed", "-i", expr, file], RunOpts::default())?;
    Ok(())
}

/// Write the policy-rc.d inhibitor and make it executable.
pub fn install_service_inhibitor(runner: &CommandRunner<'_>, settings: &Settings) -> Result<()> {
    debug!("- echo -e \"#!/bin/sh\\nexit 101\" > {}", POLICY_RC_D);
    if !settings.dry_run {
        let mut file = fs::File::create(POLICY_RC_D)?;
        file.write_all(b"#!/bin/sh\nexit 101")?;
    }
    runner.run(&["chmod", "a+rx", POLICY_RC_D], RunOpts::default())?;
    Ok(())
}

/// Substitute the template hostname for the new one in every
/// hostname-bearing file.
pub fn update_hostname(runner: &CommandRunner<'_>, plan: &ClonePlan) -> Result<()> {
    info!("Update hostname");
    let expr = plan.hostname_sed();
    for file in [
        "etc/hostname",
        "etc/hosts",
        "etc/fstab",
        "etc/mailname",
        "etc/exim4/update-exim4.conf.conf",
    ] {
        sed(runner, &expr, file)?;
    }
    Ok(())
}

/// Point the backup client at the new guest's own backup target.
pub fn update_backup_client(runner: &CommandRunner<'_>, plan: &ClonePlan) -> Result<()> {
    let config = "etc/cgabackup/client.conf";
    sed(
        runner,
        &format!("s/backup-cga-host/backup-cga-{}/", plan.name),
        config,
    )?;
    sed(
        runner,
        &format!("s/\\/backup\\/cga\\/host/\\/backup\\/cga\\/{}/", plan.name),
        config,
    )?;
    Ok(())
}

/// Substitute the template's addresses for the new guest's in the network
/// interface configuration.
pub fn update_ip_addresses(runner: &CommandRunner<'_>, plan: &ClonePlan) -> Result<()> {
    info!("Update IP addresses");
    let interfaces = "etc/network/interfaces";
    for (old, new) in [
        (&plan.template_ipv4, &plan.ipv4),
        (&plan.template_ipv4_priv, &plan.ipv4_priv),
        (&plan.template_ipv6, &plan.ipv6),
        (&plan.template_ipv6_priv, &plan.ipv6_priv),
    ] {
        sed(runner, &format!("s/{old}/{new}/g"), interfaces)?;
    }
    Ok(())
}

/// Update the monitoring agent's bound address.
pub fn update_munin(runner: &CommandRunner<'_>, plan: &ClonePlan) -> Result<()> {
    sed(
        runner,
        &format!("s/{}/{}/g", plan.template_ipv4_priv, plan.ipv4_priv),
        "etc/munin/munin-node.conf",
    )
}

/// Rewrite the id-derived MAC octet in the persistent net rules.
///
/// MACs may carry the id zero-padded or bare; both spellings are rewritten
/// to the zero-padded form.
pub fn update_mac_rules(runner: &CommandRunner<'_>, plan: &ClonePlan) -> Result<()> {
    info!("Update MAC address");
    let rules = "etc/udev/rules.d/70-persistent-net.rules";
    sed(
        runner,
        &format!("s/:{:02}/:{:02}/g", plan.template_id, plan.id),
        rules,
    )?;
    if plan.template_id < 10 {
        sed(
            runner,
            &format!("s/:{}\"/:{:02}\"/g", plan.template_id, plan.id),
            rules,
        )?;
    }
    Ok(())
}

fn remove_host_keys(settings: &Settings) -> Result<()> {
    debug!("- rm etc/ssh/ssh_host_*");
    if settings.dry_run {
        return Ok(());
    }
    for entry in fs::read_dir("etc/ssh")? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with("ssh_host_") {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Fix the listen address in sshd_config and regenerate both host keys,
/// logging their fingerprints for the operator's records.
pub fn prepare_sshd(
    runner: &CommandRunner<'_>,
    settings: &Settings,
    plan: &ClonePlan,
) -> Result<()> {
    info!("Preparing SSH daemon");
    sed(
        runner,
        &format!("s/{}/{}/g", plan.template_ipv6, plan.ipv6),
        "etc/ssh/sshd_config",
    )?;
    remove_host_keys(settings)?;

    let ed25519 = "etc/ssh/ssh_host_ed25519_key";
    runner.run(
        &["ssh-keygen", "-t", "ed25519", "-f", ed25519, "-N", ""],
        RunOpts::default(),
    )?;
    let fp = runner.run(&["ssh-keygen", "-lf", ed25519], RunOpts::default())?;
    info!("ed25519 fingerprint: {}", fp.stdout.trim());

    let rsa = "etc/ssh/ssh_host_rsa_key";
    runner.run(
        &["ssh-keygen", "-t", "rsa", "-b", "4096", "-f", rsa, "-N", ""],
        RunOpts::default(),
    )?;
    let fp = runner.run(&["ssh-keygen", "-lf", rsa], RunOpts::default())?;
    info!("rsa fingerprint: {}", fp.stdout.trim());
    Ok(())
}

/// Regenerate the boot loader configuration for the new disk identity.
pub fn update_grub(
    runner: &CommandRunner<'_>,
    settings: &Settings,
    plan: &ClonePlan,
    bootdisk_path: &str,
) -> Result<()> {
    info!("Update GRUB");
    let device_map = "boot/grub/device.map";
    debug!("- echo -e '(hd0)\\t{}\\n' > {}", bootdisk_path, device_map);
    if !settings.dry_run {
        let mut file = fs::File::create(device_map)?;
        writeln!(file, "(hd0)\t{bootdisk_path}")?;
    }

    // update-grub has been seen hanging inside chroots, so the hostname in
    // the existing config is replaced directly.
    sed(runner, &plan.hostname_sed(), "boot/grub/grub.cfg")?;
    runner.chroot(
        &["update-initramfs", "-u", "-k", "all"],
        RunOpts::default(),
    )?;
    runner.chroot(
        &[
            "grub-install",
            &format!("/dev/mapper/{}-boot", plan.lv_name),
        ],
        RunOpts::tolerant(),
    )?;
    runner.chroot(&["sync"], RunOpts::default())?;
    runner.chroot(&["sync"], RunOpts::default())?;
    Ok(())
}

/// Switch the package sources to the public mirrors, refresh the index and
/// upgrade, then restore the original sources.
pub fn update_system(runner: &CommandRunner<'_>, kind: OsKind) -> Result<()> {
    info!("Update system");
    let kind = kind.as_str();
    runner.run(
        &[
            "sed",
            "-i.backup",
            &format!("s/http:\\/\\/{kind}.local/https:\\/\\/{kind}.fsinf.at/"),
            "etc/apt/sources.list",
        ],
        RunOpts::default(),
    )?;
    runner.run(
        &[
            "sed",
            "-i.backup",
            "s/apt.local/apt.fsinf.at/",
            "etc/apt/sources.list.d/fsinf.list",
        ],
        RunOpts::default(),
    )?;
    runner.chroot(&["apt-get", "update"], RunOpts::default())?;
    runner.chroot(&["apt-get", "-y", "dist-upgrade"], RunOpts::default())?;
    runner.run(
        &[
            "mv",
            "etc/apt/sources.list.backup",
            "etc/apt/sources.list",
        ],
        RunOpts::default(),
    )?;
    runner.run(
        &[
            "mv",
            "etc/apt/sources.list.d/fsinf.list.backup",
            "etc/apt/sources.list.d/fsinf.list",
        ],
        RunOpts::default(),
    )?;
    Ok(())
}

/// Generate a fresh SSH client key pair for the new identity, restricted to
/// the guest's own source addresses.
pub fn create_ssh_client_keys(runner: &CommandRunner<'_>, plan: &ClonePlan) -> Result<()> {
    info!("Generate SSH client keys");
    runner.run(
        &["rm", "-f", "root/.ssh/id_rsa", "root/.ssh/id_rsa.pub"],
        RunOpts::default(),
    )?;
    // -t rsa is forced because -f must be passed to stay non-interactive.
    runner.chroot(
        &[
            "ssh-keygen",
            "-t",
            "rsa",
            "-q",
            "-N",
            "",
            "-f",
            "/root/.ssh/id_rsa",
            "-O",
            "no-x11-forwarding",
            "-O",
            &format!(
                "source-address={},{},{},{}",
                plan.ipv4, plan.ipv6, plan.ipv4_priv, plan.ipv6_priv
            ),
        ],
        RunOpts::default(),
    )?;
    // fix the hostname comment in the public key
    runner.chroot(
        &[
            "sed",
            "-i",
            &format!("s/@[^@]*$/@{}/", plan.name),
            "/root/.ssh/id_rsa.pub",
        ],
        RunOpts::default(),
    )?;
    Ok(())
}

/// Resolve a group name to its gid inside the chroot's /etc/group.
pub fn chroot_gid(settings: &Settings, group: &str) -> Result<u32> {
    let path = settings.chroot_path("etc/group");
    let content = fs::read_to_string(&path)?;
    let line = content
        .lines()
        .find(|l| l.starts_with(&format!("{group}:")))
        .ok_or_else(|| Error::Lookup(format!("no group {group:?} in {path}")))?;
    let gid = line
        .split(':')
        .nth(2)
        .ok_or_else(|| Error::Parse(format!("malformed group line {line:?}")))?;
    gid.parse()
        .map_err(|_| Error::Parse(format!("non-numeric gid {gid:?}")))
}

/// A TLS certificate signing request awaiting its signed certificate.
///
/// The transaction does not block on operator input; it pauses and hands
/// this back. The certificate text is supplied later via
/// [`PendingCertificate::install`].
#[derive(Debug)]
pub struct PendingCertificate {
    csr: String,
    pem_path: Utf8PathBuf,
    dry_run: bool,
}

impl PendingCertificate {
    /// The CSR text for the operator to submit to the signing authority.
    pub fn csr(&self) -> &str {
        &self.csr
    }

    /// Destination of the signed certificate on the host.
    pub fn pem_path(&self) -> &Utf8PathBuf {
        &self.pem_path
    }

    /// Validate and write the signed certificate.
    ///
    /// The text must terminate with the PEM end sentinel; anything else is
    /// rejected without writing.
    pub fn install(self, cert_text: &str) -> Result<()> {
        if cert_text.trim_end().lines().last() != Some(END_CERTIFICATE) {
            return Err(Error::Parse(format!(
                "certificate does not end with {END_CERTIFICATE:?}"
            )));
        }
        if !self.dry_run {
            fs::write(&self.pem_path, cert_text)?;
        }
        Ok(())
    }
}

/// Generate a TLS key pair and certificate signing request for the new
/// guest, returning the request for out-of-band signing.
pub fn create_tls_csr(
    runner: &CommandRunner<'_>,
    settings: &Settings,
    plan: &ClonePlan,
) -> Result<PendingCertificate> {
    info!("Generate TLS certificate request");
    let name = &plan.name;
    let key = format!("/etc/ssl/private/{name}.key");
    let pem = format!("/etc/ssl/public/{name}.pem");
    let csr = format!("/etc/ssl/{name}.csr");
    let subject = format!("/C=AT/ST=Vienna/L=Vienna/CN={name}.local/");

    {
        // Private key must come out unreadable to group and world.
        let _umask = ScopedUmask::new(rustix::fs::Mode::from_raw_mode(0o277));
        runner.chroot(&["openssl", "genrsa", "-out", &key, "4096"], RunOpts::default())?;
    }
    if !settings.dry_run {
        let gid = chroot_gid(settings, "ssl-cert")?;
        runner.chroot(&["chown", &format!("root:{gid}"), &key], RunOpts::default())?;
    }

    runner.chroot(
        &[
            "openssl", "req", "-new", "-key", &key, "-out", &csr, "-utf8", "-batch", "-sha256",
            "-subj", &subject,
        ],
        RunOpts::default(),
    )?;

    let csr_text = if settings.dry_run {
        String::new()
    } else {
        fs::read_to_string(settings.chroot_path(&csr))?
    };

    Ok(PendingCertificate {
        csr: csr_text,
        pem_path: settings.chroot_path(&pem),
        dry_run: settings.dry_run,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_certificate_sentinel_enforced() {
        let pending = PendingCertificate {
            csr: String::new(),
            pem_path: Utf8PathBuf::from("/nonexistent/cert.pem"),
            dry_run: true,
        };
        let err = pending.install("-----BEGIN CERTIFICATE-----\nabc\n").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_certificate_installed() {
        let dir = tempfile::tempdir().unwrap();
        let pem_path =
            Utf8PathBuf::from_path_buf(dir.path().join("cert.pem")).unwrap();
        let pending = PendingCertificate {
            csr: String::new(),
            pem_path: pem_path.clone(),
            dry_run: false,
        };
        let cert = format!("-----BEGIN CERTIFICATE-----\nabc\n{END_CERTIFICATE}\n");
        pending.install(&cert).unwrap();
        assert_eq!(fs::read_to_string(&pem_path).unwrap(), cert);
    }

    #[test]
    fn test_chroot_gid_parses_group_file() {
        let dir = tempfile::tempdir().unwrap();
        let etc = dir.path().join("etc");
        fs::create_dir_all(&etc).unwrap();
        fs::write(
            etc.join("group"),
            indoc! {"
                root:x:0:
                ssl-cert:x:112:postgres
                ssh:x:113:
            "},
        )
        .unwrap();

        let settings = Settings {
            chroot: Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
            ..Default::default()
        };
        assert_eq!(chroot_gid(&settings, "ssl-cert").unwrap(), 112);
        assert!(matches!(
            chroot_gid(&settings, "wheel"),
            Err(Error::Lookup(_))
        ));
    }
}
