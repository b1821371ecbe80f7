//! The domain-clone transaction.
//!
//! Cloning is an ordered sequence of external-system mutations: validate
//! preconditions, copy the template descriptor, provision logical volumes,
//! copy disk contents, register the new domain, mount its root filesystem
//! into a chroot, rewrite identity-bearing files inside it, and unwind all
//! mounts and device mappings. Everything after validation mutates external
//! state irreversibly; a failure mid-sequence leaves partial state for the
//! operator to clean up, which is why validation performs every check before
//! the first mutation.

pub mod customize;
pub mod mounts;

use std::fs;
use std::io::BufRead as _;
use std::path::Path;

use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use color_eyre::eyre::Context as _;
use tracing::{debug, info};

use crate::cmdrun::{CommandRunner, RunOpts};
use crate::config::{Settings, DEFAULT_CHROOT, DEFAULT_TEMPLATE};
use crate::descriptor::DomainDescriptor;
use crate::directory::{DomainDirectory, LookupKey};
use crate::error::{Error, Result};
use crate::lvm::{LogicalVolume, VolumeManager, VolumeStore};
use crate::virsh::{Hypervisor, VirshHypervisor};

use customize::{PendingCertificate, END_CERTIFICATE, POLICY_RC_D};
use mounts::MountSet;

/// Template operating system flavor, selecting the package source rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OsKind {
    /// Debian template.
    Debian,
    /// Ubuntu template.
    Ubuntu,
}

impl OsKind {
    /// Lowercase name as used in mirror host names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debian => "debian",
            Self::Ubuntu => "ubuntu",
        }
    }
}

/// Options for the clone command.
#[derive(Debug, Parser)]
pub struct CloneOpts {
    /// Name of the new virtual machine
    pub name: String,

    /// Numeric id of the new machine; determines its VNC port, MAC
    /// addresses and IP addresses
    pub id: u8,

    /// Virtual machine to clone from
    #[clap(long, short = 'f', default_value = DEFAULT_TEMPLATE)]
    pub from: String,

    /// Description for the new virtual machine
    #[clap(long, default_value = "")]
    pub desc: String,

    /// Operating system flavor of the template
    #[clap(long, value_enum, default_value_t = OsKind::Debian)]
    pub kind: OsKind,

    /// Amount of memory in GiB
    #[clap(long, default_value_t = 1.0)]
    pub mem: f64,

    /// Number of virtual CPUs
    #[clap(long, default_value_t = 1)]
    pub cpus: u32,

    /// Don't really do anything; read-only probes still run
    #[clap(long)]
    pub dry_run: bool,

    /// Cross-host transfer mode: skip the power-state check and copy disk
    /// contents manually instead of locally
    #[clap(long)]
    pub transfer: bool,

    /// Skip TLS key and certificate request generation
    #[clap(long)]
    pub no_tls: bool,

    /// Where to mount the new root filesystem during customization
    #[clap(long, default_value = DEFAULT_CHROOT)]
    pub chroot: Utf8PathBuf,
}

/// Identifiers derived for the new guest before any mutation happens.
#[derive(Debug, Clone)]
pub struct ClonePlan {
    /// Name of the new domain.
    pub name: String,
    /// Numeric id of the new domain.
    pub id: u8,
    /// Name of the template domain.
    pub template: String,
    /// Numeric id of the template, derived from its VNC port.
    pub template_id: u8,
    /// Guest-internal volume group name of the new domain.
    pub lv_name: String,
    /// Guest-internal volume group name of the template.
    pub template_lv_name: String,
    /// VNC port of the new domain.
    pub vnc_port: u16,
    /// Public IPv4 address of the new domain.
    pub ipv4: String,
    /// Private IPv4 address of the new domain.
    pub ipv4_priv: String,
    /// Public IPv6 address of the new domain.
    pub ipv6: String,
    /// Private IPv6 address of the new domain.
    pub ipv6_priv: String,
    /// Public IPv4 address of the template.
    pub template_ipv4: String,
    /// Private IPv4 address of the template.
    pub template_ipv4_priv: String,
    /// Public IPv6 address of the template.
    pub template_ipv6: String,
    /// Private IPv6 address of the template.
    pub template_ipv6_priv: String,
}

impl ClonePlan {
    /// Derive all identifiers for the new guest.
    pub fn new(
        settings: &Settings,
        name: &str,
        id: u8,
        template: &str,
        template_id: u8,
    ) -> Result<Self> {
        // Site convention: the VNC port is "59" with the id appended.
        let port = format!("59{id}");
        let vnc_port = port
            .parse()
            .map_err(|_| Error::Range {
                field: "vnc port",
                value: id as u64,
            })?;
        Ok(Self {
            name: name.to_string(),
            id,
            template: template.to_string(),
            template_id,
            lv_name: format!("vm_{name}"),
            template_lv_name: format!("vm_{template}"),
            vnc_port,
            ipv4: format!("{}{id}", settings.ipv4_prefix),
            ipv4_priv: format!("{}{id}", settings.ipv4_priv_prefix),
            ipv6: format!("{}{id}", settings.ipv6_prefix),
            ipv6_priv: format!("{}{id}", settings.ipv6_priv_prefix),
            template_ipv4: format!("{}{template_id}", settings.ipv4_prefix),
            template_ipv4_priv: format!("{}{template_id}", settings.ipv4_priv_prefix),
            template_ipv6: format!("{}{template_id}", settings.ipv6_prefix),
            template_ipv6_priv: format!("{}{template_id}", settings.ipv6_priv_prefix),
        })
    }

    /// sed expression substituting the template hostname for the new one.
    pub fn hostname_sed(&self) -> String {
        format!("s/{}/{}/g", self.template, self.name)
    }

    /// Compute the target volume name from a template volume name.
    ///
    /// Inherited convention: the template's domain name is substring-replaced
    /// within the volume name. This is fragile when the template name occurs
    /// elsewhere in the volume name; it is kept as-is rather than silently
    /// generalized.
    pub fn map_volume_name(&self, lv_name: &str) -> String {
        lv_name.replace(&self.template, &self.name)
    }
}

/// Derive the template's numeric id from its VNC port, the inverse of the
/// "59" + id convention the port was assigned by.
pub fn template_id_from(descriptor: &DomainDescriptor) -> Result<u8> {
    let port = match descriptor.vnc_port() {
        Ok(port) => port.to_string(),
        // autoport templates carry port="-1", which never parses
        Err(Error::Parse(_)) => {
            return Err(Error::Precondition(
                "cannot derive template id: template has no fixed VNC port".into(),
            ))
        }
        Err(e) => return Err(e),
    };
    port.strip_prefix("59")
        .and_then(|tail| tail.parse().ok())
        .ok_or_else(|| {
            Error::Precondition(format!(
                "cannot derive template id from VNC port {port}"
            ))
        })
}

/// One template disk and the volume derived for it.
#[derive(Debug, Clone)]
pub struct VolumeMapping {
    /// Template disk source path.
    pub old_path: String,
    /// Template volume record.
    pub lv: LogicalVolume,
    /// Name of the volume to create.
    pub new_name: String,
    /// Source path the cloned descriptor will reference.
    pub new_path: String,
}

/// Apply the plan to a deep copy of the template descriptor.
pub fn customized_descriptor(
    template: &DomainDescriptor,
    plan: &ClonePlan,
    opts: &CloneOpts,
) -> Result<DomainDescriptor> {
    let mut domain = template.clone();
    domain.set_name(&plan.name)?;
    // the hypervisor assigns a fresh UUID on define
    domain.clear_uuid()?;
    domain.set_description(&opts.desc);
    domain.set_vcpu(opts.cpus)?;
    let kib = (opts.mem * 1024.0 * 1024.0) as u64;
    domain.set_memory_kib(kib)?;
    domain.set_current_memory_kib(kib)?;
    domain.set_vnc_port(plan.vnc_port as u32)?;
    domain.fix_macs(plan.template_id, plan.id)?;
    Ok(domain)
}

/// Result of a clone transaction.
#[derive(Debug)]
pub enum CloneOutcome<'a> {
    /// The transaction completed, including teardown.
    Done,
    /// The transaction is paused awaiting the signed TLS certificate;
    /// resume or skip to run teardown.
    AwaitingCertificate(ClonePaused<'a>),
}

/// A clone transaction paused at the certificate suspension point.
///
/// The chroot is still mounted. [`ClonePaused::resume`] installs the signed
/// certificate and tears down; [`ClonePaused::skip`] tears down without it.
#[derive(Debug)]
pub struct ClonePaused<'a> {
    settings: &'a Settings,
    runner: CommandRunner<'a>,
    mounts: MountSet<'a>,
    pending: PendingCertificate,
    plan: ClonePlan,
    bootdisk: String,
    bootdisk_path: String,
}

impl ClonePaused<'_> {
    /// The certificate signing request to submit for signing.
    pub fn csr(&self) -> &str {
        self.pending.csr()
    }

    /// Install the signed certificate, then unmount and clean up.
    pub fn resume(self, cert_text: &str) -> Result<()> {
        let Self {
            settings,
            runner,
            mounts,
            pending,
            plan,
            bootdisk,
            bootdisk_path,
        } = self;
        pending.install(cert_text)?;
        teardown(runner, settings, mounts, &plan, &bootdisk, &bootdisk_path)
    }

    /// Unmount and clean up without installing a certificate.
    pub fn skip(self) -> Result<()> {
        let Self {
            settings,
            runner,
            mounts,
            plan,
            bootdisk,
            bootdisk_path,
            ..
        } = self;
        teardown(runner, settings, mounts, &plan, &bootdisk, &bootdisk_path)
    }
}

/// The clone transaction, driving every phase in order.
#[derive(Debug)]
pub struct CloneOrchestrator<'a, H, V> {
    settings: &'a Settings,
    runner: CommandRunner<'a>,
    volumes: V,
    directory: DomainDirectory<H>,
    opts: &'a CloneOpts,
}

impl<'a, H: Hypervisor, V: VolumeStore> CloneOrchestrator<'a, H, V> {
    /// Create an orchestrator over the given hypervisor, volume store and
    /// settings.
    pub fn new(settings: &'a Settings, hypervisor: H, volumes: V, opts: &'a CloneOpts) -> Self {
        Self {
            settings,
            runner: CommandRunner::new(settings),
            volumes,
            directory: DomainDirectory::new(hypervisor),
            opts,
        }
    }

    /// Run the transaction.
    ///
    /// Returns [`CloneOutcome::AwaitingCertificate`] when a TLS certificate
    /// request was generated; the caller supplies the signed certificate to
    /// finish. With `--no-tls` (or under dry-run) teardown happens here and
    /// the outcome is [`CloneOutcome::Done`].
    pub fn run(mut self) -> Result<CloneOutcome<'a>> {
        let (template, plan, mappings, bootdisk_path) = self.validate()?;

        info!("Copying libvirt XML configuration...");
        let mut domain = customized_descriptor(&template, &plan, self.opts)?;

        self.provision(&mut domain, &mappings)?;
        self.register(&domain)?;
        let (mounts, bootdisk) = self.mount_phase(&plan, &domain)?;
        let pending = self.customize_phase(&plan, &bootdisk, &bootdisk_path)?;

        match pending {
            Some(pending) => Ok(CloneOutcome::AwaitingCertificate(ClonePaused {
                settings: self.settings,
                runner: self.runner,
                mounts,
                pending,
                plan,
                bootdisk,
                bootdisk_path,
            })),
            None => {
                teardown(
                    self.runner,
                    self.settings,
                    mounts,
                    &plan,
                    &bootdisk,
                    &bootdisk_path,
                )?;
                Ok(CloneOutcome::Done)
            }
        }
    }

    /// Check every precondition before the first external mutation.
    ///
    /// The ordering is the main correctness property of the transaction:
    /// nothing is provisioned until every check has passed.
    fn validate(
        &mut self,
    ) -> Result<(DomainDescriptor, ClonePlan, Vec<VolumeMapping>, String)> {
        if !self.settings.dry_run && !rustix::process::geteuid().is_root() {
            return Err(Error::Precondition(
                "you need to be root to create a virtual machine".into(),
            ));
        }
        if self.settings.chroot.exists() {
            return Err(Error::Precondition(format!(
                "{}: chroot target exists",
                self.settings.chroot
            )));
        }
        if self.opts.mem.is_nan() || self.opts.mem <= 0.0 {
            return Err(Error::Precondition(format!(
                "memory must be positive, got {}",
                self.opts.mem
            )));
        }

        let template = self
            .directory
            .lookup(&LookupKey::Name(self.opts.from.clone()))?;
        if !self.opts.transfer && !template.state.is_shut_off() {
            return Err(Error::Precondition(format!(
                "VM {:?} is not shut off",
                self.opts.from
            )));
        }

        self.directory.list_all(true)?;
        if self.directory.contains(&self.opts.name) {
            return Err(Error::Precondition(format!(
                "domain {:?} already defined",
                self.opts.name
            )));
        }

        let xml = self.directory.hypervisor().dump_xml(&self.opts.from)?;
        let descriptor = DomainDescriptor::from_xml(&xml)?;
        let template_id = template_id_from(&descriptor)?;
        let plan = ClonePlan::new(
            self.settings,
            &self.opts.name,
            self.opts.id,
            &self.opts.from,
            template_id,
        )?;

        // the symlink mimicking the guest's boot disk will be created here
        let bootdisk_path = format!("/dev/{}", descriptor.boot_target()?);
        if Path::new(&bootdisk_path).exists() {
            return Err(Error::Precondition(format!(
                "{bootdisk_path} already exists"
            )));
        }

        let existing = self.volumes.index()?;
        let mut mappings = Vec::new();
        for old_path in descriptor.disk_paths() {
            let lv = self.volumes.display(&old_path)?;
            let new_name = plan.map_volume_name(&lv.name);
            if existing.contains_key(&(lv.vg.clone(), new_name.clone())) {
                return Err(Error::Precondition(format!(
                    "LV {} in VG {} is already defined",
                    new_name, lv.vg
                )));
            }
            let new_path = old_path.replace(&lv.name, &new_name);
            mappings.push(VolumeMapping {
                old_path,
                lv,
                new_name,
                new_path,
            });
        }

        Ok((descriptor, plan, mappings, bootdisk_path))
    }

    /// Create the target volumes, rewrite the descriptor's disk sources and
    /// copy disk contents.
    fn provision(
        &self,
        domain: &mut DomainDescriptor,
        mappings: &[VolumeMapping],
    ) -> Result<()> {
        for mapping in mappings {
            self.volumes
                .create(&mapping.lv.vg, &mapping.new_name, &mapping.lv.size)?;
            domain.replace_disk(&mapping.old_path, &mapping.new_path)?;

            if self.opts.transfer {
                println!(
                    "Transfer mode: copy {} to {} on this host yourself (e.g. dd over ssh).",
                    mapping.old_path, mapping.new_path
                );
                if !self.settings.dry_run {
                    let confirmed = dialoguer::Confirm::new()
                        .with_prompt("Disk contents copied?")
                        .default(false)
                        .interact()
                        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
                    if !confirmed {
                        return Err(Error::Precondition(
                            "disk copy not confirmed, aborting".into(),
                        ));
                    }
                }
            } else {
                info!("Copying LV {} to {}", mapping.old_path, mapping.new_path);
                self.runner.run(
                    &[
                        "dd".to_string(),
                        format!("if={}", mapping.old_path),
                        format!("of={}", mapping.new_path),
                        "bs=4M".to_string(),
                    ],
                    RunOpts::default(),
                )?;
            }
        }
        Ok(())
    }

    /// Define the new domain persistently. Irreversible: there is no undo
    /// path, a later abort leaves the domain defined.
    fn register(&self, domain: &DomainDescriptor) -> Result<()> {
        info!("Load new libvirt XML configuration");
        self.directory.hypervisor().define_xml(&domain.to_text()?)
    }

    /// Assemble the chroot: partition mappings, volume group, filesystem
    /// mounts and pseudo-filesystem binds.
    fn mount_phase(
        &self,
        plan: &ClonePlan,
        domain: &DomainDescriptor,
    ) -> Result<(MountSet<'a>, String)> {
        let bootdisk = domain.boot_disk()?;
        if !self.settings.dry_run {
            fs::create_dir_all(&self.settings.chroot)?;
        }

        info!("Detecting logical volumes");
        self.runner
            .run(&["kpartx", "-a", &bootdisk], RunOpts::default())?;
        self.runner.run(
            &["vgrename", &plan.template_lv_name, &plan.lv_name],
            RunOpts::default(),
        )?;
        self.runner
            .run(&["vgchange", "-a", "y", &plan.lv_name], RunOpts::default())?;

        info!("Mounting logical volumes...");
        let mut mounts = MountSet::new(self.runner);
        mounts.mount(
            &format!("/dev/{}/root", plan.lv_name),
            self.settings.chroot_dir(),
        )?;
        for dir in ["boot", "home", "usr", "var", "tmp"] {
            let dev = format!("/dev/{}/{}", plan.lv_name, dir);
            if Path::new(&dev).exists() {
                let target = self.settings.chroot.join(dir);
                info!("... mount {} {}", dev, target);
                mounts.mount(&dev, &target)?;
            }
        }

        info!("Mounting /dev, /dev/pts, /proc, /sys");
        mounts.bind("/dev/", &self.settings.chroot.join("dev"))?;
        mounts.bind("/dev/pts", &self.settings.chroot.join("dev/pts"))?;
        mounts.bind("/proc/", &self.settings.chroot.join("proc"))?;
        mounts.bind("/sys/", &self.settings.chroot.join("sys"))?;

        Ok((mounts, bootdisk))
    }

    /// Rewrite the guest's identity inside the chroot.
    ///
    /// Chdirs into the chroot for the duration; teardown chdirs back out.
    fn customize_phase(
        &self,
        plan: &ClonePlan,
        bootdisk: &str,
        bootdisk_path: &str,
    ) -> Result<Option<PendingCertificate>> {
        if !self.settings.dry_run {
            std::env::set_current_dir(&self.settings.chroot)?;
        }

        customize::install_service_inhibitor(&self.runner, self.settings)?;
        // symlink so the boot disk is visible under the guest's own name
        self.runner
            .run(&["ln", "-s", bootdisk, bootdisk_path], RunOpts::default())?;

        customize::update_hostname(&self.runner, plan)?;
        customize::update_backup_client(&self.runner, plan)?;
        customize::update_ip_addresses(&self.runner, plan)?;
        customize::update_munin(&self.runner, plan)?;
        customize::update_mac_rules(&self.runner, plan)?;
        customize::prepare_sshd(&self.runner, self.settings, plan)?;
        customize::update_grub(&self.runner, self.settings, plan, bootdisk_path)?;
        customize::update_system(&self.runner, self.opts.kind)?;
        customize::create_ssh_client_keys(&self.runner, plan)?;

        if self.opts.no_tls || self.settings.dry_run {
            return Ok(None);
        }
        let pending = customize::create_tls_csr(&self.runner, self.settings, plan)?;
        Ok(Some(pending))
    }
}

/// Unwind the transaction's host-side state: inhibitor, symlink, mounts,
/// volume group activation, partition mappings, chroot directory.
fn teardown(
    runner: CommandRunner<'_>,
    settings: &Settings,
    mut mounts: MountSet<'_>,
    plan: &ClonePlan,
    bootdisk: &str,
    bootdisk_path: &str,
) -> Result<()> {
    info!("Done, cleaning up.");
    runner.run(&["rm", bootdisk_path], RunOpts::default())?;
    runner.run(&["rm", POLICY_RC_D], RunOpts::default())?;

    if !settings.dry_run {
        std::env::set_current_dir("/")?;
    }
    mounts.unmount_all()?;
    runner.run(&["vgchange", "-a", "n", &plan.lv_name], RunOpts::default())?;
    runner.run(&["kpartx", "-d", bootdisk], RunOpts::default())?;

    debug!("- rmdir {}", settings.chroot);
    if !settings.dry_run {
        fs::remove_dir(&settings.chroot)?;
    }
    Ok(())
}

/// Entry point for the clone command: wires the orchestrator to virsh and
/// feeds the certificate suspension point from standard input.
pub fn run(opts: CloneOpts, connect: Option<String>) -> color_eyre::Result<()> {
    let settings = Settings {
        dry_run: opts.dry_run,
        chroot: opts.chroot.clone(),
        connect,
        ..Default::default()
    };
    let runner = CommandRunner::new(&settings);
    let hypervisor = VirshHypervisor::new(runner);
    let volumes = VolumeManager::new(runner);

    debug!("Creating VM {}...", opts.name);
    let orchestrator = CloneOrchestrator::new(&settings, hypervisor, volumes, &opts);
    match orchestrator.run().wrap_err("clone transaction failed")? {
        CloneOutcome::Done => {}
        CloneOutcome::AwaitingCertificate(paused) => {
            println!("Submit this certificate signing request to the CA:");
            println!("{}", paused.csr());
            println!("... then paste the signed certificate, ending with {END_CERTIFICATE}");
            let mut cert = String::new();
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = line?;
                let line = line.trim();
                cert.push_str(line);
                cert.push('\n');
                if line == END_CERTIFICATE {
                    break;
                }
            }
            paused
                .resume(&cert)
                .wrap_err("certificate installation failed")?;
        }
    }
    Ok(())
}
