//! inspect command - show a parsed domain descriptor summary

use clap::Parser;
use color_eyre::eyre::Context as _;
use color_eyre::Result;
use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;

use crate::cmdrun::CommandRunner;
use crate::common_opts::OutputFormat;
use crate::config::Settings;
use crate::descriptor::DomainDescriptor;
use crate::directory::{DomainDirectory, LookupKey};
use crate::virsh::{Hypervisor as _, VirshHypervisor};

/// Options for inspecting a domain
#[derive(Debug, Parser)]
pub struct InspectOpts {
    /// Name of the domain to inspect
    pub name: String,

    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,

    /// Print the raw domain XML instead of a summary
    #[clap(long)]
    pub xml: bool,
}

/// Flattened view of a domain descriptor.
#[derive(Debug, Serialize)]
pub struct DomainSummary {
    /// Domain name.
    pub name: String,
    /// Domain UUID, empty when not yet assigned.
    pub uuid: String,
    /// Free-form description, if any.
    pub description: Option<String>,
    /// Power state text.
    pub state: String,
    /// Number of virtual CPUs.
    pub vcpus: u32,
    /// Memory allocation in KiB.
    pub memory_kib: u64,
    /// VNC port, absent when no VNC graphics device is configured.
    pub vnc_port: Option<u16>,
    /// Block disk source paths, in declaration order.
    pub disks: Vec<String>,
    /// Interface MAC addresses, in declaration order.
    pub macs: Vec<String>,
}

impl DomainSummary {
    /// Build a summary from a parsed descriptor and its observed state.
    pub fn from_descriptor(descriptor: &DomainDescriptor, state: &str) -> Result<Self> {
        Ok(Self {
            name: descriptor.name()?.to_string(),
            uuid: descriptor.uuid().unwrap_or_default().to_string(),
            description: descriptor.description().map(String::from),
            state: state.to_string(),
            vcpus: descriptor.vcpu()?,
            memory_kib: descriptor.memory_kib()?,
            vnc_port: descriptor.vnc_port().ok(),
            disks: descriptor.disk_paths(),
            macs: descriptor.macs(),
        })
    }
}

/// Execute the inspect command
pub fn run(opts: InspectOpts, connect: Option<String>) -> Result<()> {
    let settings = Settings {
        connect,
        ..Default::default()
    };
    let runner = CommandRunner::new(&settings);
    let hypervisor = VirshHypervisor::new(runner);
    let mut directory = DomainDirectory::new(hypervisor);

    let domain = directory
        .lookup(&LookupKey::Name(opts.name.clone()))
        .with_context(|| format!("domain {:?} not found", opts.name))?;
    let xml = hypervisor
        .dump_xml(&opts.name)
        .with_context(|| format!("Failed to dump XML for {:?}", opts.name))?;
    let descriptor = DomainDescriptor::from_xml(&xml)?;
    if opts.xml {
        println!("{}", descriptor.to_text()?);
        return Ok(());
    }
    let summary = DomainSummary::from_descriptor(&descriptor, domain.state.as_str())?;

    match opts.format {
        OutputFormat::Table => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.add_row(vec!["Name", &summary.name]);
            table.add_row(vec!["UUID", &summary.uuid]);
            if let Some(description) = &summary.description {
                table.add_row(vec!["Description", description]);
            }
            table.add_row(vec!["State", &summary.state]);
            table.add_row(vec!["VCPUs", &summary.vcpus.to_string()]);
            table.add_row(vec!["Memory (KiB)", &summary.memory_kib.to_string()]);
            if let Some(port) = summary.vnc_port {
                table.add_row(vec!["VNC port", &port.to_string()]);
            }
            table.add_row(vec!["Disks", &summary.disks.join("\n")]);
            table.add_row(vec!["MACs", &summary.macs.join("\n")]);
            println!("{}", table);
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&summary)
                    .with_context(|| "Failed to serialize domain as JSON")?
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_summary_from_descriptor() {
        let xml = indoc! {r#"
            <domain type="kvm">
              <name>jessie</name>
              <uuid>f5b8c05b-9c7a-3211-49b9-2bd635f7e2aa</uuid>
              <memory unit="KiB">1048576</memory>
              <currentMemory unit="KiB">1048576</currentMemory>
              <vcpu>2</vcpu>
              <devices>
                <disk type="block" device="disk">
                  <source dev="/dev/vg0/vm_jessie"/>
                  <target dev="vda" bus="virtio"/>
                </disk>
                <interface type="bridge">
                  <mac address="02:00:00:00:00:89"/>
                  <source bridge="br0"/>
                </interface>
                <graphics type="vnc" port="5989"/>
              </devices>
            </domain>
        "#};
        let descriptor = DomainDescriptor::from_xml(xml).unwrap();
        let summary = DomainSummary::from_descriptor(&descriptor, "shut off").unwrap();
        assert_eq!(summary.name, "jessie");
        assert_eq!(summary.vcpus, 2);
        assert_eq!(summary.memory_kib, 1048576);
        assert_eq!(summary.vnc_port, Some(5989));
        assert_eq!(summary.disks, vec!["/dev/vg0/vm_jessie"]);
        assert_eq!(summary.macs, vec!["02:00:00:00:00:89"]);
        assert_eq!(summary.state, "shut off");
    }
}
