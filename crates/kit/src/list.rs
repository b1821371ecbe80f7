//! list command - enumerate defined domains
//!
//! Shows every domain known to the hypervisor together with its numeric id
//! (when running) and power state.

use clap::Parser;
use color_eyre::eyre::Context as _;
use color_eyre::Result;
use comfy_table::{presets::UTF8_FULL, Table};

use crate::cmdrun::CommandRunner;
use crate::common_opts::OutputFormat;
use crate::config::Settings;
use crate::directory::{Domain, DomainDirectory};
use crate::virsh::VirshHypervisor;

/// Options for listing domains
#[derive(Debug, Parser)]
pub struct ListOpts {
    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,

    /// Only show domains that are shut off
    #[clap(long)]
    pub inactive: bool,
}

fn render(domains: &[Domain], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            if domains.is_empty() {
                println!("No domains found");
                return Ok(());
            }
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["NAME", "ID", "STATE"]);
            for domain in domains {
                let id = domain
                    .id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                table.add_row(vec![&domain.name, &id, &domain.state.as_str().to_string()]);
            }
            println!("{}", table);
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(domains)
                    .with_context(|| "Failed to serialize domains as JSON")?
            );
        }
    }
    Ok(())
}

/// Execute the list command
pub fn run(opts: ListOpts, connect: Option<String>) -> Result<()> {
    let settings = Settings {
        connect,
        ..Default::default()
    };
    let runner = CommandRunner::new(&settings);
    let mut directory = DomainDirectory::new(VirshHypervisor::new(runner));

    let mut domains = directory
        .list_all(false)
        .with_context(|| "Failed to list domains")?;
    if opts.inactive {
        domains.retain(|d| d.state.is_shut_off());
    }
    render(&domains, opts.format)
}
