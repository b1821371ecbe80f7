//! list-volumes command - enumerate LVM logical volumes
//!
//! Shows every logical volume visible to the host, the raw material domain
//! clones are provisioned from.

use clap::Parser;
use color_eyre::eyre::Context as _;
use color_eyre::Result;
use comfy_table::{presets::UTF8_FULL, Table};

use crate::cmdrun::CommandRunner;
use crate::common_opts::OutputFormat;
use crate::config::Settings;
use crate::lvm::VolumeManager;

/// Options for listing logical volumes
#[derive(Debug, Parser)]
pub struct ListVolumesOpts {
    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,

    /// Only show volumes in this volume group
    #[clap(long)]
    pub vg: Option<String>,
}

/// Execute the list-volumes command
pub fn run(opts: ListVolumesOpts, connect: Option<String>) -> Result<()> {
    let settings = Settings {
        connect,
        ..Default::default()
    };
    let runner = CommandRunner::new(&settings);
    let volumes = VolumeManager::new(runner);

    let mut records = volumes
        .list()
        .with_context(|| "Failed to list logical volumes")?;
    if let Some(vg) = &opts.vg {
        records.retain(|lv| &lv.vg == vg);
    }

    match opts.format {
        OutputFormat::Table => {
            if records.is_empty() {
                println!("No logical volumes found");
                return Ok(());
            }
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["LV", "VG", "SIZE", "ATTR", "PATH"]);
            for lv in &records {
                table.add_row(vec![&lv.name, &lv.vg, &lv.size, &lv.attr, &lv.path()]);
            }
            println!("{}", table);
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&records)
                    .with_context(|| "Failed to serialize volumes as JSON")?
            );
        }
    }
    Ok(())
}
