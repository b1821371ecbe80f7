//! vmclone CLI entry point.

use clap::{Parser, Subcommand};
use color_eyre::{Report, Result};

use vmclone::{clone, inspect, list, list_volumes};

/// Clone libvirt virtual machines from an LVM-backed template.
///
/// Copies a template domain's definition and logical volumes, rewrites the
/// new guest's identity inside a temporary chroot, and registers the result
/// with libvirt.
#[derive(Debug, Parser)]
struct Cli {
    /// Hypervisor connection URI passed to virsh as -c
    #[clap(long, short = 'c', global = true)]
    connect: Option<String>,

    /// Increase log verbosity (repeatable)
    #[clap(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Debug, Subcommand)]
enum Commands {
    /// Clone a template into a new virtual machine
    Clone(clone::CloneOpts),

    /// List defined domains
    List(list::ListOpts),

    /// List LVM logical volumes
    #[clap(name = "list-volumes")]
    ListVolumes(list_volumes::ListVolumesOpts),

    /// Show a parsed summary of a domain's configuration
    Inspect(inspect::InspectOpts),
}

/// Install and configure the tracing/logging system.
///
/// Logs are filtered by the RUST_LOG environment variable when set;
/// otherwise each -v raises the default level one step from warn.
fn install_tracing(verbose: u8) {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    let cli = Cli::parse();
    install_tracing(cli.verbose);
    color_eyre::install()?;

    match cli.command {
        Commands::Clone(opts) => clone::run(opts, cli.connect)?,
        Commands::List(opts) => list::run(opts, cli.connect)?,
        Commands::ListVolumes(opts) => list_volumes::run(opts, cli.connect)?,
        Commands::Inspect(opts) => inspect::run(opts, cli.connect)?,
    }
    tracing::debug!("exiting");
    Ok(())
}
