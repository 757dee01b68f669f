//! The `turbine` binary's command-line surface: a top-level `Parser` dispatching to
//! `Subcommand` variants (`clap`'s derive API) over a single area of responsibility, booting
//! the service, with layered configuration loading (`conf::Configuration::load`: CLI flag
//! overriding config file overriding bundled default).

mod service;

use crate::conf::{service::ServiceConfig, Configuration};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

/// turbine runs declarative builds inside isolated containers, streaming their output to
/// subscribers and resuming in-flight builds across restarts.
#[derive(Debug, Parser)]
#[command(name = "turbine")]
#[command(bin_name = "turbine")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage the turbine service process.
    Service(service::ServiceSubcommands),
}

/// Parses arguments and runs the requested subcommand, exiting the process with a nonzero code
/// and a printed panic report on unrecoverable failure.
pub async fn init() {
    human_panic::setup_panic!();

    if let Err(e) = run().await {
        eprintln!("error: {e:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Service(command) => service::handle(command).await,
    }
}

/// Loads [`ServiceConfig`] from the bundled default, an optional file, and `TURBINE_`-prefixed
/// environment variables, in that precedence order.
pub fn load_service_config(path_override: Option<std::path::PathBuf>) -> Result<ServiceConfig> {
    Configuration::<ServiceConfig>::load(path_override).context("could not load service configuration")
}
