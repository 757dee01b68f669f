use crate::cli::load_service_config;
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct ServiceSubcommands {
    #[clap(subcommand)]
    command: ServiceCommands,
}

#[derive(Debug, Subcommand)]
enum ServiceCommands {
    /// Start the turbine service: restores any builds persisted by a previous run, serves the
    /// HTTP façade, and persists the still-running set again on shutdown.
    Start {
        /// Overrides the config file turbine otherwise looks for at `/etc/turbine/turbine.toml`.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

pub async fn handle(command: ServiceSubcommands) -> Result<()> {
    match command.command {
        ServiceCommands::Start { config } => {
            let conf = load_service_config(config)?;
            crate::api::run(conf).await
        }
    }
}
