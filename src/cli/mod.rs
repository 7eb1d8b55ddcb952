//! CLI module for Huddle
//!
//! Provides commands:
//! - `serve`: Run the collaboration server
//! - `config`: Print the effective configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod config;

/// Huddle collaborative canvas server
#[derive(Parser, Debug)]
#[command(name = "huddle")]
#[command(about = "Real-time collaborative canvas server")]
#[command(version)]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Extra configuration file applied over the config directory
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the server
    Serve {
        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the effective configuration as TOML
    Config,
}

/// Run the CLI command
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Some(Commands::Serve { port }) => {
            let mut config = crate::server::load_config(cli.config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            crate::server::run(config).await
        }
        Some(Commands::Config) => config::run(cli.config.as_deref()),
        None => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            cmd.print_help()?;
            println!();
            Ok(())
        }
    }
}
