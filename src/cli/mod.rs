pub mod commands;
pub mod config;

use std::path::PathBuf;
use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatch engine and the completion-report endpoint
    Scheduler {
        /// Configuration file (defaults to the per-user config)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run a fetch worker pool and its intake endpoint
    Fetcher {
        /// Configuration file (defaults to the per-user config)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the number of fetch workers
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Show the configuration, or write a default one
    Config {
        /// Configuration file (defaults to the per-user config)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write the default configuration instead of showing it
        #[arg(long)]
        init: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Scheduler { config } => {
            info!("Starting scheduler");
            commands::scheduler(config).await
        },
        Commands::Fetcher { config, workers } => {
            info!("Starting fetcher");
            commands::fetcher(config, workers).await
        },
        Commands::Config { config, init } => {
            if init {
                commands::init_config(config)
            } else {
                commands::show_config(config)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_parse_fetcher_with_global_flags() {
        let cli = Cli::try_parse_from([
            "dispatcher", "fetcher", "--config", "/etc/dispatch.yaml", "--workers", "8", "--verbose",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Fetcher { config, workers } => {
                assert_eq!(config, Some(PathBuf::from("/etc/dispatch.yaml")));
                assert_eq!(workers, Some(8));
            },
            _ => panic!("expected the fetcher command"),
        }
    }
}
