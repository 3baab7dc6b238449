//! CLI for the bin throttler.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use throttle_core::config::{self, ThrottlerConfig};

use commands::{run_check, run_simulate};

/// Top-level CLI for the bin throttler.
#[derive(Debug, Parser)]
#[command(name = "throttlectl")]
#[command(about = "Inspect throttle rules and exercise them under load", long_about = None)]
pub struct Cli {
    /// Config file to use instead of ~/.config/throttler/config.toml.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Validate the config and show the limits each bin resolves to.
    Check {
        /// Bin name to resolve against every group (repeatable).
        #[arg(long = "bin", value_name = "NAME")]
        bins: Vec<String>,
    },

    /// Run worker threads against a group and check the quotas held.
    Simulate(SimulateArgs),
}

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Group type, e.g. the connector kind.
    #[arg(long)]
    pub group_type: String,

    /// Throttle group name.
    #[arg(long)]
    pub group: String,

    /// Bin every simulated connection belongs to (repeatable).
    #[arg(long = "bin", value_name = "NAME", required = true)]
    pub bins: Vec<String>,

    #[arg(long, default_value = "10", value_name = "N")]
    pub workers: usize,

    /// Connections each worker obtains and returns.
    #[arg(long, default_value = "3", value_name = "N")]
    pub cycles: usize,

    /// Fetches per connection.
    #[arg(long, default_value = "3", value_name = "N")]
    pub fetches: usize,

    /// Reads per fetch.
    #[arg(long, default_value = "3", value_name = "N")]
    pub reads: usize,

    /// Bytes requested per read.
    #[arg(long, default_value = "1000", value_name = "BYTES")]
    pub read_bytes: u64,

    /// Print the full report, including the event log, as JSON.
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    fn load_config(&self) -> Result<ThrottlerConfig> {
        let cfg = match &self.config {
            Some(path) => ThrottlerConfig::load_from_path(path)?,
            None => config::load_or_init()?,
        };
        tracing::debug!("loaded config: {:?}", cfg);
        Ok(cfg)
    }
}

impl CliCommand {
    pub fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = cli.load_config()?;

        match cli.command {
            CliCommand::Check { bins } => run_check(&cfg, &bins)?,
            CliCommand::Simulate(args) => run_simulate(&cfg, &args)?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
