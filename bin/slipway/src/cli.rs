use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Output format of the `status` command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Parser)]
#[command(name = "slipway")]
#[command(
    author,
    version,
    about = "Deploy and verify smart contracts, idempotently, across networks"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "SLIPWAY_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the configuration file.
    ///
    /// Defaults to ./Slipway.toml. A missing file falls back to the built-in networks.
    #[arg(short, long, global = true, alias = "conf", env = "SLIPWAY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Deploy one or more contracts to a network.
    ///
    /// Contracts already deployed with the same bytecode are not broadcast again.
    Deploy {
        /// The network name, as configured.
        #[arg(env = "SLIPWAY_NETWORK")]
        network: String,

        /// The contract names to deploy.
        #[arg(required = true)]
        contracts: Vec<String>,
    },

    /// Verify the source of a deployed contract on the network's explorer.
    Verify {
        /// The network name, as configured.
        #[arg(env = "SLIPWAY_NETWORK")]
        network: String,

        /// The contract name.
        contract: String,
    },

    /// Deploy a contract against a disposable local fork of a network.
    ///
    /// Results are advisory and never written to the artifact store.
    Rehearse {
        /// The upstream network to fork.
        #[arg(env = "SLIPWAY_NETWORK")]
        network: String,

        /// The contract name.
        contract: String,
    },

    /// Show the recorded deployments and verifications.
    Status {
        /// Only show records of this network.
        network: Option<String>,

        /// Output format.
        #[arg(long, env = "SLIPWAY_FORMAT", default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// List the configured networks.
    Networks,

    /// Write a default configuration file.
    Init {
        /// Overwrite an existing configuration file.
        #[arg(long, env = "SLIPWAY_FORCE")]
        force: bool,
    },
}
