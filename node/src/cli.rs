//! # CLI Interface
//!
//! Command-line structure for `x402-node`, built with `clap` derive. The
//! daemon (`run`) drives the escrow expiry sweeper and serves health and
//! metrics; the remaining subcommands are one-shot operator tools that open
//! the same data directory.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// x402 authorization operator daemon.
///
/// Sweeps expired escrow locks, exposes Prometheus metrics and a health
/// check, and onboards bank credentials into the encrypted vault.
#[derive(Parser, Debug)]
#[command(
    name = "x402-node",
    about = "x402 authorization, escrow and credential vault operator",
    version,
    propagate_version = true
)]
pub struct X402NodeCli {
    /// Path to the configuration file (TOML).
    ///
    /// When omitted, `config.toml` inside the data directory is used if it
    /// exists, otherwise built-in defaults.
    #[arg(long, short = 'c', env = "X402_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory holding the database and key file.
    #[arg(long, short = 'd', env = "X402_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum, env = "X402_LOG_FORMAT", default_value_t = LogFormat::Pretty, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the daemon: expiry sweeper plus health/metrics server.
    Run(RunArgs),
    /// Create a data directory with a default config and a fresh vault
    /// master key.
    Init(InitArgs),
    /// Print escrow statistics as JSON.
    Stats,
    /// Print today's and this week's committed spend as JSON.
    Spending,
    /// Run one expiry sweep and exit.
    Sweep,
    /// List escrow funding that failed to authorize and could not be
    /// returned to the payer.
    Stranded,
    /// Manage bank credentials in the vault.
    #[command(subcommand)]
    Credentials(CredentialCommands),
    /// Print version information and exit.
    Version,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Address for the health and metrics server.
    #[arg(long, env = "X402_LISTEN_ADDR", default_value = "127.0.0.1")]
    pub listen_addr: String,

    /// Port for the health and metrics server.
    #[arg(long, env = "X402_METRICS_PORT", default_value_t = 9402)]
    pub metrics_port: u16,

    /// Override the configured sweep interval, in seconds.
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing config and key file.
    #[arg(long)]
    pub force: bool,

    /// Business id whose funds this instance commits.
    #[arg(long, default_value = "default")]
    pub payer_id: String,
}

#[derive(Subcommand, Debug)]
pub enum CredentialCommands {
    /// Encrypt and store an owner's bank details.
    ///
    /// The routing and account numbers are read from X402_ROUTING_NUMBER and
    /// X402_ACCOUNT_NUMBER when set, otherwise from stdin, one per line.
    Store(StoreCredentialArgs),
    /// Show the non-sensitive view of an owner's stored credentials.
    Info {
        owner_id: String,
    },
    /// Delete an owner's stored credentials.
    Delete {
        owner_id: String,
    },
    /// Print the credential audit trail, optionally for one owner.
    Audit {
        owner_id: Option<String>,
    },
}

#[derive(Args, Debug)]
pub struct StoreCredentialArgs {
    pub owner_id: String,

    /// Name on the account.
    #[arg(long)]
    pub name: String,

    #[arg(long)]
    pub bank_name: Option<String>,
}
