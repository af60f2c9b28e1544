//! CLI definitions using clap.

use crate::model::MergePolicy;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

pub mod commands;

/// Supported shells for completion generation.
#[derive(ValueEnum, Clone, Debug)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

/// VaultSync - one-way markdown vault to knowledge-base sync
#[derive(Parser, Debug)]
#[command(name = "vaultsync", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// State database path (default: ~/.vaultsync/data/vaultsync.db)
    #[arg(long, global = true, env = "VAULTSYNC_DB")]
    pub db: Option<PathBuf>,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize the state database
    Init {
        /// Overwrite an existing database
        #[arg(long)]
        force: bool,
    },

    /// Watch a vault and sync continuously until interrupted
    Run(SyncArgs),

    /// Run one full reconcile pass and exit
    Reconcile(SyncArgs),

    /// Show tracked record counts and engine state
    Status,

    /// List collections on the remote store
    Collections {
        #[command(flatten)]
        api: ApiArgs,
    },

    /// Inspect and replay dead-lettered operations
    Deadletter {
        #[command(subcommand)]
        command: DeadletterCommands,
    },

    /// Print version information
    Version,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Remote API connection arguments.
#[derive(Args, Debug)]
pub struct ApiArgs {
    /// Remote API base URL
    #[arg(long, env = "VAULTSYNC_API_URL")]
    pub api_url: String,

    /// Bearer token for the remote API
    #[arg(long, env = "VAULTSYNC_API_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

/// Arguments shared by `run` and `reconcile`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Vault root directory
    pub root: PathBuf,

    #[command(flatten)]
    pub api: ApiArgs,

    /// Collection for files directly under the vault root
    #[arg(long, default_value = "general")]
    pub collection: String,

    /// What to do when local and remote both changed
    #[arg(long, value_enum, default_value_t)]
    pub merge_policy: MergePolicy,

    /// Debounce window for coalescing event bursts, in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub debounce_ms: u64,

    /// Maximum concurrent in-flight operations
    #[arg(long, default_value_t = 8)]
    pub concurrency: usize,
}

#[derive(Subcommand, Debug)]
pub enum DeadletterCommands {
    /// List dead-lettered operations, newest first
    List {
        /// Maximum entries to show
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Re-drive the file behind a dead-letter entry through the engine
    Replay {
        /// Dead-letter entry id
        id: String,

        /// Vault root directory
        root: PathBuf,

        #[command(flatten)]
        api: ApiArgs,
    },

    /// Delete all dead-letter entries
    Purge,
}
