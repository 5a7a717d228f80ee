use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// g2a: inspect and maintain the gateway's config and credential store
#[derive(Parser)]
#[command(name = "g2a", version, about)]
pub struct Cli {
    /// Lock wait in seconds (overrides STORAGE_LOCK_TIMEOUT_SECS)
    #[arg(long, global = true)]
    pub lock_timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the active backend, its health and what it holds
    Status,

    /// Read or update the configuration document
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Manage the credential pools
    Tokens {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Copy DATA_DIR into a backend that was never initialised
    Seed,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the stored document as JSON
    Show,
    /// Merge a TOML or JSON file into the stored document
    Import {
        file: PathBuf,
        /// Replace the whole document instead of merging
        #[arg(long)]
        replace: bool,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// List pools and their members
    List {
        #[arg(long)]
        pool: Option<String>,
    },
    /// Add or update tokens from a file: a JSON list of tokens/records,
    /// or one token per line
    Import {
        #[arg(long)]
        pool: String,
        file: PathBuf,
    },
    /// Delete tokens from every pool
    Remove {
        #[arg(required = true)]
        tokens: Vec<String>,
    },
}
