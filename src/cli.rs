// src/cli.rs

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "depot-transfer")]
#[command(author, version, about = "Cross-server data migration for the Depot platform", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Transfer all files of a source server to a target server
    Transfer(TransferArgs),
    /// List the servers configured in the registry
    Servers {
        /// Registry file (default: ~/.depot/servers.json)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
pub struct TransferArgs {
    /// Source server id from the registry
    #[arg(long)]
    pub source: String,

    /// Target server id from the registry
    #[arg(long)]
    pub target: String,

    /// Registry file (default: ~/.depot/servers.json)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Repository patterns to include (repeatable; default: all)
    #[arg(long = "include-repos")]
    pub include_repos: Vec<String>,

    /// Repository patterns to exclude (repeatable)
    #[arg(long = "exclude-repos")]
    pub exclude_repos: Vec<String>,

    /// Number of worker threads
    #[arg(long)]
    pub threads: Option<usize>,

    /// Skip uploading content whose checksum already exists in the
    /// target filestore
    #[arg(long)]
    pub filestore: bool,

    /// Traverse and plan without transferring anything
    #[arg(long)]
    pub dry_run: bool,

    /// Directory for state, snapshots and outcome logs
    /// (default: ~/.depot/transfer)
    #[arg(long)]
    pub transfer_dir: Option<PathBuf>,
}
