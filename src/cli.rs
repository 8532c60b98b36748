//! Command-line interface for the node agent.
//!
//! Uses clap with derive for type-safe CLI parsing. This is the
//! administrative surface an operator uses directly on the box; the
//! HTTP/REST facade (out of scope here) is a much richer cousin of it.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sylved")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Node configuration file path
    #[arg(short, long, default_value = "sylved.toml")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Guest lifecycle (jails and VMs)
    Guest {
        #[command(subcommand)]
        action: GuestAction,
    },

    /// Guest-scoped ZFS snapshots
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Cross-node dataset replication
    Replicate {
        #[command(subcommand)]
        action: ReplicateAction,
    },

    /// Cron-scheduled backup jobs
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Attach to a running jail's shell or a VM's nmdm serial console.
    /// Ctrl-] detaches and kills the session (VM consoles only).
    Console {
        /// Guest ctid/rid
        rid: u64,

        /// User to run as (jails only)
        #[arg(short, long, default_value = "root")]
        user: String,
    },

    /// Runs the replication QUIC server and backup scheduler in the foreground
    Serve,

    /// Generate shell completion script
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum GuestAction {
    /// Start a guest (or all guests with --all), respecting boot order
    Up {
        rid: Option<u64>,
        #[arg(long, conflicts_with = "rid")]
        all: bool,
    },
    /// Stop a guest (or all guests with --all), respecting reverse boot order
    Down {
        rid: Option<u64>,
        #[arg(long, conflicts_with = "rid")]
        all: bool,
    },
    /// Restart a guest
    Restart { rid: u64 },
    /// List guests and their running state
    Ps {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum SnapshotAction {
    /// Create a snapshot of a guest's root dataset
    Create {
        rid: u64,
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Roll a guest back to a snapshot
    Rollback {
        rid: u64,
        snapshot: String,
        #[arg(long)]
        force: bool,
    },
    /// Delete a snapshot
    Delete { rid: u64, snapshot: String },
    /// List a guest's snapshots
    List {
        rid: u64,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum ReplicateAction {
    /// Push a dataset to a peer node
    Push {
        source_dataset: String,
        destination_dataset: String,
        target: String,
    },
    /// Pull a dataset from a peer node
    Pull {
        remote_dataset: String,
        destination_dataset: String,
        target: String,
    },
    /// Query a peer node's snapshot inventory
    Status { target: String, dataset: String },
}

#[derive(Subcommand)]
pub enum BackupAction {
    /// Trigger a manual run of a backup job
    Run { job_id: u64 },
    /// List configured backup jobs and their last/next run
    List {
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    pub fn generate_completion(shell: Shell) {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
    }
}
