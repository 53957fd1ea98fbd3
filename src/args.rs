//! Command line surface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "conductor", version, about = "Local process orchestration daemon")]
pub struct Cli {
    /// Daemon socket path (defaults to $CONDUCTOR_SOCKET or the config dir)
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage the daemon itself
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// List managed processes and their states
    List,
    /// Start a defined process, or define and start one ad hoc
    Start {
        /// Process name
        name: String,
        /// Command to run, for a process not in the config file
        #[arg(long)]
        command: Option<String>,
        /// Arguments for --command
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Stop a running process
    Stop {
        name: String,
        /// Kill immediately instead of asking nicely first
        #[arg(long)]
        force: bool,
    },
    /// Stop then start a process
    Restart { name: String },
    /// Remove a process and its captured logs
    Delete { name: String },
    /// Show captured output of a process
    Logs {
        name: String,
        /// Number of trailing lines to show
        #[arg(short = 'n', long, default_value_t = 100)]
        lines: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum DaemonAction {
    /// Run the daemon in the foreground
    Run,
    /// Query a running daemon for version, pid and uptime
    Status,
    /// Ask a running daemon to shut down
    Shutdown,
}
