//! Command line arguments for the two binaries, as parsed by [`clap`].
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// `taskmaster-server`: launches, monitors and remotely controls shell-command tasks.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct ServerArgs {
    /// YAML file describing the tasks to supervise.
    pub config_file: PathBuf,

    /// Tee log output to this file in addition to stderr.
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Port the RPC listener binds to.
    #[arg(short = 'p', long = "port", default_value_t = 50051)]
    pub port: u16,

    /// Allow starting as uid 0.
    #[arg(long = "allow-root")]
    pub allow_root: bool,

    /// Default log level filter, overridable per-module via `RUST_LOG`.
    #[arg(short = 'L', long = "log-level", default_value = "info")]
    pub log_level: String,
}

/// `taskmaster-ctl`: a one-shot or interactive client for a running server.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct ClientArgs {
    /// Address of the server's RPC listener.
    #[arg(default_value = "localhost:50051")]
    pub address: String,

    #[command(subcommand)]
    pub command: Option<ClientCommand>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ClientCommand {
    /// Start the named task's instances (all replicas if none are given).
    Start { name: String, ids: Vec<u32> },
    /// Stop the named task's instances (all replicas if none are given).
    Stop { name: String, ids: Vec<u32> },
    /// Restart the named task's instances (all replicas if none are given).
    Restart { name: String, ids: Vec<u32> },
    /// Report the current stage of every instance of the named task, or every task.
    Status { name: Option<String> },
    /// List every task known to the server.
    List,
    /// Reload the server's configuration file.
    Reload,
    /// Shut the server down.
    Shutdown,
}
