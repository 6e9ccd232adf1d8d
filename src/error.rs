use thiserror::Error;

use crate::config::ConfigError;
use crate::event::channel::EventPublisherError;

/// Errors raised spawning or redirecting an instance's process.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to open redirection file `{path}`: {source}")]
    Redirection {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors raised delivering a POSIX signal to an instance's process.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("failed to signal process {pid}: {source}")]
    Kill {
        pid: i32,
        #[source]
        source: nix::Error,
    },
}

/// Errors raised decoding or dispatching an RPC frame.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown method `{0}`")]
    UnknownMethod(String),
}

/// Top-level error aggregation returned by the binaries' `main`.
#[derive(Debug, Error)]
pub enum TaskmasterError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("refusing to run as root without --allow-root")]
    RefusedRoot,

    #[error("error publishing event: {0}")]
    EventPublisher(#[from] EventPublisherError),
}
