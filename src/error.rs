//! Crate-wide error types
//!
//! Each subsystem owns a leaf `thiserror` enum; `anyhow` is reserved for
//! the CLI boundary in `main.rs` where we just need to print and exit.

use thiserror::Error;

/// Errors returned by resource pools (network, port, user).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool exhausted")]
    Exhausted,

    #[error("invalid start value: {0}")]
    InvalidStart(String),

    #[error("invalid pool size: {0}")]
    InvalidSize(String),
}

/// Errors returned by the container registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("container is already registered")]
    AlreadyRegistered,

    #[error("container is not registered")]
    NotRegistered,
}

/// Errors from the wire protocol codec.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame length: {0}")]
    BadLength(String),

    #[error("malformed frame terminator")]
    BadTerminator,

    #[error("payload decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Errors from job spawn/link.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("spawner exited before reporting child_pid")]
    SpawnerEarlyExit,

    #[error("spawner exited before reporting child active")]
    SpawnerNotActive,
}

/// Errors from container actor dispatch.
#[derive(Debug, Error)]
pub enum ActorError {
    #[error("container not in a valid state for this request")]
    InvalidState,

    #[error("container no longer accepting requests")]
    NotAccepting,

    #[error("unknown job id: {0}")]
    UnknownJob(u32),

    #[error("script failed: {0}")]
    ScriptFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("resource pool exhausted")]
    PoolExhausted,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}
