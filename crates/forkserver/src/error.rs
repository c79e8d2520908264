// crates/forkserver/src/error.rs
use std::io;

use thiserror::Error;

/// Rejected start-mode configuration. Recoverable: surfaces at the
/// configuration boundary and never touches a running helper.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid forkserver start mode: {0}")]
    InvalidMode(String),
}

/// A step of bringing up the helper failed. There is no degraded mode: a
/// half-started helper cannot uphold the sandboxing contract, so callers
/// must treat this as fatal for the process.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("cannot obtain helper image: {0}")]
    Image(io::Error),
    #[error("cannot create channel: {0}")]
    ChannelPair(io::Error),
    #[error("cannot create process: {0}")]
    Fork(nix::Error),
}

/// Errors surfaced by the supervisor's operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Startup(#[from] StartupError),
    /// A handle was required but starting was not permitted and none was
    /// running. Signals a caller bug; fatal at the boundary.
    #[error("global fork client not initialized")]
    NotRunning,
}
