//! Error domain for the tinc workspace.

use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors surfaced by the core subsystems.
///
/// Per-tunnel failures (`TunnelClosed`, `AuthFailed`, `Protocol`) never
/// propagate past the tunnel they occurred on; only `Config` and event-loop
/// I/O errors are fatal to the daemon.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: {0}")]
    Config(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("tunnel closed")]
    TunnelClosed,
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("no route to {0}")]
    Unreachable(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }
}
