//! Collaborator interface errors

use thiserror::Error;

/// Errors surfaced by collaborator implementations.
#[derive(Debug, Error)]
pub enum NetError {
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Tunnel driver error
    #[error("tunnel driver error: {0}")]
    Driver(String),

    /// Driver rejected an operation for one peer
    #[error("driver rejected peer {0}: {1}")]
    PeerRejected(String, String),

    /// Signaling failure
    #[error("signaling error: {0}")]
    Signal(String),

    /// Management stream failure
    #[error("management error: {0}")]
    Management(String),

    /// DNS subsystem failure
    #[error("dns error: {0}")]
    Dns(String),

    /// Route manager failure
    #[error("route error: {0}")]
    Route(String),

    /// SSH server failure
    #[error("ssh error: {0}")]
    Ssh(String),

    /// Component is not running
    #[error("not running")]
    NotRunning,

    /// Component is already running
    #[error("already running")]
    AlreadyRunning,
}

/// Result type for collaborator operations.
pub type NetResult<T> = Result<T, NetError>;
