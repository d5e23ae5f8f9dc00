//! Engine errors

use thiserror::Error;

use overlink_net::NetError;
use overlink_proto::ProtoError;

/// Engine errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Startup failed; no residual resources are left behind
    #[error("startup failed: {0}")]
    Startup(String),

    /// Engine is already running
    #[error("engine already running")]
    AlreadyRunning,

    /// Engine is not running
    #[error("engine not running")]
    NotRunning,

    /// A peer with this key is already tracked
    #[error("peer already exists: {0}")]
    PeerAlreadyExists(String),

    /// No peer with this key is tracked
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// Configuration rejected
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Operation timed out
    #[error("operation timed out")]
    Timeout,

    /// Wire data error
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// Collaborator failure
    #[error(transparent)]
    Net(#[from] NetError),
}

/// Result type for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;
