//! Protocol data errors

use thiserror::Error;

/// Errors produced while decoding wire-facing values.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Key is not valid base64 or has the wrong length
    #[error("invalid peer key: {0}")]
    InvalidKey(String),

    /// A CIDR prefix could not be parsed
    #[error("invalid prefix {prefix}: {reason}")]
    InvalidPrefix { prefix: String, reason: String },

    /// An address could not be parsed
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}
