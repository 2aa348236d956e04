//! Error types for duet-core.

use thiserror::Error;

/// Errors raised while validating messages or verifying session tokens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid field value: {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("malformed session token")]
    MalformedToken,

    #[error("session token expired")]
    TokenExpired,

    #[error("session token signature mismatch")]
    SignatureMismatch,
}

/// Result type alias for duet-core operations.
pub type Result<T> = std::result::Result<T, Error>;
