// satchel-core/src/error.rs
//! Error taxonomy for the whole crate.
//!
//! One discriminated enum instead of a hierarchy: callers match on the kind,
//! the message carries the detail. `Conflict` never escapes the index layer;
//! it exists so the persist path can reason about ETag precondition failures
//! with the same vocabulary as everything else.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, SatchelError>;

#[derive(Debug, Error)]
pub enum SatchelError {
    /// Any operation on a closed client, database or collection handle
    #[error("client is closed")]
    ClientClosed,

    /// Malformed filter, missing `_id` where required, unsupported update
    /// operator, invalid index key spec
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Document or index absent where the operation's contract demands it
    #[error("not found: {0}")]
    NotFound(String),

    /// Transient storage failure with internal retries exhausted
    #[error("network error: {0}")]
    Network(String),

    /// ETag precondition failure; recovered internally by merge-retry
    #[error("write conflict: {0}")]
    Conflict(String),

    /// Non-transient storage failure
    #[error("storage error: {0}")]
    Server(String),

    /// Feature stub
    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl SatchelError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        SatchelError::InvalidArgument(msg.into())
    }

    pub fn server(msg: impl Into<String>) -> Self {
        SatchelError::Server(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SatchelError::InvalidArgument("bad filter".to_string());
        assert_eq!(err.to_string(), "invalid argument: bad filter");

        let err = SatchelError::ClientClosed;
        assert_eq!(err.to_string(), "client is closed");
    }

    #[test]
    fn test_error_kinds_are_distinguishable() {
        let err = SatchelError::Network("timeout".to_string());
        assert!(matches!(err, SatchelError::Network(_)));
        assert!(!matches!(err, SatchelError::Server(_)));
    }
}
