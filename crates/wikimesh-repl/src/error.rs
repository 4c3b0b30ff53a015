//! Error types for the replication subsystem.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReplError>;

/// Errors that can occur in the replication subsystem.
///
/// `InvalidMessage` is rejected at the boundary and never retried. Network,
/// timeout and queue-full errors are operational and retried by the sender
/// queue (see [`ReplError::is_retryable`]).
#[derive(Debug, Error)]
pub enum ReplError {
    /// Structurally or semantically wrong message.
    #[error("invalid message: {msg}")]
    InvalidMessage {
        /// What was wrong with the message.
        msg: String,
    },

    /// The immediate-hop instance is not a registered peer.
    #[error("unknown instance: {instance}")]
    UnknownInstance {
        /// Id or uri presented by the caller.
        instance: String,
    },

    /// The requested record does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing record.
        what: String,
    },

    /// Remote peer unreachable or answered with a server error.
    #[error("network error: {msg}")]
    Network {
        /// Error message describing the network issue.
        msg: String,
    },

    /// Remote peer refused the request (client error status).
    #[error("rejected by peer {uri}: status {status}")]
    Rejected {
        /// Peer base uri.
        uri: String,
        /// HTTP status returned.
        status: u16,
    },

    /// Durable store failure.
    #[error("store error: {msg}")]
    Store {
        /// Error message describing the failure.
        msg: String,
    },

    /// Message signature missing or wrong.
    #[error("signature error: {msg}")]
    Signature {
        /// Error message describing the failure.
        msg: String,
    },

    /// Bounded receive queue is full.
    #[error("receive queue full")]
    QueueFull,

    /// Operation did not complete in time.
    #[error("timed out after {ms} ms")]
    Timeout {
        /// Elapsed budget in milliseconds.
        ms: u64,
    },

    /// Invalid configuration.
    #[error("configuration error: {msg}")]
    Config {
        /// Error message describing the problem.
        msg: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Node was shut down.
    #[error("replication node shut down")]
    Shutdown,
}

impl ReplError {
    /// Shorthand for [`ReplError::InvalidMessage`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        ReplError::InvalidMessage { msg: msg.into() }
    }

    /// Shorthand for [`ReplError::Store`].
    pub fn store(msg: impl Into<String>) -> Self {
        ReplError::Store { msg: msg.into() }
    }

    /// Shorthand for [`ReplError::Network`].
    pub fn network(msg: impl Into<String>) -> Self {
        ReplError::Network { msg: msg.into() }
    }

    /// Returns true for transient errors the sender queue should retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplError::Network { .. } => true,
            ReplError::Timeout { .. } => true,
            ReplError::QueueFull => true,
            ReplError::Io(_) => true,
            ReplError::Rejected { status, .. } => *status == 429,
            ReplError::InvalidMessage { .. } => false,
            ReplError::UnknownInstance { .. } => false,
            ReplError::NotFound { .. } => false,
            ReplError::Store { .. } => false,
            ReplError::Signature { .. } => false,
            ReplError::Config { .. } => false,
            ReplError::Serialization(_) => false,
            ReplError::Shutdown => false,
        }
    }

    /// HTTP status the server answers with for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ReplError::InvalidMessage { .. } | ReplError::Serialization(_) => 400,
            ReplError::UnknownInstance { .. } | ReplError::Signature { .. } => 403,
            ReplError::NotFound { .. } => 404,
            ReplError::QueueFull | ReplError::Shutdown => 503,
            ReplError::Network { .. } | ReplError::Rejected { .. } => 502,
            ReplError::Timeout { .. } => 504,
            ReplError::Store { .. } | ReplError::Config { .. } | ReplError::Io(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ReplError::network("down").is_retryable());
        assert!(ReplError::Timeout { ms: 10 }.is_retryable());
        assert!(ReplError::QueueFull.is_retryable());
        assert!(!ReplError::invalid("bad").is_retryable());
        assert!(!ReplError::Signature { msg: "x".into() }.is_retryable());
        assert!(!ReplError::Rejected { uri: "u".into(), status: 400 }.is_retryable());
        assert!(ReplError::Rejected { uri: "u".into(), status: 429 }.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = ReplError::invalid("unknown question q1");
        assert_eq!(err.to_string(), "invalid message: unknown question q1");

        let err = ReplError::UnknownInstance { instance: "http://a".into() };
        assert_eq!(err.to_string(), "unknown instance: http://a");
    }

    #[test]
    fn test_http_status() {
        assert_eq!(ReplError::invalid("x").http_status(), 400);
        assert_eq!(ReplError::UnknownInstance { instance: "a".into() }.http_status(), 403);
        assert_eq!(ReplError::NotFound { what: "a".into() }.http_status(), 404);
        assert_eq!(ReplError::QueueFull.http_status(), 503);
        assert_eq!(ReplError::network("down").http_status(), 502);
    }
}
