//! Error types for the cache substrate
//!
//! Provides a single structured error type shared by every tier, the
//! request engine, the wire protocol and the server/client binaries.

use thiserror::Error;

/// Unified error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Admission / eviction (BoundedCache)
    // =========================================================================
    #[error("tier '{tier}' is full, no victim available for {addr}")]
    TierFull { tier: String, addr: String },

    #[error("reservation for {addr} in tier '{tier}' was reclaimed before writeback")]
    SlotLost { tier: String, addr: String },

    // =========================================================================
    // Transport / network cache
    // =========================================================================
    #[error("transport failure talking to {server}: {reason}")]
    TransportFailure { server: String, reason: String },

    #[error("decompressed size mismatch: expected {expected}, got {actual}")]
    Corruption { expected: u64, actual: u64 },

    #[error("file '{path}' is not known to any server")]
    Unavailable { path: String },

    #[error("exhausted retries against server pool for {addr}")]
    RetriesExhausted { addr: String },

    // =========================================================================
    // Registration / tracking
    // =========================================================================
    #[error("file index space exhausted")]
    FileIndexExhausted,

    #[error("block address {0} is malformed (zero index is reserved)")]
    InvalidBlockAddress(String),

    // =========================================================================
    // Wire protocol
    // =========================================================================
    #[error("malformed wire frame: {0}")]
    MalformedFrame(String),

    #[error("unexpected message kind: {0}")]
    UnexpectedMessageKind(u32),

    // =========================================================================
    // Compression
    // =========================================================================
    #[error("compression failed: {0}")]
    Compression(String),

    // =========================================================================
    // Configuration
    // =========================================================================
    #[error("configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Ambient I/O / serialization
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Action to take when an error surfaces at the request layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Fall through to the next lower tier, no consumer-visible failure
    FallThrough,
    /// Drop silently and let the in-flight future resolve it
    DropAndAwait,
    /// Retry against a different server
    Retry,
    /// Fail the pending `Request`
    FailRequest,
}

impl Error {
    /// Classify how the request engine should react to this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::TierFull { .. } => ErrorAction::FallThrough,
            Error::SlotLost { .. } => ErrorAction::DropAndAwait,
            Error::TransportFailure { .. } => ErrorAction::Retry,
            Error::Corruption { .. } | Error::RetriesExhausted { .. } | Error::Unavailable { .. } => {
                ErrorAction::FailRequest
            }
            _ => ErrorAction::FailRequest,
        }
    }

    /// Whether this error is transient and safe to retry against another server
    pub fn is_retryable(&self) -> bool {
        matches!(self.action(), ErrorAction::Retry)
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::TierFull {
            tier: "l1-mem".into(),
            addr: "(1,2)".into(),
        };
        assert_eq!(err.action(), ErrorAction::FallThrough);
        assert!(!err.is_retryable());

        let err = Error::TransportFailure {
            server: "host:1234".into(),
            reason: "connection reset".into(),
        };
        assert_eq!(err.action(), ErrorAction::Retry);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_corruption_fails_request() {
        let err = Error::Corruption {
            expected: 4096,
            actual: 2048,
        };
        assert_eq!(err.action(), ErrorAction::FailRequest);
    }
}
