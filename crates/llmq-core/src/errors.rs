//! Unified error type for the quorum subsystem.
//!
//! Cryptographic failures are absent from most call paths:
//! signature and key checks report `bool`/`Option` results. `LlmqError` covers
//! what callers need to react to: malformed input, missing chain data, storage
//! faults and aborted DKG phases.

use serde::{Deserialize, Serialize};

/// Error type for all LLMQ operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum LlmqError {
    /// Invalid input, configuration or protocol message
    #[error("Invalid: {message}")]
    Invalid {
        /// What was rejected
        message: String,
    },

    /// Requested block, quorum or commitment is unknown
    #[error("Not found: {message}")]
    NotFound {
        /// What was not found
        message: String,
    },

    /// Key or signature material could not be decoded
    #[error("Crypto error: {message}")]
    Crypto {
        /// Description of the failing operation
        message: String,
    },

    /// Peer delivery failed
    #[error("Network error: {message}")]
    Network {
        /// Description of the delivery failure
        message: String,
    },

    /// Encoding or decoding failed
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the codec failure
        message: String,
    },

    /// Persistent store read or write failed
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage failure
        message: String,
    },

    /// A DKG phase was abandoned (shutdown, reorg or unexpected phase)
    #[error("Aborted: {message}")]
    Aborted {
        /// Why the phase was abandoned
        message: String,
    },

    /// Internal invariant violated
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error
        message: String,
    },
}

impl LlmqError {
    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a crypto error
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an aborted error
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error means "try again later" rather than "reject".
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Aborted { .. })
    }
}

/// Standard Result type for LLMQ operations
pub type Result<T> = std::result::Result<T, LlmqError>;

impl From<std::io::Error> for LlmqError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::InvalidData => {
                Self::serialization(err.to_string())
            }
            _ => Self::storage(err.to_string()),
        }
    }
}

impl From<bincode::Error> for LlmqError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<serde_json::Error> for LlmqError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = LlmqError::invalid("bad-qc-version");
        assert!(matches!(err, LlmqError::Invalid { .. }));
        assert_eq!(err.to_string(), "Invalid: bad-qc-version");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err = LlmqError::from(io_err);
        assert!(matches!(err, LlmqError::Serialization { .. }));

        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        assert!(matches!(LlmqError::from(io_err), LlmqError::Storage { .. }));
    }

    #[test]
    fn test_transient_classification() {
        assert!(LlmqError::not_found("no quorum").is_transient());
        assert!(LlmqError::aborted("reorg").is_transient());
        assert!(!LlmqError::invalid("bad bits").is_transient());
    }
}
