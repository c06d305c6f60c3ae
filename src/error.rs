//! Error types for Recall Core.
//!
//! One enum covers the whole library. Per-record apply failures are *not*
//! represented here: the apply engine collects them as strings in the batch
//! report so one bad record never aborts the rest of a batch.

use thiserror::Error;

/// Result type alias for Recall operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Main error type for Recall operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed id, format, or length on a single field
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Missing or malformed request fields at the protocol boundary
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection refused, timeout, DNS, or HTTP-level failure
    #[error("Network error: {0}")]
    Network(String),

    /// TOFU fingerprint mismatch or certificate handling failure
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Storage path or other local configuration missing
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        SyncError::Protocol(message.into())
    }

    /// Create a new network error
    pub fn network(message: impl Into<String>) -> Self {
        SyncError::Network(message.into())
    }

    /// Create a new sync error
    pub fn sync(message: impl Into<String>) -> Self {
        SyncError::Sync(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = SyncError::validation("device_id", "must be 32 hex characters");
        assert_eq!(
            err.to_string(),
            "Validation error in device_id: must be 32 hex characters"
        );
    }

    #[test]
    fn test_network_error_display() {
        let err = SyncError::network("connection refused");
        assert!(err.to_string().contains("connection refused"));
    }
}
