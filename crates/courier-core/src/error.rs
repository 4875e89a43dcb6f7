//! Error types shared across the courier crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while validating or handling events.
#[derive(Error, Debug)]
pub enum Error {
    /// Event signature is invalid.
    #[error("invalid event signature: {0}")]
    InvalidSignature(String),

    /// Event has an invalid field format (e.g., wrong hex length).
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// Key parsing error.
    #[error("key error: {0}")]
    Key(#[from] nostr::key::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_signature_display() {
        let err = Error::InvalidSignature("verification failed".to_string());
        let msg = err.to_string();
        assert!(msg.contains("invalid event signature"));
        assert!(msg.contains("verification failed"));
    }

    #[test]
    fn test_invalid_field_display() {
        let err = Error::InvalidField {
            field: "pubkey",
            reason: "not 64 hex characters".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("pubkey"));
        assert!(msg.contains("not 64 hex characters"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }
}
