//! Error types for the message bus.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the bus.
#[derive(Error, Debug)]
pub enum Error {
    /// The configured secret key could not be parsed.
    #[error("invalid secret key: {0}")]
    InvalidKey(String),

    /// No relays were configured.
    #[error("no relays configured")]
    NoRelays,

    /// Relay transport fault (connect, subscribe, or publish).
    #[error("transport error: {0}")]
    Transport(String),

    /// Every candidate relay was skipped or failed during a publish.
    #[error("publish failed on all relays ({attempted} attempted, last error: {last})")]
    AllRelaysFailed {
        /// Relays actually attempted (skipped relays excluded).
        attempted: usize,
        /// The last observed underlying error.
        last: String,
    },

    /// Content encryption or decryption failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Event signing failed.
    #[error("signing error: {0}")]
    Sign(String),

    /// State persistence fault.
    #[error("state error: {0}")]
    State(String),

    /// Core validation error.
    #[error(transparent)]
    Core(#[from] courier_core::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
