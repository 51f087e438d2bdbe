//! Error types for Hearth

use thiserror::Error;

/// Main error type for Hearth operations
#[derive(Error, Debug)]
pub enum HearthError {
    /// The inference backend is not accepting connections
    #[error(
        "Inference backend is not reachable at {url}. Make sure it is running (start it with `ollama serve`) and that backend.base_url points at it"
    )]
    ConnectionRefused { url: String },

    /// A call exceeded its timeout budget
    #[error("Request to the inference backend timed out after {after_ms}ms ({budget} budget)")]
    Timeout { budget: &'static str, after_ms: u64 },

    /// The backend answered with a non-success status
    #[error("Backend returned {status}: {body}")]
    Http { status: u16, body: String },

    /// Any other network failure (DNS, TLS, reset, ...)
    #[error("Network error: {0}")]
    Network(String),

    /// Connection-level failure while a stream was in flight
    #[error("Stream failed: {0}")]
    StreamFatal(String),

    /// A single frame could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Encryption key is not 64 hex characters / 32 bytes
    #[error("Invalid encryption key: {0}")]
    InvalidKeyFormat(String),

    /// Authentication tag did not verify (tampered data or wrong key)
    #[error("Encrypted value failed authentication (tampered data or wrong key)")]
    TamperedOrWrongKey,

    /// Blob digest is not 64 lowercase hex characters
    #[error("Invalid blob digest '{0}': expected 64 lowercase hex characters")]
    InvalidDigestFormat(String),

    /// Blob content does not hash to the given digest
    #[error("Blob content does not match digest {0}")]
    DigestMismatch(String),

    /// Record collection or id is unusable as a file name
    #[error("Invalid record name '{0}'")]
    InvalidRecordName(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl HearthError {
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, HearthError::ConnectionRefused { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HearthError::Timeout { .. })
    }
}

impl From<serde_json::Error> for HearthError {
    fn from(e: serde_json::Error) -> Self {
        HearthError::Serialization(e.to_string())
    }
}

/// Result type alias for Hearth operations
pub type Result<T> = std::result::Result<T, HearthError>;
