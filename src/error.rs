//! Error types for the privca library.
//!
//! Every failure the engine can report maps onto one variant of [`PkiError`].
//! The variants follow the caller-facing taxonomy: input problems are never
//! retried, while lock timeouts and I/O failures leave no partial state behind
//! and may be retried as a whole.

use thiserror::Error;

/// The main error type for privca operations.
#[derive(Error, Debug)]
pub enum PkiError {
    /// Missing or malformed caller input
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Key algorithm or parameters the engine does not support
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// A subject alternative name could not be encoded
    #[error("Invalid SAN: {0}")]
    InvalidSan(String),

    /// Persisted root material, index or serial state is unreadable
    #[error("Corrupt PKI state: {0}")]
    CorruptState(String),

    /// The underlying signing primitive rejected the request
    #[error("Signing error: {0}")]
    SigningError(String),

    /// I/O failure while reading or writing PKI state
    #[error("Persistence error: {0}")]
    PersistenceError(#[from] std::io::Error),

    /// The serial counter could not be read or advanced
    #[error("Serial allocation error: {0}")]
    AllocationError(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFoundError(String),

    /// Resource already exists
    #[error("Already exists: {0}")]
    AlreadyExistsError(String),

    /// The instance lock could not be acquired in time
    #[error("PKI instance is locked: {0}")]
    Locked(String),

    /// Key derivation failed
    #[error("Key derivation error: {0}")]
    KeyDerivationError(String),

    /// Encryption or decryption of key material failed
    #[error("Encryption/decryption error: {0}")]
    EncryptionError(String),

    /// Invalid passphrase for an encrypted key
    #[error("Invalid password")]
    InvalidPasswordError,

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl PkiError {
    /// Whether repeating the same operation may succeed.
    ///
    /// Lock timeouts and I/O failures never leave partially applied state, so
    /// the whole operation can be retried. Everything else reproduces.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PkiError::Locked(_) | PkiError::PersistenceError(_))
    }
}

/// A specialized Result type for privca operations.
pub type Result<T> = std::result::Result<T, PkiError>;
