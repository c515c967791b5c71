//! Error types for nodeherd

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Coordination store errors ===
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Key already exists: {0}")]
    KeyExists(String),

    #[error("Compare failed: {0}")]
    CompareFailed(String),

    #[error("Store error: {0}")]
    Store(String),

    // === Lock errors ===
    #[error("lock in use")]
    LockInUse,

    // === Network errors ===
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Cluster API {endpoint} returned {status}")]
    ClusterApi { endpoint: String, status: u16 },

    // === Reconciliation errors ===
    #[error("Protocol violation: {0}")]
    Protocol(String),

    // === Config errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Transient store and network failures are retried on the next tick;
    /// lock contention is an expected steady state, not a failure; protocol
    /// violations are fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Store(_) | Error::Http(_) | Error::ClusterApi { .. } | Error::Timeout(_)
        )
    }

    /// Is this a fatal reconciler/agent protocol mismatch?
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::InvalidConfig(_))
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Store(format!("decode: {}", e))
    }
}
