//! Error types for slotcache
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Unified error type for slotcache operations
#[derive(Debug, Error)]
pub enum StoreError {
    // -------------------------------------------------------------------------
    // Recoverable Placement Errors
    // -------------------------------------------------------------------------
    #[error("Slot is busy")]
    Busy,

    #[error("Entry not found")]
    NotFound,

    #[error("Backend is full")]
    Full,

    #[error("Object size {size} outside accepted range [{min}, {max}]")]
    SizeRejected { size: u64, min: u64, max: u64 },

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Corrupt slot: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Fatal configuration error: {0}")]
    ConfigFatal(String),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Busy | StoreError::Full)
    }

    /// Whether the failure is permanent for this backend (try another one)
    pub fn is_permanent_for_backend(&self) -> bool {
        matches!(self, StoreError::SizeRejected { .. })
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
