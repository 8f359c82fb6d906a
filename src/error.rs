//! Error Module
//!
//! Defines error types and result types used throughout the metadata cache.

use thiserror::Error;

/// Main error type for the metadata cache
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    /// Out of memory or out of storage space for an entry or bookkeeping structure
    #[error("Allocation error: {0}")]
    AllocationError(String),

    /// Programming error: double protect, unknown address, malformed dependency removal, ...
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// A flush-dependency parent was asked to flush while a child is still dirty
    #[error("Dependency order error: {0}")]
    DependencyOrder(String),

    /// A broadcast or barrier failed; never retried
    #[error("Collective error: {0}")]
    CollectiveError(String),

    /// A cache image block failed validation
    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl CacheError {
    /// Errors after which the cooperating processes can no longer be assumed to agree
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CacheError::CollectiveError(_) | CacheError::DecodeError(_)
        )
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CacheError {
    fn from(err: serde_yaml::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

/// Result type alias for the metadata cache
pub type Result<T> = std::result::Result<T, CacheError>;
