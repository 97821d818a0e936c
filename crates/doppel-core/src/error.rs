//! Error taxonomy for the twin runtime
//!
//! One closed set of error kinds so callers can pattern-match instead
//! of catching broad exception types: configuration errors fail fast at
//! setup time, transaction errors fail the offending call and leave the
//! transaction open, runtime errors are caught at worker boundaries.

use thiserror::Error;

/// Core twin runtime errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TwinError {
    // Setup errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    // Transaction / state errors
    #[error("Conflict: {resource} '{key}' already exists")]
    Conflict { resource: &'static str, key: String },

    #[error("Not found: {resource} '{key}'")]
    NotFound { resource: &'static str, key: String },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("No active transaction: call start_transaction() first")]
    NoActiveTransaction,

    #[error("Transaction already committed")]
    TransactionCommitted,

    // Worker / delivery errors
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl TwinError {
    pub fn conflict(resource: &'static str, key: impl Into<String>) -> Self {
        TwinError::Conflict {
            resource,
            key: key.into(),
        }
    }

    pub fn not_found(resource: &'static str, key: impl Into<String>) -> Self {
        TwinError::NotFound {
            resource,
            key: key.into(),
        }
    }
}

/// Result type for twin runtime operations
pub type TwinResult<T> = Result<T, TwinError>;
