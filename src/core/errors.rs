// src/core/errors.rs

//! Defines the primary error type for the entire crate.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the engine.
/// Using `thiserror` allows for clean error definitions and automatic `From`
/// trait implementations.
#[derive(Error, Debug)]
pub enum JasperDBError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Syntax error")]
    SyntaxError,

    /// A caller broke a structural contract (bad key, index out of range).
    /// Fatal to the calling operation; the dictionary stays usable.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// An operation was attempted in a state that forbids it, such as
    /// starting a snapshot while one is already active.
    #[error("Operation not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Queue full")]
    QueueFull,

    #[error("Timed out: {0}")]
    Timeout(String),

    /// A persisted file failed verification (magic or checksum mismatch).
    #[error("Corrupt file: {0}")]
    Corruption(String),

    #[error("Persistence Error: {0}")]
    AofError(String),

    #[error("Internal Error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for JasperDBError {
    fn clone(&self) -> Self {
        match self {
            JasperDBError::Io(e) => JasperDBError::Io(Arc::clone(e)),
            JasperDBError::IncompleteData => JasperDBError::IncompleteData,
            JasperDBError::SyntaxError => JasperDBError::SyntaxError,
            JasperDBError::InvariantViolation(s) => JasperDBError::InvariantViolation(s.clone()),
            JasperDBError::InvalidState(s) => JasperDBError::InvalidState(s.clone()),
            JasperDBError::QueueFull => JasperDBError::QueueFull,
            JasperDBError::Timeout(s) => JasperDBError::Timeout(s.clone()),
            JasperDBError::Corruption(s) => JasperDBError::Corruption(s.clone()),
            JasperDBError::AofError(s) => JasperDBError::AofError(s.clone()),
            JasperDBError::Internal(s) => JasperDBError::Internal(s.clone()),
        }
    }
}

impl PartialEq for JasperDBError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (JasperDBError::Io(e1), JasperDBError::Io(e2)) => e1.to_string() == e2.to_string(),
            (JasperDBError::InvariantViolation(s1), JasperDBError::InvariantViolation(s2)) => {
                s1 == s2
            }
            (JasperDBError::InvalidState(s1), JasperDBError::InvalidState(s2)) => s1 == s2,
            (JasperDBError::Timeout(s1), JasperDBError::Timeout(s2)) => s1 == s2,
            (JasperDBError::Corruption(s1), JasperDBError::Corruption(s2)) => s1 == s2,
            (JasperDBError::AofError(s1), JasperDBError::AofError(s2)) => s1 == s2,
            (JasperDBError::Internal(s1), JasperDBError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl From<std::io::Error> for JasperDBError {
    fn from(e: std::io::Error) -> Self {
        JasperDBError::Io(Arc::new(e))
    }
}

impl From<std::string::FromUtf8Error> for JasperDBError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        JasperDBError::Corruption(format!("invalid UTF-8: {e}"))
    }
}
