//! Error types for darkscan value objects

use thiserror::Error;

/// Validation error raised when constructing a value object
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Severity outside the accepted range
    #[error("severity {value} exceeds maximum {max}")]
    SeverityOutOfRange {
        /// Rejected value
        value: u16,
        /// Largest accepted value
        max: u8,
    },

    /// Category name not recognised
    #[error("unknown category: {0}")]
    UnknownCategory(String),
}

/// Result type for value object construction
pub type DomainResult<T> = Result<T, DomainError>;
