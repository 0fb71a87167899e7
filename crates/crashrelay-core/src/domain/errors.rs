//! Domain error types
//!
//! This module defines error types specific to domain operations,
//! including malformed wire input, invalid state transitions and
//! invalid identifiers.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed envelope, header or other wire input
    #[error("Format error: {0}")]
    Format(String),

    /// Invalid DSN string
    #[error("Invalid DSN: {0}")]
    InvalidDsn(String),

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// An API was called before the setup it depends on
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),
}
