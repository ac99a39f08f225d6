//! Error types for the postern-spool crate.

use std::io;

use thiserror::Error;

/// Errors produced by spool buffer operations.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// I/O operation failed (file create/write/seek/delete).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Spool path validation failed.
    #[error("Spool path is not usable: {0}")]
    Validation(String),
}

/// Specialized `Result` type for spool operations.
pub type Result<T> = std::result::Result<T, SpoolError>;
