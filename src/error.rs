//! # Centralized Error Handling
//!
//! Unified error types for the entire crate using `thiserror`.
//! Every error is fatal: `main` prints a single-line diagnostic and exits
//! with a nonzero status.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for haploom operations
#[derive(Error, Debug)]
pub enum HaploomError {
    /// I/O errors (file missing, permission denied, read/write failures)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// VCF parsing errors (malformed records, missing fields)
    #[error("VCF error: {message}")]
    Vcf { message: String },

    /// Genetic map parsing errors
    #[error("map error: {message}")]
    Map { message: String },

    /// Binary reference (bref3) format errors
    #[error("bref3 error: {message}")]
    Bref { message: String },

    /// Invalid data errors (marker position out of order, sample mismatch)
    #[error("invalid data: {message}")]
    InvalidData { message: String },

    /// Configuration errors (invalid CLI arguments)
    #[error("configuration error: {message}")]
    Config { message: String },

    /// File not found errors
    #[error("file not found: {path}")]
    FileNotFound { path: PathBuf },

    /// Parse errors with a source line number
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Internal invariant violations escalated to fatal errors
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Type alias for Results using HaploomError
pub type Result<T> = std::result::Result<T, HaploomError>;

impl HaploomError {
    /// Create a VCF error with a message
    pub fn vcf(message: impl Into<String>) -> Self {
        Self::Vcf {
            message: message.into(),
        }
    }

    /// Create a genetic map error
    pub fn map(message: impl Into<String>) -> Self {
        Self::Map {
            message: message.into(),
        }
    }

    /// Create a bref3 format error
    pub fn bref(message: impl Into<String>) -> Self {
        Self::Bref {
            message: message.into(),
        }
    }

    /// Create an invalid data error
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a parse error
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }

    /// Create an internal invariant-violation error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for HaploomError {
    fn from(err: anyhow::Error) -> Self {
        Self::Bref {
            message: format!("{err:#}"),
        }
    }
}
