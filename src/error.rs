//! Normalized error types for the rowloom engine
//!
//! All backend-specific errors are mapped to these unified error types
//! so callers see consistent failures regardless of which sub-source
//! misbehaved.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all engine operations
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum EngineError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Malformed backend response: {message}")]
    MalformedResponse { message: String },

    #[error("Location not found in catalog: {name}")]
    LocationNotFound { name: String },

    #[error("Location {name} is not a {expected} backend")]
    LocationKindMismatch { name: String, expected: String },

    #[error("Parameter index {index} out of range 1..={count}")]
    ParamIndexOutOfRange { index: usize, count: usize },

    #[error("Parameter {index} has not been set")]
    ParamMissing { index: usize },

    #[error("Column index {index} out of range 1..={count}")]
    ColumnIndexOutOfRange { index: usize, count: usize },

    #[error("Unknown column: {name}")]
    UnknownColumn { name: String },

    #[error("Cannot convert {from} to {to}")]
    Conversion { from: String, to: String },

    #[error("Batch size must be at least 1, got {size}")]
    InvalidBatchSize { size: usize },

    #[error("{what} is closed")]
    Closed { what: String },

    #[error("Statement already has an open cursor")]
    CursorAlreadyOpen,

    #[error("Cursor is not positioned on a row")]
    CursorNotPositioned,

    #[error("Query execution error: {message}")]
    ExecutionError { message: String },
}

impl EngineError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed { message: msg.into() }
    }

    pub fn malformed_response(msg: impl Into<String>) -> Self {
        Self::MalformedResponse { message: msg.into() }
    }

    pub fn location_not_found(name: impl Into<String>) -> Self {
        Self::LocationNotFound { name: name.into() }
    }

    pub fn kind_mismatch(name: impl Into<String>, expected: impl Into<String>) -> Self {
        Self::LocationKindMismatch {
            name: name.into(),
            expected: expected.into(),
        }
    }

    pub fn conversion(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::Conversion {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn closed(what: impl Into<String>) -> Self {
        Self::Closed { what: what.into() }
    }

    pub fn execution_error(msg: impl Into<String>) -> Self {
        Self::ExecutionError { message: msg.into() }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
