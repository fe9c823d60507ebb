//! Error types for the sharestate engine.

use thiserror::Error;

/// All possible errors from applying operations to a document value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Path errors
    #[error("operation component has an empty path")]
    EmptyPath,

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    // Target errors
    #[error("value at {0} is not a number")]
    NotANumber(String),

    #[error("value at {0} is not a list")]
    NotAList(String),

    #[error("value at {0} is not an object")]
    NotAnObject(String),

    #[error("value at {0} differs from the value being removed")]
    ValueMismatch(String),

    // Shape errors
    #[error("invalid operation component: {0}")]
    InvalidComponent(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
