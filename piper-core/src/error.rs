//! Core error types

use thiserror::Error;

/// Result type for serializer operations
pub type SerializerResult<T> = std::result::Result<T, SerializerError>;

/// Serializer errors
#[derive(Debug, Error)]
pub enum SerializerError {
    /// Every codec in the priority list refused the value
    #[error("No codec could handle the value: {0}")]
    NoCodec(String),

    /// Header names a codec this build does not know
    #[error("Unknown codec header: {0:?}")]
    UnknownCodec(String),

    /// Payload shorter than its header or declared shape
    #[error("Truncated payload: {0}")]
    Truncated(String),

    /// Array buffer disagrees with its shape and dtype
    #[error("Invalid array: {0}")]
    InvalidArray(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Flatten/rebuild errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlattenError {
    #[error("Expected {expected} flat values, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Flat sequence ended inside a nested argument")]
    UnexpectedEnd,

    #[error("Dimension marker found where a value was expected")]
    UnexpectedMarker,
}

/// Object tracker errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// Id already bound to another token and insertion was not forced
    #[error("Object id {id} is already bound to another object")]
    IdConflict { id: String },

    /// Token is not tracked
    #[error("Object is not tracked")]
    NotTracked,

    #[error("No file name recorded for object {0}")]
    MissingFileName(String),
}
