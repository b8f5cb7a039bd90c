//! Cache error types

use thiserror::Error;

/// Result type for cache operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Cache-related errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// Entry larger than the whole cache
    #[error("Cache capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Value kind the cache cannot hold
    #[error("Unsupported value for the cache: {0}")]
    Unsupported(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// Lock acquisition failed
    #[error("Failed to acquire cache lock: {0}")]
    LockError(String),

    /// Lock or unlock request that contradicts the manager state
    #[error("Cache coherence issue: {0}")]
    Coherence(String),

    /// Manager refused the connection token
    #[error("Cache manager rejected the authentication token")]
    Unauthorized,

    /// Manager answered with an error reply
    #[error("Cache manager error: {0}")]
    Manager(String),

    /// Manager replied with something the request does not allow
    #[error("Unexpected reply from the cache manager: {0}")]
    UnexpectedReply(String),

    /// Manager connection went away
    #[error("Cache manager connection closed")]
    ConnectionClosed,

    /// Shared memory segment could not be created or mapped
    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            CacheError::DeserializationError(err.to_string())
        } else {
            CacheError::SerializationError(err.to_string())
        }
    }
}

impl From<piper_core::SerializerError> for CacheError {
    fn from(err: piper_core::SerializerError) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

impl From<nix::errno::Errno> for CacheError {
    fn from(errno: nix::errno::Errno) -> Self {
        CacheError::SharedMemory(errno.desc().to_string())
    }
}
