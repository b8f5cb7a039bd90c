//! Error types for task execution

use thiserror::Error;

use piper_caching::CacheError;
use piper_config::ConfigError;
use piper_core::{FlattenError, SerializerError};
use piper_ipc::IpcError;

/// Result type for executor and pool operations
pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Failures that stop an executor or the pool
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Lifecycle(#[from] ProcessLifecycleError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid settings: {0}")]
    Settings(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a single task did not succeed
///
/// None of these end the executor; each maps to one exit value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    /// The user code raised an application exception
    #[error("{0}")]
    Application(String),

    /// Anything else that went wrong while running the task
    #[error("Task failed: {0}")]
    Failed(String),

    #[error("Task cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}

impl From<SerializerError> for TaskError {
    fn from(err: SerializerError) -> Self {
        TaskError::Failed(format!("Serialization error: {}", err))
    }
}

impl From<FlattenError> for TaskError {
    fn from(err: FlattenError) -> Self {
        TaskError::Failed(err.to_string())
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        TaskError::Failed(format!("IO error: {}", err))
    }
}

/// Spawning, signalling and reaping child processes
#[derive(Error, Debug)]
pub enum ProcessLifecycleError {
    #[error("Failed to spawn {what}: {source}")]
    Spawn {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process {0} exited before reporting its pid")]
    NoPid(String),

    #[error("Failed to signal process {pid}: {errno}")]
    Signal { pid: u32, errno: nix::errno::Errno },

    #[error("Failed to reap process: {0}")]
    Wait(String),

    #[error("Cache manager did not start: {0}")]
    Handshake(String),

    #[error("Pipe setup failed: {0}")]
    Pipe(String),

    #[error("{0} is not supported by this launcher")]
    Unsupported(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializer_error_is_task_failure() {
        let err: TaskError = SerializerError::NoCodec("Dict".to_string()).into();
        assert!(matches!(err, TaskError::Failed(_)));
    }

    #[test]
    fn test_lifecycle_error_is_transparent() {
        let err: ExecutionError = ProcessLifecycleError::NoPid("executor_3".into()).into();
        assert_eq!(
            err.to_string(),
            "Process executor_3 exited before reporting its pid"
        );
    }
}
