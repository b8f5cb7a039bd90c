//! Piper execution engine
//!
//! This crate provides the executor loop that runs user functions for
//! `EXECUTE_TASK` commands, and the worker pool that supervises executor
//! processes and serves the control pipe.

pub mod error;
pub mod executor;
pub mod launcher;
pub mod outcome;
pub mod params;
pub mod pool;
pub mod registry;
pub mod scope;
pub mod shutdown;
pub mod signals;
pub mod storage;

// Re-export main types
pub use error::{ExecutionError, ExecutionResult, ProcessLifecycleError, TaskError};
pub use executor::{Executor, LoopControl};
pub use launcher::{
    BinaryLauncher, CacheClientSettings, ExecutorLauncher, ExecutorSettings,
    CACHE_MANAGER_SUBCOMMAND, EXECUTOR_SUBCOMMAND,
};
pub use outcome::{
    Outcome, EXIT_CANCELLED, EXIT_EXCEPTION, EXIT_FAILURE, EXIT_OK, EXIT_PROTOCOL,
};
pub use pool::{ExecutorHandle, WorkerPool};
pub use registry::{FunctionRegistry, TaskContext, TaskFunction};
pub use scope::TaskScope;
pub use shutdown::{stop_all, PoolChild, Stopped};
pub use signals::{forward_cancel_signal, terminated, CancelHandle};
pub use storage::{PassThroughStorage, StorageHooks};
