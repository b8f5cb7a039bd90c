//! Logging for piper processes
//!
//! Every process logs to `<log_dir>/<name>.out`; error events are also copied
//! to `<name>.err`. While a task runs, an executor routes its lines to the
//! job's own files through [`enter_job`].

pub mod init;
pub mod router;

pub use init::{
    build_router, enter_job, init_process_logging, init_test_tracing, level_for, LoggingConfig,
    LoggingGuard,
};
pub use router::{JobLogScope, LazyFile, LogRouter, RoutedWriter};
