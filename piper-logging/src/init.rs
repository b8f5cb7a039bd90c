//! Subscriber setup for worker, executor and cache manager processes

use anyhow::Context;
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::router::{JobLogScope, LogRouter};

static ROUTER: OnceCell<LogRouter> = OnceCell::new();

/// Where a process writes its log and how verbose it is
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    /// Base name of the `.out` and `.err` files
    pub process_name: String,
    pub level: String,
}

impl LoggingConfig {
    pub fn new(log_dir: impl Into<PathBuf>, process_name: impl Into<String>, debug: bool) -> Self {
        Self {
            log_dir: log_dir.into(),
            process_name: process_name.into(),
            level: level_for(debug).to_string(),
        }
    }

    /// Replace the level derived from the debug flag
    pub fn with_level(mut self, level: Option<&str>) -> Self {
        if let Some(level) = level {
            self.level = level.to_string();
        }
        self
    }

    pub fn out_file(&self) -> PathBuf {
        self.log_dir.join(format!("{}.out", self.process_name))
    }

    pub fn err_file(&self) -> PathBuf {
        self.log_dir.join(format!("{}.err", self.process_name))
    }
}

pub fn level_for(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

/// Keeps the background log writer alive; flushes on drop
pub struct LoggingGuard {
    router: LogRouter,
    _worker: WorkerGuard,
}

impl LoggingGuard {
    pub fn router(&self) -> &LogRouter {
        &self.router
    }
}

/// Build the filter; `RUST_LOG` wins over the configured level
fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Build the router and its background writer without installing anything
pub fn build_router(config: &LoggingConfig) -> anyhow::Result<(LogRouter, WorkerGuard)> {
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log directory {}", config.log_dir.display()))?;

    let appender = tracing_appender::rolling::never(
        &config.log_dir,
        format!("{}.out", config.process_name),
    );
    let (writer, guard) = tracing_appender::non_blocking(appender);
    Ok((LogRouter::new(writer, config.err_file()), guard))
}

/// Install the global subscriber for this process
pub fn init_process_logging(config: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    let (router, worker) = build_router(config)?;

    let layer = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_writer(router.clone());

    let result = tracing_subscriber::registry()
        .with(build_filter(&config.level))
        .with(layer)
        .try_init();

    if result.is_err() {
        debug!("Global tracing subscriber already set, keeping it");
    } else {
        let _ = ROUTER.set(router.clone());
    }

    Ok(LoggingGuard {
        router,
        _worker: worker,
    })
}

/// Route this process's log lines to a job's files until the scope drops
///
/// Without a file subscriber the returned scope does nothing.
pub fn enter_job(out: &Path, err: &Path) -> JobLogScope {
    match ROUTER.get() {
        Some(router) => router.enter_job(out, err),
        None => JobLogScope::inert(),
    }
}

/// Test subscriber writing through the test harness
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter("warn"))
        .with_test_writer()
        .try_init();
}
