//! Writer that follows the task currently running in the process

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{Level, Metadata};
use tracing_appender::non_blocking::NonBlocking;
use tracing_subscriber::fmt::MakeWriter;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// File opened on first write
#[derive(Debug, Clone)]
pub struct LazyFile {
    path: PathBuf,
    file: Arc<Mutex<Option<File>>>,
}

impl LazyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut slot = lock(&self.file);
        if slot.is_none() {
            *slot = Some(open_append(&self.path)?);
        }
        match slot.as_mut() {
            Some(file) => file.write_all(buf),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
struct JobFiles {
    out: LazyFile,
    err: LazyFile,
}

#[derive(Debug)]
struct RouterInner {
    base_out: NonBlocking,
    base_err: LazyFile,
    job: Mutex<Option<JobFiles>>,
}

/// Routes formatted events to the process log or the current job's files
///
/// Error events are copied to the matching `.err` file, which is only created
/// when the first error arrives.
#[derive(Debug, Clone)]
pub struct LogRouter {
    inner: Arc<RouterInner>,
}

impl LogRouter {
    pub fn new(base_out: NonBlocking, base_err: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                base_out,
                base_err: LazyFile::new(base_err),
                job: Mutex::new(None),
            }),
        }
    }

    /// Send events to the job files until the scope is dropped
    pub fn enter_job(&self, out: &Path, err: &Path) -> JobLogScope {
        let files = JobFiles {
            out: LazyFile::new(out),
            err: LazyFile::new(err),
        };
        let previous = lock(&self.inner.job).replace(files);
        JobLogScope {
            router: Some(self.clone()),
            previous,
        }
    }

    fn writer(&self, is_error: bool) -> RoutedWriter {
        let job = lock(&self.inner.job).clone();
        match job {
            Some(files) => RoutedWriter::Job {
                out: files.out,
                err: is_error.then_some(files.err),
            },
            None => RoutedWriter::Process {
                out: self.inner.base_out.clone(),
                err: is_error.then(|| self.inner.base_err.clone()),
            },
        }
    }
}

impl<'a> MakeWriter<'a> for LogRouter {
    type Writer = RoutedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.writer(false)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        self.writer(*meta.level() == Level::ERROR)
    }
}

/// Writer for one event
pub enum RoutedWriter {
    Process {
        out: NonBlocking,
        err: Option<LazyFile>,
    },
    Job {
        out: LazyFile,
        err: Option<LazyFile>,
    },
}

impl Write for RoutedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let err = match self {
            RoutedWriter::Process { out, err } => {
                out.write_all(buf)?;
                err
            }
            RoutedWriter::Job { out, err } => {
                out.write_all(buf)?;
                err
            }
        };
        if let Some(err) = err {
            err.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            RoutedWriter::Process { out, .. } => out.flush(),
            RoutedWriter::Job { .. } => Ok(()),
        }
    }
}

/// Restores the previous routing on drop
#[must_use = "routing reverts as soon as the scope is dropped"]
pub struct JobLogScope {
    router: Option<LogRouter>,
    previous: Option<JobFiles>,
}

impl JobLogScope {
    /// A scope that routes nothing, for processes without file logging
    pub fn inert() -> Self {
        Self {
            router: None,
            previous: None,
        }
    }
}

impl Drop for JobLogScope {
    fn drop(&mut self) {
        if let Some(router) = self.router.take() {
            *lock(&router.inner.job) = self.previous.take();
        }
    }
}
