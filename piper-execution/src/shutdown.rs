//! Stopping executor and cache manager processes
//!
//! Every child of the pool gets SIGTERM first. Executors use it to finish
//! their storage session, the cache manager to unlink its segments. Anything
//! still alive after the grace period is killed and reaped.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::ProcessLifecycleError;

/// How long a killed process gets before we give up on reaping it
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Send `signal` to `pid`
pub fn send_signal(pid: u32, sig: Signal) -> Result<(), ProcessLifecycleError> {
    signal::kill(Pid::from_raw(pid as i32), sig)
        .map_err(|errno| ProcessLifecycleError::Signal { pid, errno })
}

/// How a pool child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stopped {
    /// It was already gone before we signalled it
    Exited(ExitStatus),
    /// It honoured SIGTERM within the grace period
    Terminated(ExitStatus),
    /// It had to be killed
    Killed(ExitStatus),
}

impl Stopped {
    pub fn status(&self) -> ExitStatus {
        match self {
            Stopped::Exited(status) | Stopped::Terminated(status) | Stopped::Killed(status) => {
                *status
            }
        }
    }
}

/// A child process together with the name it is logged under
#[derive(Debug)]
pub struct PoolChild {
    pub label: String,
    pub child: Child,
}

impl PoolChild {
    pub fn new(label: impl Into<String>, child: Child) -> Self {
        Self {
            label: label.into(),
            child,
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL and reap
    pub async fn stop(mut self, grace: Duration) -> Result<Stopped, ProcessLifecycleError> {
        let label = self.label;
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!("{} had already exited: {}", label, status);
            return Ok(Stopped::Exited(status));
        }

        if let Some(pid) = self.child.id() {
            debug!("Sending SIGTERM to {} (pid {})", label, pid);
            if let Err(e) = send_signal(pid, Signal::SIGTERM) {
                warn!("{}: {}", label, e);
            }
        }
        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!("{} stopped: {}", label, status);
                return Ok(Stopped::Terminated(status));
            }
            Ok(Err(e)) => warn!("Waiting for {} failed: {}", label, e),
            Err(_) => warn!("{} ignored SIGTERM for {:?}, killing it", label, grace),
        }

        self.child
            .start_kill()
            .map_err(|e| ProcessLifecycleError::Wait(format!("{}: {}", label, e)))?;
        match timeout(KILL_WAIT, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!("{} killed: {}", label, status);
                Ok(Stopped::Killed(status))
            }
            Ok(Err(e)) => Err(ProcessLifecycleError::Wait(format!("{}: {}", label, e))),
            Err(_) => Err(ProcessLifecycleError::Wait(format!(
                "{} survived SIGKILL",
                label
            ))),
        }
    }
}

/// Stop all `children` concurrently, sharing one grace period
pub async fn stop_all(
    children: Vec<PoolChild>,
    grace: Duration,
) -> Vec<Result<Stopped, ProcessLifecycleError>> {
    futures::future::join_all(children.into_iter().map(|child| child.stop(grace))).await
}
