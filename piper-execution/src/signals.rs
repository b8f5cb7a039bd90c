//! Unix signal plumbing for worker and executor processes

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Requests cancellation of the task an executor is running
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl CancelHandle {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the executor is gone
    pub fn cancel(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

/// Turn every SIGUSR2 into a cancellation request
pub fn forward_cancel_signal(handle: CancelHandle) -> std::io::Result<JoinHandle<()>> {
    let mut usr2 = signal(SignalKind::user_defined2())?;
    Ok(tokio::spawn(async move {
        while usr2.recv().await.is_some() {
            debug!("SIGUSR2 received, cancelling the running task");
            if !handle.cancel() {
                break;
            }
        }
    }))
}

/// Resolves on the first SIGTERM
///
/// If the handler cannot be installed the future never resolves; the
/// process then only stops through `QUIT`.
pub async fn terminated() {
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
            debug!("SIGTERM received");
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
