//! Cancellable background tasks.
//!
//! [`TaskHandle::spawn`] runs a future on the tokio runtime and keeps two ways
//! to end it early:
//! - [`TaskHandle::abort`] kills it at its next suspension point, discarding the
//!   continuation
//! - [`TaskHandle::cancel`] signals it through its [`CancelSignal`] and lets it
//!   decide where to stop
//!
//! Both wait for the task to be gone before returning, so hardware commands
//! issued afterwards cannot race a command still in flight from the task.
//! Dropping a handle detaches the task; it keeps running.

use std::future::Future;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Cooperative cancellation request delivered to a spawned task.
#[derive(Debug)]
pub struct CancelSignal {
    rx: oneshot::Receiver<()>,
}

impl CancelSignal {
    /// Resolve once cancellation is requested.
    ///
    /// Never resolves if the handle was dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if (&mut self.rx).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Handle to a spawned background task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    name: String,
    join: JoinHandle<T>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Spawn `body` with a fresh cancel signal.
    pub fn spawn<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let name = name.into();
        let (cancel_tx, rx) = oneshot::channel();
        let join = tokio::spawn(body(CancelSignal { rx }));
        tracing::debug!(task = %name, "spawned");
        Self {
            name,
            join,
            cancel_tx: Some(cancel_tx),
        }
    }

    /// Task name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the task has completed (normally, by panic or by abort).
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for completion. `None` if the task panicked or was aborted.
    pub async fn join(self) -> Option<T> {
        match self.join.await {
            Ok(value) => Some(value),
            Err(e) => {
                if e.is_panic() {
                    tracing::error!(task = %self.name, "background task panicked");
                }
                None
            }
        }
    }

    /// Kill the task and wait for it to be gone.
    ///
    /// Returns `Some` only if the task had already completed on its own.
    pub async fn abort(self) -> Option<T> {
        self.join.abort();
        let name = self.name.clone();
        let result = self.join().await;
        if result.is_none() {
            tracing::debug!(task = %name, "aborted");
        }
        result
    }

    /// Request cooperative cancellation and wait for the task to finish.
    pub async fn cancel(mut self) -> Option<T> {
        if let Some(tx) = self.cancel_tx.take() {
            // The task may already be done and have dropped its signal.
            let _ = tx.send(());
        }
        self.join().await
    }
}
