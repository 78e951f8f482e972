//! Hardware safing.
//!
//! A [`SafingSequence`] is an ordered list of best-effort steps that bring
//! devices back to a safe state after a cancellation or failure. Every step
//! runs even if an earlier one failed; failures are logged and collected into
//! a single [`DaqError::ShutdownFailed`].
//!
//! # Example
//!
//! ```rust,ignore
//! let mut safing = SafingSequence::new("collection stop");
//! safing.add("close shutter", async { close_session(true).await });
//! safing.add("stop detector", async { force_stop().await });
//! safing.run().await?;
//! ```

use crate::error::{AppResult, DaqError};
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;

/// Type alias for a boxed safing step.
pub type SafingStep<'a> = BoxFuture<'a, AppResult<()>>;

/// Ordered, best-effort cleanup steps.
pub struct SafingSequence<'a> {
    label: String,
    steps: Vec<(String, SafingStep<'a>)>,
}

impl<'a> SafingSequence<'a> {
    /// Create an empty sequence.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step. Steps run in the order they were added.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        step: impl Future<Output = AppResult<()>> + Send + 'a,
    ) {
        self.steps.push((name.into(), step.boxed()));
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no steps were added.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order, continuing past failures.
    pub async fn run(self) -> AppResult<()> {
        let mut errors = Vec::new();
        for (name, step) in self.steps {
            tracing::info!(sequence = %self.label, step = %name, "Running safing step");
            if let Err(e) = step.await {
                tracing::error!(sequence = %self.label, step = %name, error = %e, "Safing step failed");
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_runs_in_order_past_failures() {
        let order = Mutex::new(Vec::new());
        let mut safing = SafingSequence::new("test");
        safing.add("first", async {
            order.lock().unwrap().push("first");
            Ok(())
        });
        safing.add("second", async {
            order.lock().unwrap().push("second");
            Err(DaqError::device("detector", "no reply"))
        });
        safing.add("third", async {
            order.lock().unwrap().push("third");
            Ok(())
        });
        assert_eq!(safing.len(), 3);

        let err = safing.run().await.unwrap_err();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
        match err {
            DaqError::ShutdownFailed(errors) => assert_eq!(errors.len(), 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_sequence_succeeds() {
        let safing = SafingSequence::new("nothing");
        assert!(safing.is_empty());
        assert!(safing.run().await.is_ok());
    }
}
