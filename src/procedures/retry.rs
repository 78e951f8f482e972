//! Bounded polling.
//!
//! Every wait on hardware goes through [`RetryPolicy`]: a fixed number of
//! polls separated by a fixed interval. Exhausting the cap is a
//! [`DaqError::Timeout`], never an open-ended hang.

use crate::error::{AppResult, DaqError, DeviceResultExt};
use crate::hardware::capabilities::Movable;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Fixed-interval, fixed-cap polling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of polls
    pub attempts: u32,
    /// Pause between polls
    pub interval: Duration,
}

impl RetryPolicy {
    /// Create a policy probing `attempts` times, `interval` apart.
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Create a policy from a millisecond interval.
    pub fn from_millis(attempts: u32, interval_ms: u64) -> Self {
        Self::new(attempts, Duration::from_millis(interval_ms))
    }

    /// Poll `check` until it reports `true`.
    ///
    /// The check receives the 1-based attempt number and is called at most
    /// `attempts` times; there is no sleep after the last poll. Returns the
    /// attempt that succeeded. Check errors are returned immediately.
    pub async fn poll_until<F, Fut>(&self, what: &str, mut check: F) -> AppResult<u32>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AppResult<bool>>,
    {
        for attempt in 1..=self.attempts {
            if check(attempt).await? {
                return Ok(attempt);
            }
            if attempt < self.attempts {
                sleep(self.interval).await;
            }
        }
        Err(DaqError::Timeout {
            what: what.to_string(),
            attempts: self.attempts,
        })
    }

    /// Wait until `axis` reports it is no longer moving.
    pub async fn wait_idle(&self, axis: &dyn Movable) -> AppResult<()> {
        let name = axis.name();
        self.poll_until(&format!("axis {name} to stop"), move |_| async move {
            Ok(!axis.is_moving().await.device(name)?)
        })
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockAxis;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_returns_successful_attempt() {
        let policy = RetryPolicy::from_millis(10, 100);
        let attempt = policy
            .poll_until("third time lucky", |n| async move { Ok(n == 3) })
            .await
            .unwrap();
        assert_eq!(attempt, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_exactly_cap_times() {
        let polls = AtomicU32::new(0);
        let policy = RetryPolicy::from_millis(120, 500);
        let start = tokio::time::Instant::now();

        let err = policy
            .poll_until("detector", |_| {
                polls.fetch_add(1, Ordering::SeqCst);
                async { Ok(false) }
            })
            .await
            .unwrap_err();

        assert_eq!(polls.load(Ordering::SeqCst), 120);
        assert!(matches!(err, DaqError::Timeout { attempts: 120, .. }));
        // 119 pauses between 120 polls
        assert_eq!(start.elapsed(), Duration::from_millis(119 * 500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_error_is_not_retried() {
        let polls = AtomicU32::new(0);
        let policy = RetryPolicy::from_millis(5, 10);
        let err = policy
            .poll_until("broken", |_| {
                polls.fetch_add(1, Ordering::SeqCst);
                async { Err(DaqError::device("i0", "no reply")) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Device { .. }));
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle() {
        let axis = MockAxis::new("omega").with_motion_polls(3);
        axis.move_abs(1.0).await.unwrap();
        RetryPolicy::from_millis(5, 50).wait_idle(&axis).await.unwrap();

        axis.move_abs(2.0).await.unwrap();
        let err = RetryPolicy::from_millis(2, 50)
            .wait_idle(&axis)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("axis omega to stop"));
    }
}
