//! Single ownership of the beam.
//!
//! The shutter and detector may only be driven by one procedure at a time.
//! Procedures sharing a [`BeamLease`] take it with [`BeamLease::try_acquire`];
//! a second request while it is held is rejected with [`DaqError::Busy`],
//! never queued behind or interleaved with the holder.

use crate::error::{AppResult, DaqError};
use crate::procedures::lock;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Shared single-owner token.
#[derive(Debug, Clone, Default)]
pub struct BeamLease {
    slot: Arc<AsyncMutex<()>>,
    holder: Arc<Mutex<Option<String>>>,
}

/// Proof of ownership; the lease is released on drop.
#[derive(Debug)]
pub struct LeaseGuard {
    _guard: OwnedMutexGuard<()>,
    holder: Arc<Mutex<Option<String>>>,
}

impl BeamLease {
    /// Create a free lease.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `owner`, or fail with `Busy` naming the current holder.
    pub fn try_acquire(&self, owner: &str) -> AppResult<LeaseGuard> {
        match self.slot.clone().try_lock_owned() {
            Ok(guard) => {
                *lock(&self.holder) = Some(owner.to_string());
                Ok(LeaseGuard {
                    _guard: guard,
                    holder: self.holder.clone(),
                })
            }
            Err(_) => {
                let holder = lock(&self.holder)
                    .clone()
                    .unwrap_or_else(|| "another operation".to_string());
                Err(DaqError::Busy(format!(
                    "beam is in use by {holder}, {owner} rejected"
                )))
            }
        }
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Option<String> {
        lock(&self.holder).clone()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        *lock(&self.holder) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_owner_rejected() {
        let lease = BeamLease::new();
        let guard = lease.try_acquire("centering").unwrap();
        assert_eq!(lease.holder().as_deref(), Some("centering"));

        let err = lease.try_acquire("collection").unwrap_err();
        assert!(matches!(err, DaqError::Busy(ref msg) if msg.contains("centering")));

        drop(guard);
        assert!(lease.holder().is_none());
        assert!(lease.try_acquire("collection").is_ok());
    }
}
