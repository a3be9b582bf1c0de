//! Nonce lease coordination for one sending address
//!
//! Handles:
//! - Strictly serialized lease hand-out (one in flight at a time)
//! - Returning a nonce to the pool when a send never broadcast
//! - Rejecting out-of-order releases as contract violations

use crate::error::{SyncError, SyncResult};

use tokio::sync::{Mutex, Notify};
use tracing::debug;

struct TrackerState {
    /// Next nonce to hand out; None until the on-chain count is known
    next: Option<u64>,
    /// Whether a lease is currently outstanding
    leased: bool,
}

/// Serializes nonce use for a single sending address.
///
/// `obtain` suspends until the tracker is initialized and the previous
/// lease was released, so concurrent submitters get strictly increasing
/// values with no gaps as long as their sends succeed.
pub struct NonceTracker {
    state: Mutex<TrackerState>,
    wake: Notify,
}

/// Reservation of one nonce value. Move-only: released exactly once,
/// never cloned.
#[derive(Debug)]
pub struct NonceLease {
    value: u64,
}

impl NonceLease {
    pub fn value(&self) -> u64 {
        self.value
    }
}

impl NonceTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                next: None,
                leased: false,
            }),
            wake: Notify::new(),
        }
    }

    /// Seed the counter from the address's pending transaction count.
    /// The first call wins; later calls are ignored and return false.
    pub async fn initialize(&self, nonce: u64) -> bool {
        let mut state = self.state.lock().await;
        if state.next.is_some() {
            return false;
        }
        state.next = Some(nonce);
        drop(state);

        debug!("Nonce tracker initialized at {}", nonce);
        self.wake.notify_waiters();
        true
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.lock().await.next.is_some()
    }

    /// Reserve the next nonce. Suspends while the tracker is
    /// uninitialized or another lease is outstanding.
    pub async fn obtain(&self) -> NonceLease {
        loop {
            // Register for a wakeup before inspecting state, so a release
            // landing between the unlock and the await is not missed
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if let Some(next) = state.next {
                    if !state.leased {
                        state.leased = true;
                        state.next = Some(next + 1);
                        debug!("Leased nonce {}", next);
                        return NonceLease { value: next };
                    }
                }
            }

            notified.await;
        }
    }

    /// Give a lease back, exactly once.
    ///
    /// `success = false` returns the value to the pool for the next
    /// `obtain`. Releasing anything other than the most recent lease is
    /// a protocol violation and fails without touching the counter.
    pub async fn release(&self, lease: NonceLease, success: bool) -> SyncResult<()> {
        let mut state = self.state.lock().await;

        let next = state
            .next
            .ok_or_else(|| SyncError::Internal("Nonce release before initialize".to_string()))?;

        if !state.leased || lease.value + 1 != next {
            return Err(SyncError::NonceContract {
                released: lease.value,
                expected: next.saturating_sub(1),
            });
        }

        state.leased = false;
        if !success {
            state.next = Some(lease.value);
            debug!("Nonce {} returned to pool", lease.value);
        }
        drop(state);

        crate::metrics::record_nonce_lease(if success { "used" } else { "unused" });
        self.wake.notify_waiters();
        Ok(())
    }
}

impl Default for NonceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn sequential_leases_are_contiguous() {
        let tracker = NonceTracker::new();
        tracker.initialize(5).await;

        for expected in 5..8 {
            let lease = tracker.obtain().await;
            assert_eq!(lease.value(), expected);
            tracker.release(lease, true).await.unwrap();
        }
    }

    #[tokio::test]
    async fn concurrent_obtainers_get_distinct_increasing_values() {
        let tracker = Arc::new(NonceTracker::new());
        tracker.initialize(0).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                let lease = tracker.obtain().await;
                let value = lease.value();
                tracker.release(lease, true).await.unwrap();
                value
            }));
        }

        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap());
        }
        values.sort_unstable();

        assert_eq!(values, (0..10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn failed_release_returns_value_to_pool() {
        let tracker = NonceTracker::new();
        tracker.initialize(3).await;

        let lease = tracker.obtain().await;
        assert_eq!(lease.value(), 3);
        tracker.release(lease, false).await.unwrap();

        let lease = tracker.obtain().await;
        assert_eq!(lease.value(), 3);
    }

    #[tokio::test]
    async fn out_of_order_release_is_rejected() {
        let tracker = NonceTracker::new();
        tracker.initialize(10).await;

        let lease = tracker.obtain().await;

        let rogue = NonceLease { value: 99 };
        let err = tracker.release(rogue, true).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::NonceContract {
                released: 99,
                expected: 10
            }
        ));

        // The real lease is still valid
        tracker.release(lease, true).await.unwrap();
    }

    #[tokio::test]
    async fn double_release_is_rejected() {
        let tracker = NonceTracker::new();
        tracker.initialize(0).await;

        let lease = tracker.obtain().await;
        tracker.release(lease, true).await.unwrap();

        let stale = NonceLease { value: 0 };
        assert!(tracker.release(stale, true).await.is_err());
    }

    #[tokio::test]
    async fn obtain_waits_for_initialize() {
        let tracker = Arc::new(NonceTracker::new());

        let waiting = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.obtain().await.value() })
        };

        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(!waiting.is_finished());

        tracker.initialize(7).await;
        assert_eq!(waiting.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn obtain_waits_for_outstanding_lease() {
        let tracker = Arc::new(NonceTracker::new());
        tracker.initialize(0).await;

        let first = tracker.obtain().await;

        let second = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.obtain().await.value() })
        };

        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(!second.is_finished());

        tracker.release(first, true).await.unwrap();
        assert_eq!(second.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn second_initialize_is_ignored() {
        let tracker = NonceTracker::new();
        assert!(tracker.initialize(4).await);
        assert!(!tracker.initialize(100).await);

        let lease = tracker.obtain().await;
        assert_eq!(lease.value(), 4);
        tracker.release(lease, true).await.unwrap();
    }
}
