//! Submits transactions under a held nonce lease

use crate::error::SyncResult;
use crate::ledger::{LedgerClient, PendingTx};

use super::nonce::NonceTracker;

use dashmap::DashMap;
use ethers::types::Address;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

const INIT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Wraps a "send transaction" operation with nonce lease and release.
///
/// One tracker exists per sending address, created lazily. The lease is
/// released as soon as the send closure resolves: broadcast acceptance
/// consumes the nonce, an error before broadcast returns it to the pool.
/// Whatever the confirmation future does later never rolls a nonce back.
pub struct TransactionSubmitter {
    ledger: Arc<dyn LedgerClient>,
    trackers: DashMap<Address, Arc<NonceTracker>>,
    init_retry_delay: Duration,
}

impl TransactionSubmitter {
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self {
            ledger,
            trackers: DashMap::new(),
            init_retry_delay: INIT_RETRY_DELAY,
        }
    }

    /// Override the delay between pending-nonce fetch attempts
    pub fn with_init_retry_delay(mut self, delay: Duration) -> Self {
        self.init_retry_delay = delay;
        self
    }

    /// Run `send` with a leased nonce for `from`.
    ///
    /// The closure must resolve to `Ok(PendingTx)` only once the node
    /// accepted the broadcast; any `Err` means nothing went out and the
    /// nonce is safe to reuse.
    pub async fn submit<F, Fut>(&self, from: Address, send: F) -> SyncResult<PendingTx>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = SyncResult<PendingTx>>,
    {
        let tracker = self
            .trackers
            .entry(from)
            .or_insert_with(|| Arc::new(NonceTracker::new()))
            .clone();

        self.ensure_initialized(from, &tracker).await;

        let lease = tracker.obtain().await;
        let nonce = lease.value();

        match send(nonce).await {
            Ok(pending) => {
                // Broadcast accepted, the nonce is spent no matter what
                // confirmation later says
                if let Err(e) = tracker.release(lease, true).await {
                    error!("Nonce release after broadcast failed: {}", e);
                }
                Ok(pending)
            }
            Err(e) => {
                warn!("Send with nonce {} failed before broadcast: {}", nonce, e);
                if let Err(release_err) = tracker.release(lease, false).await {
                    error!("Nonce release after failure failed: {}", release_err);
                }
                Err(e)
            }
        }
    }

    /// Fetch the address's pending count until it sticks. There is no
    /// give-up path; an address in use must eventually initialize.
    async fn ensure_initialized(&self, address: Address, tracker: &NonceTracker) {
        if tracker.is_initialized().await {
            return;
        }

        loop {
            match self.ledger.get_pending_nonce(address).await {
                Ok(nonce) => {
                    if tracker.initialize(nonce).await {
                        info!("Nonce for {:?} initialized at {}", address, nonce);
                    }
                    return;
                }
                Err(e) => {
                    warn!(
                        "Failed to fetch pending nonce for {:?}, retrying: {}",
                        address, e
                    );
                    sleep(self.init_retry_delay).await;
                }
            }
        }
    }
}
