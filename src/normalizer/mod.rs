//! Periodic pledge normalization
//!
//! Finds pledges whose commitment window elapsed with value still waiting
//! on a proposed project and submits the housekeeping transaction that
//! finalizes the assignment, in adaptively-sized batches.

use crate::config::NormalizerConfig;
use crate::error::SyncResult;
use crate::ledger::{LedgerClient, PendingTx, PledgeId};
use crate::store::{DonationQuery, DonationStatus, RecordStore};
use crate::tx::TransactionSubmitter;

use chrono::Utc;
use ethers::types::Address;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Discovers overdue pledges and drives `normalizePledge` submissions.
///
/// Batches shrink by half on failure down to size 1, which isolates a
/// single bad pledge without failing the rest. A pledge whose transaction
/// got a broadcast ack is not resubmitted while its donation still shows
/// up in discovery.
pub struct Normalizer {
    store: Arc<dyn RecordStore>,
    ledger: Arc<dyn LedgerClient>,
    submitter: Arc<TransactionSubmitter>,
    funding_address: Option<Address>,
    batch_size: usize,
    run_interval: Duration,
    /// Pledge ids broadcast this process lifetime, pruned each run to the
    /// currently-discovered set
    broadcast: Mutex<HashSet<PledgeId>>,
    shutdown: RwLock<bool>,
}

impl Normalizer {
    pub fn new(
        store: Arc<dyn RecordStore>,
        ledger: Arc<dyn LedgerClient>,
        submitter: Arc<TransactionSubmitter>,
        funding_address: Option<Address>,
        config: &NormalizerConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            submitter,
            funding_address,
            batch_size: config.batch_size.max(1),
            run_interval: Duration::from_secs(config.interval_secs),
            broadcast: Mutex::new(HashSet::new()),
            shutdown: RwLock::new(false),
        }
    }

    /// Scheduling loop. Runs never overlap: the next tick is not honored
    /// until the in-flight run finishes.
    pub async fn run(&self) {
        let Some(from) = self.funding_address else {
            warn!("No funding account configured, normalizer will not run");
            return;
        };

        let mut ticker = interval(self.run_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Normalizer started (every {:?}, batch size {})",
            self.run_interval, self.batch_size
        );

        loop {
            ticker.tick().await;
            if *self.shutdown.read().await {
                break;
            }

            if let Err(e) = self.run_once(from).await {
                error!("Normalization run failed: {}", e);
            }
        }

        info!("Normalizer stopped");
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }

    /// One discovery-and-submit pass.
    pub async fn run_once(&self, from: Address) -> SyncResult<()> {
        let discovered = self.discover().await?;

        let todo: Vec<PledgeId> = {
            let keep: HashSet<PledgeId> = discovered.iter().copied().collect();
            let mut broadcast = self.broadcast.lock().await;
            // Ids leave the guard once the store reflects normalization
            broadcast.retain(|id| keep.contains(id));
            discovered
                .iter()
                .copied()
                .filter(|id| !broadcast.contains(id))
                .collect()
        };

        if todo.is_empty() {
            debug!("No pledges due for normalization");
            return Ok(());
        }

        info!("{} pledge(s) due for normalization", todo.len());

        for batch in todo.chunks(self.batch_size) {
            self.submit_batch(from, batch.to_vec()).await;
        }

        Ok(())
    }

    /// Distinct pledge ids, in first-seen order, behind donations still
    /// awaiting project approval past their commitment window. Splits can
    /// leave several donations on one pledge.
    async fn discover(&self) -> SyncResult<Vec<PledgeId>> {
        let donations = self
            .store
            .find_donations(&DonationQuery {
                status: Some(DonationStatus::ToApprove),
                requires_proposed_project: true,
                nonzero_amount: true,
                commit_time_before: Some(Utc::now()),
                ..Default::default()
            })
            .await?;

        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for donation in donations {
            if seen.insert(donation.pledge_id) {
                ids.push(donation.pledge_id);
            }
        }
        Ok(ids)
    }

    /// Submit one batch; on failure halve and retry the same pledges
    /// before moving on. A pledge failing alone is logged for manual
    /// follow-up and picked up again on the next scheduled run.
    fn submit_batch(&self, from: Address, ids: Vec<PledgeId>) -> BoxFuture<'_, ()> {
        async move {
            match self.send(from, &ids).await {
                Ok(pending) => {
                    info!(
                        "Normalization batch of {} broadcast as {:?}",
                        ids.len(),
                        pending.tx_hash
                    );
                    crate::metrics::record_normalize_batch(true);
                    crate::metrics::record_normalize_pledges(ids.len());

                    self.broadcast.lock().await.extend(ids.iter().copied());

                    let tx_hash = pending.tx_hash;
                    tokio::spawn(async move {
                        match pending.confirmation.await {
                            Ok(receipt) => debug!(
                                "Normalization tx {:?} mined in block {:?}",
                                tx_hash, receipt.block_number
                            ),
                            Err(e) => {
                                warn!("Normalization tx {:?} never confirmed: {}", tx_hash, e)
                            }
                        }
                    });
                }
                Err(e) if ids.len() == 1 => {
                    // Likely a state mismatch between the store and the
                    // ledger, e.g. the pledge was normalized out-of-band
                    error!(
                        "Pledge {} failed to normalize, leaving for manual follow-up: {}",
                        ids[0], e
                    );
                    crate::metrics::record_normalize_batch(false);
                }
                Err(e) => {
                    let half = (ids.len() / 2).max(1);
                    warn!(
                        "Normalization batch of {} failed ({}), retrying in batches of {}",
                        ids.len(),
                        e,
                        half
                    );
                    crate::metrics::record_normalize_batch(false);

                    for chunk in ids.chunks(half) {
                        self.submit_batch(from, chunk.to_vec()).await;
                    }
                }
            }
        }
        .boxed()
    }

    async fn send(&self, from: Address, ids: &[PledgeId]) -> SyncResult<PendingTx> {
        let ledger = self.ledger.clone();

        if let [id] = ids {
            let id = *id;
            self.submitter
                .submit(from, move |nonce| async move {
                    ledger.normalize_pledge(id, nonce).await
                })
                .await
        } else {
            let ids = ids.to_vec();
            self.submitter
                .submit(from, move |nonce| async move {
                    ledger.m_normalize_pledge(ids, nonce).await
                })
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::ledger::MockLedgerClient;
    use crate::testutil::{to_approve_donation, MemoryStore};
    use ethers::types::{TransactionReceipt, H256};
    use mockall::Sequence;

    fn config(batch_size: usize) -> NormalizerConfig {
        NormalizerConfig {
            interval_secs: 300,
            batch_size,
        }
    }

    fn pending() -> PendingTx {
        PendingTx {
            tx_hash: H256::repeat_byte(0xee),
            confirmation: futures::future::ready(Ok(TransactionReceipt::default())).boxed(),
        }
    }

    async fn store_with_pledges(ids: std::ops::Range<u64>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for id in ids {
            store
                .create_donation(to_approve_donation(id, 5, 10))
                .await
                .unwrap();
        }
        store
    }

    fn normalizer(
        store: Arc<MemoryStore>,
        ledger: MockLedgerClient,
        batch_size: usize,
    ) -> Normalizer {
        let ledger: Arc<dyn LedgerClient> = Arc::new(ledger);
        let submitter = Arc::new(TransactionSubmitter::new(ledger.clone()));
        Normalizer::new(store, ledger, submitter, Some(Address::repeat_byte(9)), &config(batch_size))
    }

    #[tokio::test(start_paused = true)]
    async fn forty_five_pledges_make_three_batches() {
        let store = store_with_pledges(100..145).await;

        let mut seq = Sequence::new();
        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_get_pending_nonce()
            .times(1)
            .returning(|_| Ok(0));
        for (len, nonce) in [(20usize, 0u64), (20, 1), (5, 2)] {
            ledger
                .expect_m_normalize_pledge()
                .withf(move |ids, n| ids.len() == len && *n == nonce)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(pending()));
        }

        let normalizer = normalizer(store, ledger, 20);
        normalizer
            .run_once(Address::repeat_byte(9))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_is_halved_before_the_remainder() {
        let store = store_with_pledges(100..145).await;

        let mut seq = Sequence::new();
        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_get_pending_nonce()
            .times(1)
            .returning(|_| Ok(0));

        // First batch of 20 broadcasts with nonce 0
        ledger
            .expect_m_normalize_pledge()
            .withf(|ids, n| ids.len() == 20 && *n == 0)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(pending()));
        // Second batch of 20 fails before broadcast; nonce 1 is reusable
        ledger
            .expect_m_normalize_pledge()
            .withf(|ids, n| ids.len() == 20 && *n == 1)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(SyncError::Transaction("node rejected".to_string())));
        // Its pledges retry as two batches of 10, reusing nonce 1
        for nonce in [1u64, 2] {
            ledger
                .expect_m_normalize_pledge()
                .withf(move |ids, n| ids.len() == 10 && *n == nonce)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(pending()));
        }
        // The remaining 5 follow
        ledger
            .expect_m_normalize_pledge()
            .withf(|ids, n| ids.len() == 5 && *n == 3)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(pending()));

        let normalizer = normalizer(store, ledger, 20);
        normalizer
            .run_once(Address::repeat_byte(9))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn single_pledge_uses_the_single_call_and_gives_up_on_failure() {
        let store = store_with_pledges(100..101).await;

        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_get_pending_nonce()
            .times(1)
            .returning(|_| Ok(0));
        ledger
            .expect_normalize_pledge()
            .withf(|id, _| *id == 100)
            .times(1)
            .returning(|_, _| Err(SyncError::Transaction("mismatch".to_string())));

        let normalizer = normalizer(store.clone(), ledger, 20);
        normalizer
            .run_once(Address::repeat_byte(9))
            .await
            .unwrap();

        // A failure at size 1 never enters the broadcast guard, so the
        // next run tries again
        assert!(normalizer.broadcast.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_pledges_are_not_resubmitted() {
        let store = store_with_pledges(100..103).await;

        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_get_pending_nonce()
            .times(1)
            .returning(|_| Ok(0));
        ledger
            .expect_m_normalize_pledge()
            .times(1)
            .returning(|_, _| Ok(pending()));

        let normalizer = normalizer(store, ledger, 20);
        let from = Address::repeat_byte(9);

        normalizer.run_once(from).await.unwrap();
        // Store still shows the donations, but all three ids are guarded
        normalizer.run_once(from).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_donations_on_one_pledge_submit_once() {
        let store = Arc::new(MemoryStore::new());
        // Two split siblings on the same pledge
        store.create_donation(to_approve_donation(7, 5, 10)).await.unwrap();
        store.create_donation(to_approve_donation(7, 5, 20)).await.unwrap();

        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_get_pending_nonce()
            .times(1)
            .returning(|_| Ok(0));
        ledger
            .expect_normalize_pledge()
            .withf(|id, _| *id == 7)
            .times(1)
            .returning(|_, _| Ok(pending()));

        let normalizer = normalizer(store, ledger, 20);
        normalizer
            .run_once(Address::repeat_byte(9))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn inert_without_a_funding_account() {
        let store = Arc::new(MemoryStore::new());
        let ledger: Arc<dyn LedgerClient> = Arc::new(MockLedgerClient::new());
        let submitter = Arc::new(TransactionSubmitter::new(ledger.clone()));

        let normalizer = Normalizer::new(store, ledger, submitter, None, &config(20));

        // Returns immediately instead of scheduling
        normalizer.run().await;
    }
}
