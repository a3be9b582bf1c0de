//! Transfer-event reconciliation
//!
//! Keeps the record store's donations in line with the ledger's
//! `Transfer` stream. Events can arrive out of causal order: a transfer
//! may reference a donation whose record is still being written. Ordering
//! is restored with a single delayed re-attempt per event and a per-pledge
//! queue of deferred continuations.

mod queue;
mod timestamps;

pub use queue::TransferQueue;
pub use timestamps::BlockTimestampCache;

use crate::error::SyncResult;
use crate::ledger::{Delegate, LedgerClient, PaymentState, Pledge, TransferEvent};
use crate::store::{
    AdminType, Donation, DonationPatch, DonationQuery, DonationStatus, NewDonation,
    NewDonationHistory, PledgeAdmin, RecordStore,
};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// What the caller should do with the event after one attempt
#[derive(Debug)]
enum Flow {
    Done,
    /// The record another code path is writing has not landed yet;
    /// re-run the whole event once after a fixed delay
    Retry,
}

/// Drives donation records from the ledger's `Transfer` stream.
///
/// One record per pledge lineage: a full-amount transfer moves the
/// record in place, a partial transfer reduces it and spawns a sibling.
pub struct PledgeEventReconciler {
    store: Arc<dyn RecordStore>,
    ledger: Arc<dyn LedgerClient>,
    queue: TransferQueue,
    timestamps: BlockTimestampCache,
    retry_delay: Duration,
}

/// Everything resolved up front for one transfer between pledges
struct TransferContext {
    event: TransferEvent,
    block_timestamp: u64,
    from_pledge: Pledge,
    to_pledge: Pledge,
    to_admin: PledgeAdmin,
    delegate: Option<Delegate>,
    proposed: Option<PledgeAdmin>,
}

/// The donation fields a transfer's destination dictates
struct DestinationState {
    status: DonationStatus,
    payment_status: PaymentState,
    owner: String,
    owner_id: u64,
    owner_type: AdminType,
    delegate: Option<String>,
    delegate_id: Option<u64>,
    proposed_project_id: Option<u64>,
    commit_time: DateTime<Utc>,
}

/// Status of a donation after landing on `to_pledge`, applied literally:
/// a pending proposed project wins, then a plain user manager or a
/// present delegate commits, anything else waits.
fn status_for(
    to_pledge: &Pledge,
    to_admin: &PledgeAdmin,
    delegate: Option<&Delegate>,
) -> DonationStatus {
    if to_pledge.has_proposed_project() {
        DonationStatus::ToApprove
    } else if to_admin.is_giver() || delegate.is_some() {
        DonationStatus::Committed
    } else {
        DonationStatus::Waiting
    }
}

/// The pledge's absolute commit time when it has one, the event's block
/// timestamp otherwise
fn commit_time_for(pledge: &Pledge, block_timestamp: u64) -> DateTime<Utc> {
    let secs = if pledge.commit_time > 0 {
        pledge.commit_time
    } else {
        block_timestamp
    };
    DateTime::from_timestamp(secs as i64, 0).unwrap_or_else(Utc::now)
}

fn delegate_label(delegate: &Delegate) -> String {
    if delegate.name.is_empty() {
        format!("{:?}", delegate.address)
    } else {
        delegate.name.clone()
    }
}

fn destination_state(
    to_pledge: &Pledge,
    to_admin: &PledgeAdmin,
    delegate: Option<&Delegate>,
    block_timestamp: u64,
) -> DestinationState {
    // Entering payout clears delegation rights
    let paying = to_pledge.payment_state == PaymentState::Paying;

    let (delegate_name, delegate_id) = match delegate {
        Some(d) if !paying => (Some(delegate_label(d)), Some(d.id)),
        _ => (None, None),
    };
    let proposed_project_id = if !paying && to_pledge.has_proposed_project() {
        Some(to_pledge.proposed_project)
    } else {
        None
    };

    DestinationState {
        status: status_for(to_pledge, to_admin, delegate),
        payment_status: to_pledge.payment_state,
        owner: to_admin.label().to_string(),
        owner_id: to_pledge.owner,
        owner_type: to_admin.admin_type,
        delegate: delegate_name,
        delegate_id,
        proposed_project_id,
        commit_time: commit_time_for(to_pledge, block_timestamp),
    }
}

impl PledgeEventReconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        ledger: Arc<dyn LedgerClient>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            queue: TransferQueue::new(),
            timestamps: BlockTimestampCache::new(),
            retry_delay,
        }
    }

    /// Consume the transfer stream until the sender goes away.
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<TransferEvent>) {
        info!("Reconciler started");

        loop {
            match events.recv().await {
                Ok(event) => self.clone().process(event).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    error!("Reconciler fell behind, {} event(s) lost", missed);
                    crate::metrics::record_event_dropped("lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        info!("Reconciler stopped");
    }

    /// Handle one transfer event, including the single-shot retry policy:
    /// a transient ordering race on the first attempt re-runs the whole
    /// event once after `retry_delay`; any later failure drops the event
    /// with a log entry.
    pub async fn process(self: Arc<Self>, event: TransferEvent) {
        self.process_attempt(event, true).await
    }

    fn process_attempt(
        self: Arc<Self>,
        event: TransferEvent,
        first_attempt: bool,
    ) -> BoxFuture<'static, ()> {
        async move {
            match self.clone().transfer(&event, first_attempt).await {
                Ok(Flow::Done) => {}
                Ok(Flow::Retry) => {
                    debug!(
                        "No record yet for tx {}, retrying once",
                        event.tx_hash_string()
                    );
                    self.schedule_retry(event);
                }
                Err(e) if e.is_not_found() && first_attempt => {
                    warn!(
                        "Transfer {} -> {} hit an ordering race ({}), retrying once",
                        event.from, event.to, e
                    );
                    self.schedule_retry(event);
                }
                Err(e) => {
                    error!(
                        "Dropping transfer {} -> {} (tx {}): {}",
                        event.from,
                        event.to,
                        event.tx_hash_string(),
                        e
                    );
                    crate::metrics::record_event_dropped("error");
                }
            }
        }
        .boxed()
    }

    fn schedule_retry(self: Arc<Self>, event: TransferEvent) {
        crate::metrics::record_event_retried();
        let delay = self.retry_delay;
        tokio::spawn(async move {
            sleep(delay).await;
            self.process_attempt(event, false).await;
        });
    }

    async fn transfer(
        self: Arc<Self>,
        event: &TransferEvent,
        first_attempt: bool,
    ) -> SyncResult<Flow> {
        let block_timestamp = self.timestamps.get(&*self.ledger, event.block_number).await?;

        if event.is_new_donation() {
            self.handle_new_donation(event, block_timestamp, first_attempt)
                .await
        } else {
            self.handle_move(event, block_timestamp).await
        }
    }

    /// `from == 0`: a brand-new donation arriving on `event.to`.
    async fn handle_new_donation(
        &self,
        event: &TransferEvent,
        block_timestamp: u64,
        first_attempt: bool,
    ) -> SyncResult<Flow> {
        let tx_hash = event.tx_hash_string();

        // Duplicate-delivery guard: the same tx may already have a record,
        // written either by an earlier delivery of this event or by the
        // originating code path
        let (pledge, existing) = futures::try_join!(self.ledger.get_pledge(event.to), async {
            self.store
                .find_donations(&DonationQuery {
                    tx_hash: Some(tx_hash.clone()),
                    limit: Some(1),
                    ..Default::default()
                })
                .await
        })?;

        let admin = self.store.get_pledge_admin(pledge.owner).await?;
        let commit_time = commit_time_for(&pledge, block_timestamp);

        match existing.into_iter().next() {
            Some(donation) => {
                debug!("Donation {} already recorded for tx {}", donation.id, tx_hash);
                let patch = DonationPatch {
                    amount: Some(event.amount),
                    pledge_id: Some(event.to),
                    owner: Some(admin.label().to_string()),
                    owner_id: Some(pledge.owner),
                    owner_type: Some(admin.admin_type),
                    status: Some(DonationStatus::Waiting),
                    payment_status: Some(pledge.payment_state),
                    commit_time: Some(commit_time),
                    ..Default::default()
                };
                self.store.patch_donation(donation.id, patch).await?;
            }
            None if first_attempt => {
                // The record may still be in flight from the originating
                // code path; give it one delay before creating a duplicate
                return Ok(Flow::Retry);
            }
            None => {
                self.store
                    .create_donation(NewDonation {
                        donor_address: admin.address.clone(),
                        amount: event.amount,
                        pledge_id: event.to,
                        owner: admin.label().to_string(),
                        owner_id: pledge.owner,
                        owner_type: admin.admin_type,
                        delegate: None,
                        delegate_id: None,
                        proposed_project_id: None,
                        status: DonationStatus::Waiting,
                        payment_status: pledge.payment_state,
                        tx_hash: tx_hash.clone(),
                        commit_time,
                    })
                    .await?;

                info!("Created donation for pledge {} (tx {})", event.to, tx_hash);
                crate::metrics::record_donation_created();
            }
        }

        // Anything queued behind this pledge can now proceed
        self.queue.purge(event.to).await;
        Ok(Flow::Done)
    }

    /// `from != 0`: a transfer between two existing pledges.
    async fn handle_move(
        self: Arc<Self>,
        event: &TransferEvent,
        block_timestamp: u64,
    ) -> SyncResult<Flow> {
        let (from_pledge, to_pledge) = futures::try_join!(
            self.ledger.get_pledge(event.from),
            self.ledger.get_pledge(event.to),
        )?;

        // Managers, the delegate at the top of the destination's chain and
        // the proposed-project admin are data-independent; resolve them
        // together. A NotFound here is a transient race handled upstream.
        let delegate_index = to_pledge.n_delegates;
        let (from_admin, to_admin, delegate, proposed) = futures::try_join!(
            self.store.get_pledge_admin(from_pledge.owner),
            self.store.get_pledge_admin(to_pledge.owner),
            async {
                if delegate_index > 0 {
                    self.ledger
                        .get_pledge_delegate(event.to, delegate_index)
                        .await
                        .map(Some)
                } else {
                    Ok(None)
                }
            },
            async {
                if to_pledge.has_proposed_project() {
                    self.store
                        .get_pledge_admin(to_pledge.proposed_project)
                        .await
                        .map(Some)
                } else {
                    Ok(None)
                }
            },
        )?;

        debug!(
            "Transfer of {} from pledge {} ({}) to pledge {} ({})",
            event.amount,
            event.from,
            from_admin.label(),
            event.to,
            to_admin.label()
        );

        let tx_hash = event.tx_hash_string();
        let found = self
            .store
            .find_donations(&DonationQuery {
                pledge_id: Some(event.from),
                tx_hash: Some(tx_hash.clone()),
                limit: Some(1),
                ..Default::default()
            })
            .await?;

        let ctx = TransferContext {
            event: event.clone(),
            block_timestamp,
            from_pledge,
            to_pledge,
            to_admin,
            delegate,
            proposed,
        };

        match found.into_iter().next() {
            Some(donation) => {
                self.apply_transfer(&donation, &ctx).await?;
            }
            None => {
                // The source record is not known yet; park the whole event
                // until a purge of the source pledge replays it
                info!(
                    "No donation for pledge {} (tx {}) yet, deferring",
                    event.from, tx_hash
                );
                crate::metrics::record_event_deferred();

                let this = self.clone();
                let deferred = event.clone();
                self.queue
                    .add(
                        event.from,
                        async move {
                            this.process_attempt(deferred, false).await;
                            Ok(())
                        }
                        .boxed(),
                    )
                    .await;
            }
        }

        Ok(Flow::Done)
    }

    /// Move or split one donation according to the transferred amount.
    async fn apply_transfer(&self, donation: &Donation, ctx: &TransferContext) -> SyncResult<()> {
        let dest = destination_state(
            &ctx.to_pledge,
            &ctx.to_admin,
            ctx.delegate.as_ref(),
            ctx.block_timestamp,
        );
        let tx_hash = ctx.event.tx_hash_string();

        if let Some(ref project) = ctx.proposed {
            debug!(
                "Donation {} pending approval by project {}",
                donation.id,
                project.label()
            );
        }

        let moved = if ctx.event.amount >= donation.amount {
            if ctx.event.amount > donation.amount {
                // Off-chain cache is behind the ledger; the ledger is
                // authoritative for lineage movement
                warn!(
                    "Transfer of {} exceeds donation {} amount {}, treating as full move",
                    ctx.event.amount, donation.id, donation.amount
                );
            }

            let patch = DonationPatch {
                amount: Some(ctx.event.amount),
                pledge_id: Some(ctx.event.to),
                owner: Some(dest.owner),
                owner_id: Some(dest.owner_id),
                owner_type: Some(dest.owner_type),
                delegate: Some(dest.delegate),
                delegate_id: Some(dest.delegate_id),
                proposed_project_id: Some(dest.proposed_project_id),
                status: Some(dest.status),
                payment_status: Some(dest.payment_status),
                tx_hash: Some(tx_hash),
                commit_time: Some(dest.commit_time),
            };
            let updated = self.store.patch_donation(donation.id, patch).await?;

            info!(
                "Donation {} moved to pledge {} ({})",
                updated.id,
                ctx.event.to,
                updated.status.as_str()
            );
            crate::metrics::record_donation_moved();
            updated
        } else {
            // Split: shrink the source record, spawn a sibling carrying
            // the transferred amount. Amount is conserved.
            let remaining = donation.amount - ctx.event.amount;
            self.store
                .patch_donation(
                    donation.id,
                    DonationPatch {
                        amount: Some(remaining),
                        ..Default::default()
                    },
                )
                .await?;

            let created = self
                .store
                .create_donation(NewDonation {
                    donor_address: donation.donor_address.clone(),
                    amount: ctx.event.amount,
                    pledge_id: ctx.event.to,
                    owner: dest.owner,
                    owner_id: dest.owner_id,
                    owner_type: dest.owner_type,
                    delegate: dest.delegate,
                    delegate_id: dest.delegate_id,
                    proposed_project_id: dest.proposed_project_id,
                    status: dest.status,
                    payment_status: dest.payment_status,
                    tx_hash,
                    commit_time: dest.commit_time,
                })
                .await?;

            info!(
                "Donation {} split: {} stays on pledge {}, {} moved to pledge {} as {}",
                donation.id, remaining, ctx.event.from, ctx.event.amount, ctx.event.to, created.id
            );
            crate::metrics::record_donation_split();
            created
        };

        self.record_history(&moved, ctx).await;

        // The lineage now lives on the destination pledge; release
        // anything queued behind it
        self.queue.purge(ctx.event.to).await;
        Ok(())
    }

    /// History hook. Today only a fresh delegation writes an entry: the
    /// source pledge has no lineage and the destination just gained its
    /// first delegate with no project proposed. Other triggers (payment
    /// completion, veto) land here when they are modeled.
    async fn record_history(&self, donation: &Donation, ctx: &TransferContext) {
        let fresh_delegation = ctx.from_pledge.old_pledge == 0
            && ctx.to_pledge.n_delegates == 1
            && ctx.to_pledge.proposed_project == 0;
        if !fresh_delegation {
            return;
        }

        let entry = NewDonationHistory {
            donation_id: donation.id,
            owner_id: ctx.to_pledge.owner,
            amount: ctx.event.amount,
            tx_hash: ctx.event.tx_hash_string(),
            delegate_id: ctx.delegate.as_ref().map(|d| d.id),
        };

        match self.store.create_donation_history(entry).await {
            Ok(_) => crate::metrics::record_history_recorded(),
            Err(e) => warn!("Failed to record history for {}: {}", donation.id, e),
        }
    }
}
