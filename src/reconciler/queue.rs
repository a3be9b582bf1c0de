//! Deferred continuations keyed by pledge id
//!
//! A transfer that references a donation record not yet written is parked
//! here and replayed once the record shows up.

use crate::error::SyncResult;
use crate::ledger::PledgeId;

use futures::future::BoxFuture;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

type Action = BoxFuture<'static, SyncResult<()>>;

/// Per-pledge FIFO of deferred actions.
///
/// `purge` drains a snapshot: actions that `add` for the same id while a
/// purge is running land in a fresh queue for a later purge, never the
/// list being drained.
pub struct TransferQueue {
    queues: Mutex<HashMap<PledgeId, Vec<Action>>>,
}

impl TransferQueue {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Append an action to the FIFO for `pledge_id`, creating it if absent.
    pub async fn add(&self, pledge_id: PledgeId, action: Action) {
        let mut queues = self.queues.lock().await;
        queues.entry(pledge_id).or_default().push(action);
        debug!(
            "Queued deferred action for pledge {} ({} waiting)",
            pledge_id,
            queues[&pledge_id].len()
        );
    }

    /// Run every queued action for `pledge_id` in submission order, exactly
    /// once each, then discard the queue. No-op when nothing is queued.
    /// A failing action is logged and does not stop the drain.
    pub async fn purge(&self, pledge_id: PledgeId) {
        let drained = self.queues.lock().await.remove(&pledge_id);

        let Some(actions) = drained else {
            return;
        };

        debug!(
            "Purging {} deferred action(s) for pledge {}",
            actions.len(),
            pledge_id
        );

        for action in actions {
            if let Err(e) = action.await {
                warn!("Deferred action for pledge {} failed: {}", pledge_id, e);
            }
        }
    }

    /// Number of actions currently parked for a pledge
    #[cfg(test)]
    pub async fn len(&self, pledge_id: PledgeId) -> usize {
        self.queues
            .lock()
            .await
            .get(&pledge_id)
            .map_or(0, Vec::len)
    }
}

impl Default for TransferQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::{Arc, Mutex as StdMutex};

    fn logging_action(log: &Arc<StdMutex<Vec<u32>>>, tag: u32) -> Action {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(tag);
            Ok(())
        }
        .boxed()
    }

    #[tokio::test]
    async fn purge_runs_actions_in_fifo_order_exactly_once() {
        let queue = TransferQueue::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        for tag in [1, 2, 3] {
            queue.add(7, logging_action(&log, tag)).await;
        }

        queue.purge(7).await;
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);

        // Second purge finds nothing
        queue.purge(7).await;
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn purge_is_scoped_to_one_pledge() {
        let queue = TransferQueue::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        queue.add(1, logging_action(&log, 10)).await;
        queue.add(2, logging_action(&log, 20)).await;

        queue.purge(1).await;
        assert_eq!(*log.lock().unwrap(), vec![10]);
        assert_eq!(queue.len(2).await, 1);
    }

    #[tokio::test]
    async fn purge_of_unknown_pledge_is_a_noop() {
        let queue = TransferQueue::new();
        queue.purge(99).await;
    }

    #[tokio::test]
    async fn failing_action_does_not_stop_the_drain() {
        let queue = TransferQueue::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        queue
            .add(
                3,
                async { Err(crate::error::SyncError::Internal("boom".to_string())) }.boxed(),
            )
            .await;
        queue.add(3, logging_action(&log, 2)).await;

        queue.purge(3).await;
        assert_eq!(*log.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn re_add_during_purge_lands_in_a_later_purge() {
        let queue = Arc::new(TransferQueue::new());
        let log = Arc::new(StdMutex::new(Vec::new()));

        let requeue = {
            let queue = queue.clone();
            let log = log.clone();
            async move {
                log.lock().unwrap().push(1);
                queue.add(5, logging_action(&log, 2)).await;
                Ok(())
            }
            .boxed()
        };
        queue.add(5, requeue).await;

        queue.purge(5).await;
        // The re-added action waits for the next purge
        assert_eq!(*log.lock().unwrap(), vec![1]);
        assert_eq!(queue.len(5).await, 1);

        queue.purge(5).await;
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }
}
