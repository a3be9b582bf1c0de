//! Bounded block-timestamp cache
//!
//! Avoids re-asking the node for block timestamps the reconciler just
//! resolved. Concurrent lookups of the same uncached block share one RPC
//! fetch.

use crate::error::SyncResult;
use crate::ledger::LedgerClient;

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

const DEFAULT_CAPACITY: usize = 50;

/// Block number to unix-seconds timestamp cache, capped in size.
///
/// Eviction is strictly numeric-oldest: once over capacity, the smallest
/// block number goes first. Old blocks are the least likely to be
/// referenced by new events.
pub struct BlockTimestampCache {
    entries: Mutex<BTreeMap<u64, Arc<OnceCell<u64>>>>,
    capacity: usize,
}

impl BlockTimestampCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            capacity,
        }
    }

    /// Timestamp of `block_number`, fetched through `ledger` on a miss.
    ///
    /// Each block maps to one cell; the first caller runs the fetch and
    /// every concurrent caller waits on the same in-flight result. A
    /// failed fetch leaves the cell empty so a later lookup retries.
    pub async fn get(&self, ledger: &dyn LedgerClient, block_number: u64) -> SyncResult<u64> {
        let cell = {
            let mut entries = self.entries.lock().await;
            entries
                .entry(block_number)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let hit = cell.initialized();
        let timestamp = *cell
            .get_or_try_init(|| ledger.get_block_timestamp(block_number))
            .await?;

        crate::metrics::record_timestamp_cache(hit);

        if !hit {
            let mut entries = self.entries.lock().await;
            while entries.len() > self.capacity {
                entries.pop_first();
            }
        }

        Ok(timestamp)
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

impl Default for BlockTimestampCache {
    fn default() -> Self {
        Self::new()
    }
}
