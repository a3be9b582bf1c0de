//! Polls the ledger for `Transfer` logs and feeds them to the reconciler

use crate::config::ScannerConfig;
use crate::error::{SyncError, SyncResult};
use crate::store::PgStore;

use super::eth::EthLedgerClient;
use super::types::TransferEvent;

use ethers::types::{Log, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Tails the pledge contract's `Transfer` log over HTTP polling.
///
/// Events are broadcast in log order. The last fully scanned block is
/// checkpointed so a restart resumes where the previous run stopped.
pub struct TransferScanner {
    config: ScannerConfig,
    client: Arc<EthLedgerClient>,
    store: Arc<PgStore>,
    event_tx: broadcast::Sender<TransferEvent>,
    last_scanned: RwLock<u64>,
}

impl TransferScanner {
    pub async fn new(
        config: ScannerConfig,
        client: Arc<EthLedgerClient>,
        store: Arc<PgStore>,
        event_tx: broadcast::Sender<TransferEvent>,
    ) -> SyncResult<Self> {
        // Checkpoint wins over config, config over the current head
        let last_scanned = match store.get_scan_checkpoint().await? {
            Some(block) => block,
            None => match config.start_block {
                Some(block) => block.saturating_sub(1),
                None => client.get_block_number().await?,
            },
        };

        info!("Scanner starting after block {}", last_scanned);

        Ok(Self {
            config,
            client,
            store,
            event_tx,
            last_scanned: RwLock::new(last_scanned),
        })
    }

    /// Main scanning loop. Runs until the task is aborted.
    pub async fn run(&self) -> SyncResult<()> {
        let poll_interval = Duration::from_secs(self.config.poll_interval_secs);

        loop {
            let current_block = match self.client.get_block_number().await {
                Ok(b) => b,
                Err(e) => {
                    warn!("Failed to get block number: {}", e);
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
            };

            let last_block = *self.last_scanned.read().await;

            if current_block <= last_block {
                tokio::time::sleep(poll_interval).await;
                continue;
            }

            // Cap the range so one poll never asks for a huge window
            let from_block = last_block + 1;
            let to_block = std::cmp::min(current_block, from_block + self.config.max_block_range);

            debug!("Scanning blocks {} to {}", from_block, to_block);

            match self.client.get_transfer_logs(from_block, to_block).await {
                Ok(logs) => {
                    for log in logs {
                        match parse_transfer_log(&log) {
                            Ok(event) => self.publish(event),
                            Err(e) => error!("Skipping malformed transfer log: {}", e),
                        }
                    }

                    *self.last_scanned.write().await = to_block;
                    if let Err(e) = self.store.save_scan_checkpoint(to_block).await {
                        warn!("Failed to save scan checkpoint: {}", e);
                    }

                    crate::metrics::record_blocks_scanned(to_block);
                }
                Err(e) => {
                    // Checkpoint stays put, the range is retried next poll
                    warn!("Failed to get logs: {}", e);
                }
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    fn publish(&self, event: TransferEvent) {
        debug!(
            "Transfer {} -> {} amount {} (block {})",
            event.from, event.to, event.amount, event.block_number
        );

        crate::metrics::record_event_scanned();

        if self.event_tx.send(event).is_err() {
            // No receivers, that's okay
        }
    }
}

fn topic_to_u64(topic: &H256, what: &'static str) -> SyncResult<u64> {
    let value = U256::from_big_endian(topic.as_bytes());
    if value.bits() > 64 {
        return Err(SyncError::Ledger(format!("{} out of range: {}", what, value)));
    }
    Ok(value.as_u64())
}

/// Decode one `Transfer(uint64 indexed from, uint64 indexed to, uint256 amount)` log
pub fn parse_transfer_log(log: &Log) -> SyncResult<TransferEvent> {
    if log.topics.len() != 3 {
        return Err(SyncError::Ledger(format!(
            "Transfer log has {} topics, expected 3",
            log.topics.len()
        )));
    }

    let from = topic_to_u64(&log.topics[1], "from pledge id")?;
    let to = topic_to_u64(&log.topics[2], "to pledge id")?;

    let amount_word = log
        .data
        .get(..32)
        .ok_or_else(|| SyncError::Ledger("Transfer log data too short".to_string()))?;
    let amount = U256::from_big_endian(amount_word);

    let block_number = log
        .block_number
        .ok_or_else(|| SyncError::Ledger("Transfer log still pending".to_string()))?
        .as_u64();
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| SyncError::Ledger("Transfer log missing tx hash".to_string()))?;

    Ok(TransferEvent {
        from,
        to,
        amount,
        block_number,
        tx_hash,
    })
}
