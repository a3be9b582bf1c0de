//! Ledger access layer
//!
//! Everything the synchronizer needs from the liquid-pledging contract
//! goes through the [`LedgerClient`] trait: pledge and delegate reads,
//! block metadata, and the two normalization submission calls. The
//! production implementation is [`EthLedgerClient`]; tests substitute a
//! mock. [`TransferScanner`] tails the contract's `Transfer` log and
//! feeds events into the reconciler.

mod eth;
mod scanner;
mod types;

pub use eth::EthLedgerClient;
pub use scanner::TransferScanner;
pub use types::{AdminId, Delegate, PaymentState, Pledge, PledgeId, TransferEvent};

use async_trait::async_trait;
use ethers::types::{Address, TransactionReceipt, H256};
use futures::future::BoxFuture;

use crate::error::SyncResult;

/// A transaction accepted by the node but not yet mined.
///
/// The submitter releases the nonce as soon as it holds one of these;
/// `confirmation` resolves later, once a receipt shows up or polling
/// gives up.
pub struct PendingTx {
    pub tx_hash: H256,
    pub confirmation: BoxFuture<'static, SyncResult<TransactionReceipt>>,
}

impl std::fmt::Debug for PendingTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTx")
            .field("tx_hash", &self.tx_hash)
            .finish_non_exhaustive()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Read one pledge row from the contract.
    async fn get_pledge(&self, id: PledgeId) -> SyncResult<Pledge>;

    /// Read the delegate at `index` (1-based, per the contract) on a pledge's
    /// delegation chain.
    async fn get_pledge_delegate(&self, pledge_id: PledgeId, index: u64) -> SyncResult<Delegate>;

    /// Timestamp of a block, in unix seconds.
    async fn get_block_timestamp(&self, block_number: u64) -> SyncResult<u64>;

    /// The funding account's next nonce as the node sees it, pending
    /// transactions included.
    async fn get_pending_nonce(&self, address: Address) -> SyncResult<u64>;

    /// Submit `normalizePledge(id)` with an explicit nonce.
    async fn normalize_pledge(&self, pledge_id: PledgeId, nonce: u64) -> SyncResult<PendingTx>;

    /// Submit `mNormalizePledge(ids)` with an explicit nonce.
    async fn m_normalize_pledge(&self, pledge_ids: Vec<PledgeId>, nonce: u64)
        -> SyncResult<PendingTx>;
}
