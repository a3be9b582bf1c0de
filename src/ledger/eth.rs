//! Ethers-backed ledger client with multi-RPC failover

use crate::config::LedgerConfig;
use crate::error::{SyncError, SyncResult};

use super::types::{Delegate, PaymentState, Pledge, PledgeId};
use super::{LedgerClient, PendingTx};

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use futures::FutureExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Event signature the scanner filters on
pub const TRANSFER_SIGNATURE: &str = "Transfer(uint64,uint64,uint256)";

const GET_PLEDGE_SIG: &str = "getPledge(uint64)";
const GET_PLEDGE_DELEGATE_SIG: &str = "getPledgeDelegate(uint64,uint64)";
const NORMALIZE_PLEDGE_SIG: &str = "normalizePledge(uint64)";
const M_NORMALIZE_PLEDGE_SIG: &str = "mNormalizePledge(uint64[])";

/// Gas limit used when the node refuses to estimate
const FALLBACK_GAS_LIMIT: u64 = 2_000_000;

/// Ledger client over one or more HTTP RPC endpoints.
///
/// Read calls and submissions rotate to the next endpoint when the
/// current one errors. A funding wallet is optional; without one the
/// client can still read but `normalizePledge` submissions fail.
pub struct EthLedgerClient {
    config: LedgerConfig,
    providers: Vec<Provider<Http>>,
    current_provider: AtomicUsize,
    contract: Address,
    wallet: Option<LocalWallet>,
}

impl EthLedgerClient {
    pub fn new(config: LedgerConfig, wallet: Option<LocalWallet>) -> SyncResult<Self> {
        let mut providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    providers.push(provider);
                    debug!("Added RPC provider: {}", url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if providers.is_empty() {
            return Err(SyncError::Config("No valid RPC providers".to_string()));
        }

        let contract: Address = config
            .contract_address
            .parse()
            .map_err(|e| SyncError::Config(format!("Invalid contract address: {}", e)))?;

        if let Some(ref wallet) = wallet {
            info!("Funding wallet configured: {:?}", wallet.address());
        } else {
            info!("No funding wallet configured, running read-only");
        }

        Ok(Self {
            config,
            providers,
            current_provider: AtomicUsize::new(0),
            contract,
            wallet,
        })
    }

    /// Get the active HTTP provider
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.providers[idx % self.providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Ledger RPC failover to provider {}", next);
    }

    /// Address of the funding wallet, if one is configured
    pub fn funding_address(&self) -> Option<Address> {
        self.wallet.as_ref().map(|w| w.address())
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> SyncResult<u64> {
        for _ in 0..self.providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!("Failed to get block number: {}", e);
                    self.failover();
                }
            }
        }

        Err(SyncError::Ledger("All providers failed".to_string()))
    }

    /// Fetch `Transfer` logs for a block range, inclusive on both ends
    pub async fn get_transfer_logs(&self, from_block: u64, to_block: u64) -> SyncResult<Vec<Log>> {
        let filter = Filter::new()
            .address(self.contract)
            .topic0(transfer_topic())
            .from_block(from_block)
            .to_block(to_block);

        for _ in 0..self.providers.len() {
            match self.http().get_logs(&filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!(
                        "Failed to get logs for blocks {}-{}: {}",
                        from_block, to_block, e
                    );
                    self.failover();
                }
            }
        }

        Err(SyncError::Ledger(
            "All providers failed to get logs".to_string(),
        ))
    }

    /// eth_call against the pledge contract, with failover
    async fn call(&self, data: Vec<u8>, what: &'static str) -> SyncResult<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.contract)
            .data(data)
            .into();

        for _ in 0..self.providers.len() {
            match self.http().call(&tx, None).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    warn!("{} call failed: {}", what, e);
                    self.failover();
                }
            }
        }

        Err(SyncError::Ledger(format!("All providers failed: {}", what)))
    }

    /// Sign and broadcast a contract call with an explicit nonce.
    ///
    /// Returns as soon as the node accepts the raw transaction; mining is
    /// tracked by the returned confirmation future.
    async fn submit(&self, data: Vec<u8>, nonce: u64) -> SyncResult<PendingTx> {
        debug!("Submitting calldata 0x{} with nonce {}", hex::encode(&data), nonce);

        let wallet = self
            .wallet
            .clone()
            .ok_or_else(|| SyncError::Wallet("No funding wallet configured".to_string()))?
            .with_chain_id(self.config.chain_id);

        let mut tx: TypedTransaction = TransactionRequest::new()
            .to(self.contract)
            .from(wallet.address())
            .data(data)
            .nonce(nonce)
            .into();
        tx.set_chain_id(self.config.chain_id);

        let gas = match self.http().estimate_gas(&tx, None).await {
            Ok(estimate) => estimate * 120 / 100,
            Err(e) => {
                warn!("Gas estimation failed, using fallback: {}", e);
                U256::from(FALLBACK_GAS_LIMIT)
            }
        };
        tx.set_gas(gas);

        let gas_price = self
            .http()
            .get_gas_price()
            .await
            .map_err(|e| SyncError::Ledger(format!("Failed to get gas price: {}", e)))?;
        tx.set_gas_price(gas_price);

        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| SyncError::Wallet(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);

        let send_timeout = Duration::from_secs(30);
        let tx_hash = match timeout(send_timeout, self.http().send_raw_transaction(raw)).await {
            Ok(Ok(pending)) => pending.tx_hash(),
            Ok(Err(e)) => return Err(SyncError::Transaction(e.to_string())),
            Err(_) => {
                return Err(SyncError::Timeout {
                    operation: "send transaction".to_string(),
                })
            }
        };

        debug!("Transaction sent: {:?} (nonce {})", tx_hash, nonce);

        Ok(PendingTx {
            tx_hash,
            confirmation: self.confirmation(tx_hash),
        })
    }

    /// Future that polls for a receipt until one lands or attempts run out
    fn confirmation(
        &self,
        tx_hash: H256,
    ) -> futures::future::BoxFuture<'static, SyncResult<TransactionReceipt>> {
        let provider = self.http().clone();
        let poll_interval = Duration::from_secs(self.config.receipt_poll_secs);
        let attempts = self.config.receipt_poll_attempts;

        async move {
            for attempt in 0..attempts {
                tokio::time::sleep(poll_interval).await;
                match provider.get_transaction_receipt(tx_hash).await {
                    Ok(Some(receipt)) => {
                        debug!("Transaction {:?} mined", tx_hash);
                        return Ok(receipt);
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(
                            "Receipt poll {} failed for {:?}: {}",
                            attempt + 1,
                            tx_hash,
                            e
                        );
                    }
                }
            }

            Err(SyncError::Timeout {
                operation: format!("receipt for {:?}", tx_hash),
            })
        }
        .boxed()
    }
}

#[async_trait]
impl LedgerClient for EthLedgerClient {
    async fn get_pledge(&self, id: PledgeId) -> SyncResult<Pledge> {
        let data = encode_call(GET_PLEDGE_SIG, &[Token::Uint(U256::from(id))]);
        let out = self.call(data, "getPledge").await?;
        decode_pledge(id, &out)
    }

    async fn get_pledge_delegate(&self, pledge_id: PledgeId, index: u64) -> SyncResult<Delegate> {
        let data = encode_call(
            GET_PLEDGE_DELEGATE_SIG,
            &[
                Token::Uint(U256::from(pledge_id)),
                Token::Uint(U256::from(index)),
            ],
        );
        let out = self.call(data, "getPledgeDelegate").await?;
        decode_delegate(&out)
    }

    async fn get_block_timestamp(&self, block_number: u64) -> SyncResult<u64> {
        for _ in 0..self.providers.len() {
            match self.http().get_block(block_number).await {
                Ok(Some(block)) => return Ok(block.timestamp.as_u64()),
                Ok(None) => {
                    return Err(SyncError::Ledger(format!(
                        "Block {} not available",
                        block_number
                    )))
                }
                Err(e) => {
                    warn!("Failed to get block {}: {}", block_number, e);
                    self.failover();
                }
            }
        }

        Err(SyncError::Ledger("All providers failed".to_string()))
    }

    async fn get_pending_nonce(&self, address: Address) -> SyncResult<u64> {
        for _ in 0..self.providers.len() {
            match self
                .http()
                .get_transaction_count(address, Some(BlockNumber::Pending.into()))
                .await
            {
                Ok(count) => return Ok(count.as_u64()),
                Err(e) => {
                    warn!("Failed to get nonce for {:?}: {}", address, e);
                    self.failover();
                }
            }
        }

        Err(SyncError::Ledger("All providers failed".to_string()))
    }

    async fn normalize_pledge(&self, pledge_id: PledgeId, nonce: u64) -> SyncResult<PendingTx> {
        let data = encode_call(NORMALIZE_PLEDGE_SIG, &[Token::Uint(U256::from(pledge_id))]);
        self.submit(data, nonce).await
    }

    async fn m_normalize_pledge(
        &self,
        pledge_ids: Vec<PledgeId>,
        nonce: u64,
    ) -> SyncResult<PendingTx> {
        let ids = pledge_ids
            .into_iter()
            .map(|id| Token::Uint(U256::from(id)))
            .collect();
        let data = encode_call(M_NORMALIZE_PLEDGE_SIG, &[Token::Array(ids)]);
        self.submit(data, nonce).await
    }
}

/// keccak topic for the `Transfer` event
pub fn transfer_topic() -> H256 {
    H256::from(ethers::utils::keccak256(TRANSFER_SIGNATURE.as_bytes()))
}

/// 4-byte selector plus ABI-encoded arguments
fn encode_call(signature: &str, args: &[Token]) -> Vec<u8> {
    let mut data = ethers::utils::id(signature).to_vec();
    data.extend_from_slice(&abi::encode(args));
    data
}

fn word_to_u64(value: U256, what: &'static str) -> SyncResult<u64> {
    if value.bits() > 64 {
        return Err(SyncError::Ledger(format!("{} out of range: {}", what, value)));
    }
    Ok(value.as_u64())
}

/// Decode `getPledge` output:
/// (uint256 amount, uint64 owner, uint64 nDelegates, uint64 proposedProject,
///  uint64 commitTime, uint64 oldPledge, uint8 paymentState)
fn decode_pledge(id: PledgeId, data: &[u8]) -> SyncResult<Pledge> {
    let params = [
        ParamType::Uint(256),
        ParamType::Uint(64),
        ParamType::Uint(64),
        ParamType::Uint(64),
        ParamType::Uint(64),
        ParamType::Uint(64),
        ParamType::Uint(8),
    ];
    let tokens = abi::decode(&params, data)
        .map_err(|e| SyncError::Ledger(format!("Malformed getPledge output: {}", e)))?;
    let mut words = tokens.into_iter().map(|t| match t {
        Token::Uint(v) => Ok(v),
        other => Err(SyncError::Ledger(format!(
            "Unexpected token in getPledge output: {:?}",
            other
        ))),
    });

    let mut next = |what: &'static str| -> SyncResult<U256> {
        words
            .next()
            .ok_or_else(|| SyncError::Ledger(format!("Missing {} in getPledge output", what)))?
    };

    let amount = next("amount")?;
    let owner = word_to_u64(next("owner")?, "owner")?;
    let n_delegates = word_to_u64(next("nDelegates")?, "nDelegates")?;
    let proposed_project = word_to_u64(next("proposedProject")?, "proposedProject")?;
    let commit_time = word_to_u64(next("commitTime")?, "commitTime")?;
    let old_pledge = word_to_u64(next("oldPledge")?, "oldPledge")?;
    let state_code = word_to_u64(next("paymentState")?, "paymentState")?;

    Ok(Pledge {
        id,
        amount,
        owner,
        n_delegates,
        proposed_project,
        commit_time,
        old_pledge,
        payment_state: PaymentState::from_code(u8::try_from(state_code).unwrap_or(u8::MAX)),
    })
}

/// Decode `getPledgeDelegate` output: (uint64 idDelegate, address addr, string name)
fn decode_delegate(data: &[u8]) -> SyncResult<Delegate> {
    let params = [ParamType::Uint(64), ParamType::Address, ParamType::String];
    let mut tokens = abi::decode(&params, data)
        .map_err(|e| SyncError::Ledger(format!("Malformed getPledgeDelegate output: {}", e)))?
        .into_iter();

    let id = match tokens.next() {
        Some(Token::Uint(v)) => word_to_u64(v, "idDelegate")?,
        other => {
            return Err(SyncError::Ledger(format!(
                "Unexpected delegate id token: {:?}",
                other
            )))
        }
    };
    let address = match tokens.next() {
        Some(Token::Address(a)) => a,
        other => {
            return Err(SyncError::Ledger(format!(
                "Unexpected delegate address token: {:?}",
                other
            )))
        }
    };
    let name = match tokens.next() {
        Some(Token::String(s)) => s,
        other => {
            return Err(SyncError::Ledger(format!(
                "Unexpected delegate name token: {:?}",
                other
            )))
        }
    };

    Ok(Delegate { id, address, name })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_data_carries_selector_and_word() {
        let data = encode_call(GET_PLEDGE_SIG, &[Token::Uint(U256::from(7u64))]);
        assert_eq!(data.len(), 4 + 32);
        assert_eq!(&data[..4], ethers::utils::id(GET_PLEDGE_SIG).as_slice());
        assert_eq!(data[4 + 31], 7);
    }

    #[test]
    fn decodes_pledge_fields() {
        let raw = abi::encode(&[
            Token::Uint(U256::from(1000u64)),
            Token::Uint(U256::from(3u64)),
            Token::Uint(U256::from(1u64)),
            Token::Uint(U256::from(9u64)),
            Token::Uint(U256::from(1_700_000_000u64)),
            Token::Uint(U256::from(2u64)),
            Token::Uint(U256::from(1u64)),
        ]);

        let pledge = decode_pledge(42, &raw).unwrap();
        assert_eq!(pledge.id, 42);
        assert_eq!(pledge.amount, U256::from(1000u64));
        assert_eq!(pledge.owner, 3);
        assert_eq!(pledge.n_delegates, 1);
        assert_eq!(pledge.proposed_project, 9);
        assert_eq!(pledge.commit_time, 1_700_000_000);
        assert_eq!(pledge.old_pledge, 2);
        assert_eq!(pledge.payment_state, PaymentState::Paying);
    }

    #[test]
    fn unknown_payment_code_maps_to_unknown() {
        let raw = abi::encode(&[
            Token::Uint(U256::zero()),
            Token::Uint(U256::zero()),
            Token::Uint(U256::zero()),
            Token::Uint(U256::zero()),
            Token::Uint(U256::zero()),
            Token::Uint(U256::zero()),
            Token::Uint(U256::from(7u64)),
        ]);

        let pledge = decode_pledge(1, &raw).unwrap();
        assert_eq!(pledge.payment_state, PaymentState::Unknown);
    }

    #[test]
    fn decodes_delegate_fields() {
        let addr: Address = "0x00000000000000000000000000000000000000aa"
            .parse()
            .unwrap();
        let raw = abi::encode(&[
            Token::Uint(U256::from(5u64)),
            Token::Address(addr),
            Token::String("relief fund".to_string()),
        ]);

        let delegate = decode_delegate(&raw).unwrap();
        assert_eq!(delegate.id, 5);
        assert_eq!(delegate.address, addr);
        assert_eq!(delegate.name, "relief fund");
    }

    #[test]
    fn rejects_truncated_output() {
        let raw = abi::encode(&[Token::Uint(U256::from(1000u64))]);
        assert!(decode_pledge(1, &raw).is_err());
    }
}
