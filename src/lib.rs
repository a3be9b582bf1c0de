//! Off-chain donation ledger synchronizer for a liquid-pledging contract
//!
//! The core keeps donation records in sync with the contract's `Transfer`
//! event stream and is the sole originator of outgoing transactions from
//! the shared funding account:
//!
//! - [`tx::NonceTracker`] / [`tx::TransactionSubmitter`] serialize nonce
//!   use per sending address
//! - [`reconciler::PledgeEventReconciler`] turns the transfer stream into
//!   consistent donation records despite event reordering
//! - [`normalizer::Normalizer`] periodically finalizes overdue pledge
//!   assignments in adaptively-sized batches
//!
//! The record store and the ledger RPC client are external collaborators
//! behind the [`store::RecordStore`] and [`ledger::LedgerClient`] traits;
//! the binary in `main.rs` wires the production implementations.

pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod normalizer;
pub mod reconciler;
pub mod store;
pub mod tx;

#[cfg(test)]
pub(crate) mod testutil;
