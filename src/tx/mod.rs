//! Transaction submission module with per-address nonce serialization

mod nonce;
mod submitter;

pub use nonce::{NonceLease, NonceTracker};
pub use submitter::TransactionSubmitter;
