//! Wire types read from the liquid-pledging contract

use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};

/// Numeric id of a pledge on the ledger
pub type PledgeId = u64;

/// Numeric id of a pledge admin (giver, delegate or project) on the ledger
pub type AdminId = u64;

/// Payment state of a pledge as encoded by the contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentState {
    NotPaid,
    Paying,
    Paid,
    /// Any wire code this version does not know about
    Unknown,
}

impl PaymentState {
    /// Map the contract's numeric encoding: 0 = NotPaid, 1 = Paying, 2 = Paid.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => PaymentState::NotPaid,
            1 => PaymentState::Paying,
            2 => PaymentState::Paid,
            _ => PaymentState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentState::NotPaid => "NotPaid",
            PaymentState::Paying => "Paying",
            PaymentState::Paid => "Paid",
            PaymentState::Unknown => "Unknown",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "NotPaid" => PaymentState::NotPaid,
            "Paying" => PaymentState::Paying,
            "Paid" => PaymentState::Paid,
            _ => PaymentState::Unknown,
        }
    }
}

/// A pledge as returned by `getPledge`. Read-only to this crate.
#[derive(Debug, Clone)]
pub struct Pledge {
    pub id: PledgeId,
    pub amount: U256,
    /// Admin id of the pledge's manager
    pub owner: AdminId,
    pub n_delegates: u64,
    /// Admin id of the proposed project, 0 when none
    pub proposed_project: AdminId,
    /// Unix seconds at which the commitment window elapses, 0 when none
    pub commit_time: u64,
    /// Predecessor pledge id, 0 when this pledge has no lineage
    pub old_pledge: PledgeId,
    pub payment_state: PaymentState,
}

impl Pledge {
    pub fn has_proposed_project(&self) -> bool {
        self.proposed_project != 0
    }
}

/// A delegate as returned by `getPledgeDelegate`
#[derive(Debug, Clone)]
pub struct Delegate {
    pub id: AdminId,
    pub address: ethers::types::Address,
    pub name: String,
}

/// One `Transfer` event from the ledger's log.
///
/// `from == 0` marks a brand-new donation rather than a transfer between
/// existing pledges.
#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub from: PledgeId,
    pub to: PledgeId,
    pub amount: U256,
    pub block_number: u64,
    pub tx_hash: H256,
}

impl TransferEvent {
    pub fn is_new_donation(&self) -> bool {
        self.from == 0
    }

    /// Hash rendered the way donation records store it (0x-prefixed hex)
    pub fn tx_hash_string(&self) -> String {
        format!("{:?}", self.tx_hash)
    }
}
