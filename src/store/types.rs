//! Donation records and participant entities

use crate::ledger::{AdminId, PaymentState, PledgeId};

use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a donation sits in its approval lifecycle.
///
/// Not terminal: a committed donation re-enters the machine when its
/// pledge moves again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DonationStatus {
    Waiting,
    ToApprove,
    Committed,
}

impl DonationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DonationStatus::Waiting => "waiting",
            DonationStatus::ToApprove => "to_approve",
            DonationStatus::Committed => "committed",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "to_approve" => DonationStatus::ToApprove,
            "committed" => DonationStatus::Committed,
            _ => DonationStatus::Waiting,
        }
    }
}

/// What kind of participant an admin id denotes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminType {
    Giver,
    Delegate,
    Project,
}

impl AdminType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminType::Giver => "giver",
            AdminType::Delegate => "delegate",
            AdminType::Project => "project",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "delegate" => AdminType::Delegate,
            "project" => AdminType::Project,
            _ => AdminType::Giver,
        }
    }
}

/// A ledger participant (giver, delegate or project) mirrored off-chain.
/// Read-only to the reconciler.
#[derive(Debug, Clone)]
pub struct PledgeAdmin {
    pub id: AdminId,
    pub admin_type: AdminType,
    pub name: String,
    pub address: String,
}

impl PledgeAdmin {
    pub fn is_giver(&self) -> bool {
        self.admin_type == AdminType::Giver
    }

    /// How this admin shows up on a donation record: the on-chain
    /// address when known, the display name otherwise.
    pub fn label(&self) -> &str {
        if self.address.is_empty() {
            &self.name
        } else {
            &self.address
        }
    }
}

/// One donation record. Mutated only by the reconciler; a full-amount
/// transfer moves the record in place, a partial transfer reduces it and
/// spawns a sibling.
#[derive(Debug, Clone)]
pub struct Donation {
    pub id: Uuid,
    pub donor_address: String,
    pub amount: U256,
    pub pledge_id: PledgeId,
    pub owner: String,
    pub owner_id: AdminId,
    pub owner_type: AdminType,
    pub delegate: Option<String>,
    pub delegate_id: Option<AdminId>,
    pub proposed_project_id: Option<AdminId>,
    pub status: DonationStatus,
    pub payment_status: PaymentState,
    pub tx_hash: String,
    pub commit_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a donation about to be created. Id and row timestamps are
/// assigned by the store.
#[derive(Debug, Clone)]
pub struct NewDonation {
    pub donor_address: String,
    pub amount: U256,
    pub pledge_id: PledgeId,
    pub owner: String,
    pub owner_id: AdminId,
    pub owner_type: AdminType,
    pub delegate: Option<String>,
    pub delegate_id: Option<AdminId>,
    pub proposed_project_id: Option<AdminId>,
    pub status: DonationStatus,
    pub payment_status: PaymentState,
    pub tx_hash: String,
    pub commit_time: DateTime<Utc>,
}

/// Partial update of a donation.
///
/// Doubly-wrapped options distinguish "set to this", "clear" and "leave
/// alone" for the fields that can legitimately go away on a transfer.
#[derive(Debug, Clone, Default)]
pub struct DonationPatch {
    pub amount: Option<U256>,
    pub pledge_id: Option<PledgeId>,
    pub owner: Option<String>,
    pub owner_id: Option<AdminId>,
    pub owner_type: Option<AdminType>,
    pub delegate: Option<Option<String>>,
    pub delegate_id: Option<Option<AdminId>>,
    pub proposed_project_id: Option<Option<AdminId>>,
    pub status: Option<DonationStatus>,
    pub payment_status: Option<PaymentState>,
    pub tx_hash: Option<String>,
    pub commit_time: Option<DateTime<Utc>>,
}

impl DonationPatch {
    /// Merge this patch into a donation, in memory
    pub fn apply(&self, donation: &mut Donation) {
        if let Some(amount) = self.amount {
            donation.amount = amount;
        }
        if let Some(pledge_id) = self.pledge_id {
            donation.pledge_id = pledge_id;
        }
        if let Some(ref owner) = self.owner {
            donation.owner = owner.clone();
        }
        if let Some(owner_id) = self.owner_id {
            donation.owner_id = owner_id;
        }
        if let Some(owner_type) = self.owner_type {
            donation.owner_type = owner_type;
        }
        if let Some(ref delegate) = self.delegate {
            donation.delegate = delegate.clone();
        }
        if let Some(delegate_id) = self.delegate_id {
            donation.delegate_id = delegate_id;
        }
        if let Some(proposed_project_id) = self.proposed_project_id {
            donation.proposed_project_id = proposed_project_id;
        }
        if let Some(status) = self.status {
            donation.status = status;
        }
        if let Some(payment_status) = self.payment_status {
            donation.payment_status = payment_status;
        }
        if let Some(ref tx_hash) = self.tx_hash {
            donation.tx_hash = tx_hash.clone();
        }
        if let Some(commit_time) = self.commit_time {
            donation.commit_time = commit_time;
        }
    }
}

/// Typed donation filter. Unset fields do not constrain; no limit means
/// the full result set.
#[derive(Debug, Clone, Default)]
pub struct DonationQuery {
    pub pledge_id: Option<PledgeId>,
    pub tx_hash: Option<String>,
    pub status: Option<DonationStatus>,
    pub requires_proposed_project: bool,
    pub nonzero_amount: bool,
    pub commit_time_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Delegation history entry about to be appended
#[derive(Debug, Clone)]
pub struct NewDonationHistory {
    pub donation_id: Uuid,
    pub owner_id: AdminId,
    pub amount: U256,
    pub tx_hash: String,
    pub delegate_id: Option<AdminId>,
}

/// Persisted delegation history entry
#[derive(Debug, Clone)]
pub struct DonationHistory {
    pub id: Uuid,
    pub donation_id: Uuid,
    pub owner_id: AdminId,
    pub amount: U256,
    pub tx_hash: String,
    pub delegate_id: Option<AdminId>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn donation() -> Donation {
        let now = Utc::now();
        Donation {
            id: Uuid::new_v4(),
            donor_address: "0xgiver".to_string(),
            amount: U256::from(100u64),
            pledge_id: 1,
            owner: "0xgiver".to_string(),
            owner_id: 3,
            owner_type: AdminType::Giver,
            delegate: Some("relief fund".to_string()),
            delegate_id: Some(7),
            proposed_project_id: None,
            status: DonationStatus::Waiting,
            payment_status: PaymentState::NotPaid,
            tx_hash: "0xabc".to_string(),
            commit_time: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn patch_sets_and_clears_fields() {
        let mut d = donation();

        let patch = DonationPatch {
            pledge_id: Some(9),
            status: Some(DonationStatus::Committed),
            delegate: Some(None),
            delegate_id: Some(None),
            proposed_project_id: Some(Some(4)),
            ..Default::default()
        };
        patch.apply(&mut d);

        assert_eq!(d.pledge_id, 9);
        assert_eq!(d.status, DonationStatus::Committed);
        assert_eq!(d.delegate, None);
        assert_eq!(d.delegate_id, None);
        assert_eq!(d.proposed_project_id, Some(4));
        // Untouched fields survive
        assert_eq!(d.amount, U256::from(100u64));
        assert_eq!(d.owner_id, 3);
    }

    #[test]
    fn empty_patch_changes_nothing() {
        let mut d = donation();
        let before = d.clone();

        DonationPatch::default().apply(&mut d);

        assert_eq!(d.amount, before.amount);
        assert_eq!(d.delegate, before.delegate);
        assert_eq!(d.status, before.status);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            DonationStatus::Waiting,
            DonationStatus::ToApprove,
            DonationStatus::Committed,
        ] {
            assert_eq!(DonationStatus::from_str_lossy(status.as_str()), status);
        }
        assert_eq!(
            DonationStatus::from_str_lossy("garbage"),
            DonationStatus::Waiting
        );
    }

    #[test]
    fn admin_label_prefers_address() {
        let mut admin = PledgeAdmin {
            id: 1,
            admin_type: AdminType::Delegate,
            name: "relief fund".to_string(),
            address: "0xdd".to_string(),
        };
        assert_eq!(admin.label(), "0xdd");

        admin.address.clear();
        assert_eq!(admin.label(), "relief fund");
    }
}
