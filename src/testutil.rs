//! In-memory fixtures shared by reconciler and normalizer tests

use crate::error::{SyncError, SyncResult};
use crate::ledger::{AdminId, PaymentState, Pledge, PledgeId};
use crate::store::{
    AdminType, Donation, DonationHistory, DonationPatch, DonationQuery, DonationStatus,
    NewDonation, NewDonationHistory, PledgeAdmin, RecordStore,
};

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::U256;
use std::sync::Mutex;
use uuid::Uuid;

/// Stateful `RecordStore` fake. Behaves like `PgStore` for the query and
/// patch semantics the reconciler and normalizer rely on.
#[derive(Default)]
pub struct MemoryStore {
    donations: Mutex<Vec<Donation>>,
    admins: Mutex<Vec<PledgeAdmin>>,
    histories: Mutex<Vec<DonationHistory>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_admin(&self, admin: PledgeAdmin) {
        self.admins.lock().unwrap().push(admin);
    }

    pub fn donations(&self) -> Vec<Donation> {
        self.donations.lock().unwrap().clone()
    }

    pub fn histories(&self) -> Vec<DonationHistory> {
        self.histories.lock().unwrap().clone()
    }

    fn matches(donation: &Donation, query: &DonationQuery) -> bool {
        if let Some(pledge_id) = query.pledge_id {
            if donation.pledge_id != pledge_id {
                return false;
            }
        }
        if let Some(ref tx_hash) = query.tx_hash {
            if &donation.tx_hash != tx_hash {
                return false;
            }
        }
        if let Some(status) = query.status {
            if donation.status != status {
                return false;
            }
        }
        if query.requires_proposed_project && donation.proposed_project_id.unwrap_or(0) == 0 {
            return false;
        }
        if query.nonzero_amount && donation.amount.is_zero() {
            return false;
        }
        if let Some(before) = query.commit_time_before {
            if donation.commit_time > before {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_donation(&self, id: Uuid) -> SyncResult<Donation> {
        self.donations
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| SyncError::not_found("donation", id))
    }

    async fn find_donations(&self, query: &DonationQuery) -> SyncResult<Vec<Donation>> {
        let mut matched: Vec<Donation> = self
            .donations
            .lock()
            .unwrap()
            .iter()
            .filter(|d| Self::matches(d, query))
            .cloned()
            .collect();

        if let Some(limit) = query.limit {
            matched.truncate(limit as usize);
        }
        Ok(matched)
    }

    async fn create_donation(&self, data: NewDonation) -> SyncResult<Donation> {
        let now = Utc::now();
        let donation = Donation {
            id: Uuid::new_v4(),
            donor_address: data.donor_address,
            amount: data.amount,
            pledge_id: data.pledge_id,
            owner: data.owner,
            owner_id: data.owner_id,
            owner_type: data.owner_type,
            delegate: data.delegate,
            delegate_id: data.delegate_id,
            proposed_project_id: data.proposed_project_id,
            status: data.status,
            payment_status: data.payment_status,
            tx_hash: data.tx_hash,
            commit_time: data.commit_time,
            created_at: now,
            updated_at: now,
        };
        self.donations.lock().unwrap().push(donation.clone());
        Ok(donation)
    }

    async fn patch_donation(&self, id: Uuid, patch: DonationPatch) -> SyncResult<Donation> {
        let mut donations = self.donations.lock().unwrap();
        let donation = donations
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| SyncError::not_found("donation", id))?;

        patch.apply(donation);
        donation.updated_at = Utc::now();
        Ok(donation.clone())
    }

    async fn get_pledge_admin(&self, id: AdminId) -> SyncResult<PledgeAdmin> {
        self.admins
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| SyncError::not_found("pledge admin", id))
    }

    async fn create_donation_history(
        &self,
        data: NewDonationHistory,
    ) -> SyncResult<DonationHistory> {
        let history = DonationHistory {
            id: Uuid::new_v4(),
            donation_id: data.donation_id,
            owner_id: data.owner_id,
            amount: data.amount,
            tx_hash: data.tx_hash,
            delegate_id: data.delegate_id,
            created_at: Utc::now(),
        };
        self.histories.lock().unwrap().push(history.clone());
        Ok(history)
    }
}

pub fn giver(id: AdminId, address: &str) -> PledgeAdmin {
    PledgeAdmin {
        id,
        admin_type: AdminType::Giver,
        name: format!("giver {}", id),
        address: address.to_string(),
    }
}

pub fn delegate_admin(id: AdminId, name: &str) -> PledgeAdmin {
    PledgeAdmin {
        id,
        admin_type: AdminType::Delegate,
        name: name.to_string(),
        address: String::new(),
    }
}

pub fn project_admin(id: AdminId, name: &str) -> PledgeAdmin {
    PledgeAdmin {
        id,
        admin_type: AdminType::Project,
        name: name.to_string(),
        address: String::new(),
    }
}

/// Bare pledge owned by `owner`, no delegates, no proposed project
pub fn pledge(id: PledgeId, owner: AdminId, amount: u64) -> Pledge {
    Pledge {
        id,
        amount: U256::from(amount),
        owner,
        n_delegates: 0,
        proposed_project: 0,
        commit_time: 0,
        old_pledge: 0,
        payment_state: PaymentState::NotPaid,
    }
}

/// Donation fixture sitting on `pledge_id`, awaiting approval of project
/// admin `proposed`
pub fn to_approve_donation(pledge_id: PledgeId, proposed: AdminId, amount: u64) -> NewDonation {
    NewDonation {
        donor_address: "0xgiver".to_string(),
        amount: U256::from(amount),
        pledge_id,
        owner: "0xgiver".to_string(),
        owner_id: 1,
        owner_type: AdminType::Giver,
        delegate: None,
        delegate_id: None,
        proposed_project_id: Some(proposed),
        status: DonationStatus::ToApprove,
        payment_status: PaymentState::NotPaid,
        tx_hash: "0xfeed".to_string(),
        commit_time: Utc::now() - chrono::Duration::hours(1),
    }
}
