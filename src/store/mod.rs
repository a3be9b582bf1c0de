//! Persistent record store
//!
//! The reconciler and normalizer talk to donations, pledge admins and
//! donation histories through the [`RecordStore`] trait. The production
//! implementation is [`PgStore`] on Postgres; tests use an in-memory
//! fake.

mod pg;
mod types;

pub use pg::PgStore;
pub use types::{
    AdminType, Donation, DonationHistory, DonationPatch, DonationQuery, DonationStatus,
    NewDonation, NewDonationHistory, PledgeAdmin,
};

use crate::error::SyncResult;
use crate::ledger::AdminId;

use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch one donation. Missing ids surface as a `NotFound` error.
    async fn get_donation(&self, id: Uuid) -> SyncResult<Donation>;

    /// All donations matching the query, unpaginated unless a limit is set.
    async fn find_donations(&self, query: &DonationQuery) -> SyncResult<Vec<Donation>>;

    async fn create_donation(&self, data: NewDonation) -> SyncResult<Donation>;

    /// Merge a partial update into an existing donation and return the
    /// updated record. Missing ids surface as `NotFound`.
    async fn patch_donation(&self, id: Uuid, patch: DonationPatch) -> SyncResult<Donation>;

    /// Fetch a ledger participant. Missing ids surface as `NotFound`;
    /// the reconciler treats that as a transient ordering race.
    async fn get_pledge_admin(&self, id: AdminId) -> SyncResult<PledgeAdmin>;

    async fn create_donation_history(
        &self,
        data: NewDonationHistory,
    ) -> SyncResult<DonationHistory>;
}
