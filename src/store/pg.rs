//! PostgreSQL record store

use crate::config::DatabaseConfig;
use crate::error::{SyncError, SyncResult};
use crate::ledger::AdminId;

use super::types::{
    AdminType, Donation, DonationHistory, DonationPatch, DonationQuery, DonationStatus,
    NewDonation, NewDonationHistory, PledgeAdmin,
};
use super::RecordStore;

use crate::ledger::PaymentState;

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::U256;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

/// Record store on Postgres.
///
/// Writes are single-row and last-write-wins; the reconciler is the only
/// writer of donations, so no optimistic locking is carried.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn new(config: &DatabaseConfig) -> SyncResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(SyncError::Database)?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS donations (
                id UUID PRIMARY KEY,
                donor_address VARCHAR(66) NOT NULL,
                amount VARCHAR(80) NOT NULL,
                pledge_id BIGINT NOT NULL,
                owner VARCHAR(255) NOT NULL,
                owner_id BIGINT NOT NULL,
                owner_type VARCHAR(20) NOT NULL,
                delegate VARCHAR(255),
                delegate_id BIGINT,
                proposed_project_id BIGINT,
                status VARCHAR(20) NOT NULL,
                payment_status VARCHAR(20) NOT NULL,
                tx_hash VARCHAR(66) NOT NULL,
                commit_time TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_donations_pledge_tx
            ON donations (pledge_id, tx_hash)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_donations_status
            ON donations (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pledge_admins (
                id BIGINT PRIMARY KEY,
                admin_type VARCHAR(20) NOT NULL,
                name VARCHAR(255) NOT NULL DEFAULT '',
                address VARCHAR(66) NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS donation_histories (
                id UUID PRIMARY KEY,
                donation_id UUID NOT NULL,
                owner_id BIGINT NOT NULL,
                amount VARCHAR(80) NOT NULL,
                tx_hash VARCHAR(66) NOT NULL,
                delegate_id BIGINT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scan_checkpoints (
                id SMALLINT PRIMARY KEY,
                block_number BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> SyncResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(SyncError::Database)?;
        Ok(())
    }

    /// Last block the scanner finished, if any run has checkpointed
    pub async fn get_scan_checkpoint(&self) -> SyncResult<Option<u64>> {
        let row = sqlx::query("SELECT block_number FROM scan_checkpoints WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("block_number") as u64))
    }

    pub async fn save_scan_checkpoint(&self, block_number: u64) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_checkpoints (id, block_number, updated_at)
            VALUES (1, $1, NOW())
            ON CONFLICT (id)
            DO UPDATE SET block_number = $1, updated_at = NOW()
            "#,
        )
        .bind(block_number as i64)
        .execute(&self.pool)
        .await?;

        debug!("Saved scan checkpoint: block {}", block_number);
        Ok(())
    }
}

const DONATION_COLUMNS: &str = "id, donor_address, amount, pledge_id, owner, owner_id, \
     owner_type, delegate, delegate_id, proposed_project_id, status, payment_status, \
     tx_hash, commit_time, created_at, updated_at";

fn map_donation(row: &PgRow) -> SyncResult<Donation> {
    let amount: String = row.get("amount");
    let amount = U256::from_dec_str(&amount)
        .map_err(|e| SyncError::Internal(format!("Bad amount in donation row: {}", e)))?;

    let status: String = row.get("status");
    let owner_type: String = row.get("owner_type");
    let payment_status: String = row.get("payment_status");

    Ok(Donation {
        id: row.get("id"),
        donor_address: row.get("donor_address"),
        amount,
        pledge_id: row.get::<i64, _>("pledge_id") as u64,
        owner: row.get("owner"),
        owner_id: row.get::<i64, _>("owner_id") as u64,
        owner_type: AdminType::from_str_lossy(&owner_type),
        delegate: row.get("delegate"),
        delegate_id: row.get::<Option<i64>, _>("delegate_id").map(|v| v as u64),
        proposed_project_id: row
            .get::<Option<i64>, _>("proposed_project_id")
            .map(|v| v as u64),
        status: DonationStatus::from_str_lossy(&status),
        payment_status: PaymentState::from_str_lossy(&payment_status),
        tx_hash: row.get("tx_hash"),
        commit_time: row.get("commit_time"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl RecordStore for PgStore {
    async fn get_donation(&self, id: Uuid) -> SyncResult<Donation> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM donations WHERE id = $1",
            DONATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SyncError::not_found("donation", id))?;

        map_donation(&row)
    }

    async fn find_donations(&self, query: &DonationQuery) -> SyncResult<Vec<Donation>> {
        // Every filter is always bound; NULL (or false) disables it
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM donations
            WHERE ($1::BIGINT IS NULL OR pledge_id = $1)
              AND ($2::VARCHAR IS NULL OR tx_hash = $2)
              AND ($3::VARCHAR IS NULL OR status = $3)
              AND (NOT $4 OR (proposed_project_id IS NOT NULL AND proposed_project_id > 0))
              AND (NOT $5 OR amount <> '0')
              AND ($6::TIMESTAMPTZ IS NULL OR commit_time <= $6)
            ORDER BY created_at ASC
            LIMIT $7
            "#,
            DONATION_COLUMNS
        ))
        .bind(query.pledge_id.map(|v| v as i64))
        .bind(query.tx_hash.as_deref())
        .bind(query.status.map(|s| s.as_str()))
        .bind(query.requires_proposed_project)
        .bind(query.nonzero_amount)
        .bind(query.commit_time_before)
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_donation).collect()
    }

    async fn create_donation(&self, data: NewDonation) -> SyncResult<Donation> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO donations
                (id, donor_address, amount, pledge_id, owner, owner_id, owner_type,
                 delegate, delegate_id, proposed_project_id, status, payment_status,
                 tx_hash, commit_time, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(id)
        .bind(&data.donor_address)
        .bind(data.amount.to_string())
        .bind(data.pledge_id as i64)
        .bind(&data.owner)
        .bind(data.owner_id as i64)
        .bind(data.owner_type.as_str())
        .bind(data.delegate.as_deref())
        .bind(data.delegate_id.map(|v| v as i64))
        .bind(data.proposed_project_id.map(|v| v as i64))
        .bind(data.status.as_str())
        .bind(data.payment_status.as_str())
        .bind(&data.tx_hash)
        .bind(data.commit_time)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!("Created donation {} for pledge {}", id, data.pledge_id);

        Ok(Donation {
            id,
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
        })
    }

    async fn patch_donation(&self, id: Uuid, patch: DonationPatch) -> SyncResult<Donation> {
        // Read-merge-write; the reconciler is the only donation writer
        let mut donation = self.get_donation(id).await?;
        patch.apply(&mut donation);
        donation.updated_at = Utc::now();

        sqlx::query(
            r#"
            UPDATE donations
            SET amount = $2, pledge_id = $3, owner = $4, owner_id = $5, owner_type = $6,
                delegate = $7, delegate_id = $8, proposed_project_id = $9, status = $10,
                payment_status = $11, tx_hash = $12, commit_time = $13, updated_at = $14
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(donation.amount.to_string())
        .bind(donation.pledge_id as i64)
        .bind(&donation.owner)
        .bind(donation.owner_id as i64)
        .bind(donation.owner_type.as_str())
        .bind(donation.delegate.as_deref())
        .bind(donation.delegate_id.map(|v| v as i64))
        .bind(donation.proposed_project_id.map(|v| v as i64))
        .bind(donation.status.as_str())
        .bind(donation.payment_status.as_str())
        .bind(&donation.tx_hash)
        .bind(donation.commit_time)
        .bind(donation.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("Patched donation {}", id);
        Ok(donation)
    }

    async fn get_pledge_admin(&self, id: AdminId) -> SyncResult<PledgeAdmin> {
        let row = sqlx::query("SELECT id, admin_type, name, address FROM pledge_admins WHERE id = $1")
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SyncError::not_found("pledge admin", id))?;

        let admin_type: String = row.get("admin_type");

        Ok(PledgeAdmin {
            id: row.get::<i64, _>("id") as u64,
            admin_type: AdminType::from_str_lossy(&admin_type),
            name: row.get("name"),
            address: row.get("address"),
        })
    }

    async fn create_donation_history(
        &self,
        data: NewDonationHistory,
    ) -> SyncResult<DonationHistory> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO donation_histories
                (id, donation_id, owner_id, amount, tx_hash, delegate_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(id)
        .bind(data.donation_id)
        .bind(data.owner_id as i64)
        .bind(data.amount.to_string())
        .bind(&data.tx_hash)
        .bind(data.delegate_id.map(|v| v as i64))
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!("Recorded donation history for {}", data.donation_id);

        Ok(DonationHistory {
            id,
            donation_id: data.donation_id,
            owner_id: data.owner_id,
            amount: data.amount,
            tx_hash: data.tx_hash,
            delegate_id: data.delegate_id,
            created_at: now,
        })
    }
}
