//! Error types for the pledge synchronizer

use thiserror::Error;

/// Main error type for the synchronizer
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Ledger RPC error: {0}")]
    Ledger(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Nonce released out of order: got {released}, expected {expected}")]
    NonceContract { released: u64, expected: u64 },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Build the `NotFound` condition the record store contract requires.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        SyncError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Check whether this is the record store's "no such entity" condition.
    ///
    /// The reconciler treats this as a transient ordering race, everything
    /// else as a hard failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound { .. })
    }
}

/// Result type for synchronizer operations
pub type SyncResult<T> = Result<T, SyncError>;
