use thiserror::Error;

use crate::models::EntryStatus;

/// Faults in the durable journal
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("journal IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt journal record at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("journal unavailable: {0}")]
    Unavailable(String),
}

/// Business and storage errors of the balance mutation engine
///
/// Every variant is raised before or instead of a commit, so none of them
/// leaves an account and its ledger half-updated.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("invalid amount {amount}: must be a positive whole number of coins")]
    InvalidAmount { amount: i64 },

    #[error("insufficient balance for {user_id}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        user_id: String,
        balance: i64,
        requested: i64,
    },

    #[error("external reference '{external_ref}' is already recorded")]
    DuplicateExternalRef { external_ref: String },

    #[error("external reference '{external_ref}' belongs to a {status:?} entry")]
    ExternalRefConflict {
        external_ref: String,
        status: EntryStatus,
    },

    #[error("external reference '{external_ref}' was recorded for a different mutation")]
    ExternalRefMismatch { external_ref: String },

    #[error("pending entries need an external reference")]
    MissingExternalRef,

    #[error("account '{user_id}' not found")]
    AccountNotFound { user_id: String },

    #[error("account '{user_id}' is archived")]
    AccountArchived { user_id: String },

    #[error("no ledger entry for external reference '{external_ref}'")]
    EntryNotFound { external_ref: String },

    #[error("timed out waiting for the balance lock of '{user_id}'")]
    LockTimeout { user_id: String },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StorageError),
}

impl LedgerError {
    /// True when the same request may succeed if retried later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::LockTimeout { .. } | LedgerError::StorageUnavailable(_)
        )
    }
}

/// Errors that can occur while running the batch tool
/// These are system-level errors (I/O, parsing), not business rule violations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
