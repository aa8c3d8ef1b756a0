use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{LedgerError, StorageError};
use crate::history::{self, HistoryPage, HistoryQuery, MAX_PAGE_SIZE};
use crate::models::{Account, Direction, EntryStatus, EntryType, LedgerEntry, Mutation, NewEntry};
use crate::persistence::Journal;
use crate::store::{ConsistencyReport, LedgerStore, UnitOfWork};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Longest wait for a user's balance scope before failing with `LockTimeout`
    pub lock_timeout: Duration,
    pub max_page_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            max_page_size: MAX_PAGE_SIZE,
        }
    }
}

/// Outcome of a mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub entry: LedgerEntry,
    /// True when the external reference was already recorded and the prior
    /// entry was returned instead of mutating again
    pub replayed: bool,
}

/// Terminal state requested for a PENDING entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Completed,
    Failed,
}

impl Settlement {
    fn status(self) -> EntryStatus {
        match self {
            Settlement::Completed => EntryStatus::Completed,
            Settlement::Failed => EntryStatus::Failed,
        }
    }
}

/// Balance mutation engine
///
/// The only code path that changes a balance. Every operation runs as one
/// unit of work on the user's account:
///
/// 1. take the user's scope (bounded by `lock_timeout`)
/// 2. return the prior entry if the external reference is already recorded
/// 3. read the balance and compute the new one, rejecting negative results
/// 4. commit the entry and the balance together, or neither
///
/// Cloning is cheap and shares the underlying store.
#[derive(Clone)]
pub struct CoinEngine {
    store: Arc<LedgerStore>,
    config: EngineConfig,
}

impl CoinEngine {
    pub fn new(store: LedgerStore, config: EngineConfig) -> Self {
        Self {
            store: Arc::new(store),
            config,
        }
    }

    /// Engine over an empty memory-only store
    pub fn in_memory() -> Self {
        Self::new(LedgerStore::in_memory(), EngineConfig::default())
    }

    /// Engine over the state recovered from `journal`
    pub fn recover(journal: Box<dyn Journal>, config: EngineConfig) -> Result<Self, StorageError> {
        let store = LedgerStore::open(journal)?;
        info!(accounts = store.user_ids().len(), "Recovered ledger from journal");
        Ok(Self::new(store, config))
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Add coins to a balance
    pub async fn credit(&self, mutation: Mutation) -> Result<LedgerEntry, LedgerError> {
        self.post(Direction::Credit, mutation)
            .await
            .map(|posting| posting.entry)
    }

    /// Remove coins from a balance; fails with `InsufficientBalance` rather
    /// than going below zero
    pub async fn debit(&self, mutation: Mutation) -> Result<LedgerEntry, LedgerError> {
        self.post(Direction::Debit, mutation)
            .await
            .map(|posting| posting.entry)
    }

    /// Credit or debit, reporting whether the call was an idempotent replay
    pub async fn post(
        &self,
        direction: Direction,
        mutation: Mutation,
    ) -> Result<Posting, LedgerError> {
        if mutation.amount <= 0 {
            return Err(LedgerError::InvalidAmount {
                amount: mutation.amount,
            });
        }

        let entry_type = match direction {
            Direction::Credit => EntryType::Credit,
            Direction::Debit => EntryType::Debit,
        };

        self.store.get_or_create(&mutation.user_id).await?;
        let uow = self
            .store
            .begin(&mutation.user_id, self.config.lock_timeout)
            .await?;

        if let Some(external_ref) = &mutation.external_ref {
            if let Some(existing) = uow.find_by_external_ref(external_ref) {
                return replay(existing, &mutation, entry_type, true);
            }
        }

        let account = uow.account();
        if account.archived {
            return Err(LedgerError::AccountArchived {
                user_id: mutation.user_id,
            });
        }

        let signed = match direction {
            Direction::Credit => {
                account
                    .balance_after_credit(mutation.amount)
                    .ok_or(LedgerError::InvalidAmount {
                        amount: mutation.amount,
                    })?;
                mutation.amount
            }
            Direction::Debit => {
                if account.balance_after_debit(mutation.amount).is_none() {
                    info!(
                        user_id = %mutation.user_id,
                        balance = account.balance,
                        requested = mutation.amount,
                        "Rejected debit: insufficient balance"
                    );
                    return Err(LedgerError::InsufficientBalance {
                        user_id: mutation.user_id,
                        balance: account.balance,
                        requested: mutation.amount,
                    });
                }
                -mutation.amount
            }
        };

        let new = NewEntry {
            user_id: mutation.user_id.clone(),
            amount: signed,
            entry_type,
            reason: mutation.reason,
            status: EntryStatus::Completed,
            external_ref: mutation.external_ref.clone(),
            description: mutation.description.clone(),
        };

        self.commit(uow, new, &mutation).await
    }

    /// Record a PENDING credit that does not move the balance until settled
    ///
    /// An entry already recorded under `external_ref` for the same credit is
    /// returned as is, whatever its status. One recorded for anything else is
    /// an `ExternalRefMismatch`.
    pub async fn open_pending(&self, mutation: Mutation) -> Result<Posting, LedgerError> {
        if mutation.amount <= 0 {
            return Err(LedgerError::InvalidAmount {
                amount: mutation.amount,
            });
        }
        let Some(external_ref) = mutation.external_ref.clone() else {
            return Err(LedgerError::MissingExternalRef);
        };

        self.store.get_or_create(&mutation.user_id).await?;
        let uow = self
            .store
            .begin(&mutation.user_id, self.config.lock_timeout)
            .await?;

        if let Some(existing) = uow.find_by_external_ref(&external_ref) {
            debug!(external_ref = %external_ref, status = ?existing.status, "Pending entry already recorded");
            return replay(existing, &mutation, EntryType::Credit, false);
        }

        if uow.account().archived {
            return Err(LedgerError::AccountArchived {
                user_id: mutation.user_id,
            });
        }

        let new = NewEntry {
            user_id: mutation.user_id.clone(),
            amount: mutation.amount,
            entry_type: EntryType::Credit,
            reason: mutation.reason,
            status: EntryStatus::Pending,
            external_ref: Some(external_ref),
            description: mutation.description.clone(),
        };

        self.commit(uow, new, &mutation).await
    }

    /// Move the PENDING entry recorded under `external_ref` to a terminal state
    ///
    /// Settling into the state the entry already has is a replay; settling a
    /// COMPLETED entry as FAILED (or the reverse) is a conflict. Only credits
    /// can be settled.
    pub async fn settle(
        &self,
        external_ref: &str,
        outcome: Settlement,
    ) -> Result<Posting, LedgerError> {
        self.settle_matching(external_ref, outcome, None).await
    }

    /// Settle the pending credit recorded for `expected`
    ///
    /// Like `settle`, but the entry under `expected.external_ref` must also
    /// be the same credit: user, amount and reason. Anything else fails with
    /// `ExternalRefMismatch` and nothing changes.
    pub async fn settle_expected(
        &self,
        expected: &Mutation,
        outcome: Settlement,
    ) -> Result<Posting, LedgerError> {
        let external_ref = expected
            .external_ref
            .as_deref()
            .ok_or(LedgerError::MissingExternalRef)?;
        self.settle_matching(external_ref, outcome, Some(expected))
            .await
    }

    async fn settle_matching(
        &self,
        external_ref: &str,
        outcome: Settlement,
        expected: Option<&Mutation>,
    ) -> Result<Posting, LedgerError> {
        let not_found = || LedgerError::EntryNotFound {
            external_ref: external_ref.to_string(),
        };

        let owner = self
            .store
            .find_by_external_ref(external_ref)
            .ok_or_else(not_found)?
            .user_id;
        let uow = self.store.begin(&owner, self.config.lock_timeout).await?;

        let current = uow.find_by_external_ref(external_ref).ok_or_else(not_found)?;
        let matches = current.entry_type == EntryType::Credit
            && expected.map_or(true, |expected| same_request(&current, expected, EntryType::Credit));
        if !matches {
            warn!(
                external_ref,
                recorded_user = %current.user_id,
                recorded_type = ?current.entry_type,
                recorded_amount = current.amount,
                "Settlement targets an entry recorded for a different mutation"
            );
            return Err(LedgerError::ExternalRefMismatch {
                external_ref: external_ref.to_string(),
            });
        }

        match (current.status, outcome) {
            (EntryStatus::Pending, _) => {}
            (EntryStatus::Completed, Settlement::Completed)
            | (EntryStatus::Failed, Settlement::Failed) => {
                return Ok(Posting {
                    entry: current,
                    replayed: true,
                });
            }
            (status, _) => {
                return Err(LedgerError::ExternalRefConflict {
                    external_ref: external_ref.to_string(),
                    status,
                });
            }
        }

        if outcome == Settlement::Completed && uow.account().archived {
            return Err(LedgerError::AccountArchived { user_id: owner });
        }

        let entry = uow.settle_entry(current.id, outcome.status()).await?;
        info!(
            user_id = %entry.user_id,
            external_ref,
            status = ?entry.status,
            resulting_balance = entry.resulting_balance,
            "Settled pending entry"
        );

        Ok(Posting {
            entry,
            replayed: false,
        })
    }

    async fn commit(
        &self,
        uow: UnitOfWork<'_>,
        new: NewEntry,
        mutation: &Mutation,
    ) -> Result<Posting, LedgerError> {
        let entry_type = new.entry_type;
        let require_completed = new.status == EntryStatus::Completed;

        match uow.commit_entry(new).await {
            Ok(entry) => {
                info!(
                    user_id = %entry.user_id,
                    entry_id = entry.id,
                    amount = entry.amount,
                    resulting_balance = entry.resulting_balance,
                    reason = entry.reason.as_str(),
                    status = ?entry.status,
                    external_ref = entry.external_ref.as_deref().unwrap_or(""),
                    "Committed ledger entry"
                );
                Ok(Posting {
                    entry,
                    replayed: false,
                })
            }
            // Another user's unit of work recorded the same reference first
            Err(LedgerError::DuplicateExternalRef { external_ref }) => {
                match self.store.find_by_external_ref(&external_ref) {
                    Some(existing) => replay(existing, mutation, entry_type, require_completed),
                    None => Err(LedgerError::DuplicateExternalRef { external_ref }),
                }
            }
            Err(err) => {
                if err.is_retryable() {
                    warn!(user_id = %mutation.user_id, error = %err, "Commit aborted");
                }
                Err(err)
            }
        }
    }

    /// Current balance, opening the account if it has never been seen
    pub async fn balance(&self, user_id: &str) -> Result<Account, LedgerError> {
        self.store.get_or_create(user_id).await
    }

    pub fn history(&self, user_id: &str, query: HistoryQuery) -> HistoryPage {
        history::history(&self.store, user_id, query, self.config.max_page_size)
    }

    /// Soft-archive an account; later mutations fail with `AccountArchived`
    pub async fn archive(&self, user_id: &str) -> Result<Account, LedgerError> {
        let uow = self.store.begin(user_id, self.config.lock_timeout).await?;
        let account = uow.archive().await?;
        info!(user_id, "Archived account");
        Ok(account)
    }

    pub fn check_consistency(&self, user_id: &str) -> Option<ConsistencyReport> {
        self.store.check_consistency(user_id)
    }
}

/// True when `existing` records the mutation requested now
fn same_request(existing: &LedgerEntry, mutation: &Mutation, entry_type: EntryType) -> bool {
    existing.user_id == mutation.user_id
        && existing.entry_type == entry_type
        && existing.amount.abs() == mutation.amount
        && existing.reason == mutation.reason
}

/// Return a previously recorded entry for a repeated external reference
///
/// The reference only replays the mutation it was first recorded for; a
/// different user, direction, amount or reason is an `ExternalRefMismatch`.
/// Direct mutations replay COMPLETED entries only, pending ones any status.
fn replay(
    existing: LedgerEntry,
    mutation: &Mutation,
    entry_type: EntryType,
    require_completed: bool,
) -> Result<Posting, LedgerError> {
    let external_ref = existing.external_ref.clone().unwrap_or_default();

    if !same_request(&existing, mutation, entry_type) {
        warn!(
            external_ref = %external_ref,
            recorded_user = %existing.user_id,
            recorded_type = ?existing.entry_type,
            recorded_amount = existing.amount,
            requested_user = %mutation.user_id,
            requested_type = ?entry_type,
            requested_amount = mutation.amount,
            "Rejected external reference reused for a different mutation"
        );
        return Err(LedgerError::ExternalRefMismatch { external_ref });
    }

    if require_completed && existing.status != EntryStatus::Completed {
        return Err(LedgerError::ExternalRefConflict {
            external_ref,
            status: existing.status,
        });
    }

    debug!(external_ref = %external_ref, entry_id = existing.id, "Idempotent replay");
    Ok(Posting {
        entry: existing,
        replayed: true,
    })
}
