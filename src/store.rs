use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;

use crate::error::{LedgerError, StorageError};
use crate::models::{Account, EntryStatus, LedgerEntry, NewEntry};
use crate::persistence::{durable, Journal, JournalRecord, JournalWriter, MemoryJournal, Publish};

/// Account store and transaction ledger for every user
///
/// # Locking
///
/// - Each account has an async *scope* lock. Holding it is the equivalent of a
///   row lock on the account: every read-modify-write for that user runs
///   inside it, and users never wait on each other's scope.
/// - A short synchronous commit section assigns the entry id, reserves the
///   external reference and queues the journal record. No I/O happens while
///   it is held; ids therefore follow journal order.
/// - The record is made durable by the journal writer off the async runtime.
///   The writer then publishes the new account and entry and only then
///   releases the user's scope, so the next unit of work for that user always
///   sees the committed balance.
/// - Readers take a brief read lock on the published state of one account
///   and never wait for an open unit of work.
///
/// Lock order is commit → refs → account state.
pub struct LedgerStore {
    books: Arc<RwLock<HashMap<String, Arc<UserBook>>>>,
    refs: Arc<RwLock<HashMap<String, RefLocation>>>,
    /// Serializes account creation only
    opening: Arc<tokio::sync::Mutex<()>>,
    /// Next entry id; its lock is the commit section
    commit: Mutex<u64>,
    writer: JournalWriter,
}

struct UserBook {
    scope: Arc<tokio::sync::Mutex<()>>,
    state: RwLock<BookState>,
}

struct BookState {
    account: Account,
    /// Ascending by id, i.e. commit order
    entries: Vec<LedgerEntry>,
}

#[derive(Debug, Clone)]
struct RefLocation {
    user_id: String,
    entry_id: u64,
}

impl UserBook {
    fn new(account: Account) -> Self {
        Self {
            scope: Arc::new(tokio::sync::Mutex::new(())),
            state: RwLock::new(BookState {
                account,
                entries: Vec::new(),
            }),
        }
    }
}

impl BookState {
    fn entry(&self, entry_id: u64) -> Option<&LedgerEntry> {
        self.entries
            .binary_search_by_key(&entry_id, |entry| entry.id)
            .ok()
            .map(|idx| &self.entries[idx])
    }

    fn entry_mut(&mut self, entry_id: u64) -> Option<&mut LedgerEntry> {
        self.entries
            .binary_search_by_key(&entry_id, |entry| entry.id)
            .ok()
            .map(move |idx| &mut self.entries[idx])
    }
}

/// Result of comparing an account with its ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub user_id: String,
    pub balance: i64,
    pub sum_completed: i64,
    pub entries: usize,
    /// Completed entries, taken in the order they moved the balance, chain
    /// their `resulting_balance` values without gaps
    pub running_total_ok: bool,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.balance == self.sum_completed && self.running_total_ok && self.balance >= 0
    }
}

impl LedgerStore {
    /// Empty store backed by a memory journal
    pub fn in_memory() -> Self {
        Self::empty(Box::new(MemoryJournal::new()), 1)
    }

    fn empty(journal: Box<dyn Journal>, next_id: u64) -> Self {
        Self {
            books: Arc::new(RwLock::new(HashMap::new())),
            refs: Arc::new(RwLock::new(HashMap::new())),
            opening: Arc::new(tokio::sync::Mutex::new(())),
            commit: Mutex::new(next_id),
            writer: JournalWriter::spawn(journal),
        }
    }

    /// Rebuild the store by replaying every record of `journal`
    pub fn open(journal: Box<dyn Journal>) -> Result<Self, StorageError> {
        let records = journal.replay()?;
        let mut books: HashMap<String, BookState> = HashMap::new();
        let mut refs = HashMap::new();
        let mut next_id = 1;

        for (idx, record) in records.into_iter().enumerate() {
            let corrupt = |reason: String| StorageError::Corrupt {
                line: idx + 1,
                reason,
            };

            match record {
                JournalRecord::Opened { account } => {
                    if books.contains_key(&account.user_id) {
                        return Err(corrupt(format!(
                            "account '{}' opened twice",
                            account.user_id
                        )));
                    }
                    books.insert(
                        account.user_id.clone(),
                        BookState {
                            account,
                            entries: Vec::new(),
                        },
                    );
                }
                JournalRecord::Posted { entry } => {
                    let book = books.get_mut(&entry.user_id).ok_or_else(|| {
                        corrupt(format!("entry {} for unknown account", entry.id))
                    })?;
                    if entry.id < next_id {
                        return Err(corrupt(format!("entry id {} out of order", entry.id)));
                    }
                    if let Some(external_ref) = &entry.external_ref {
                        let location = RefLocation {
                            user_id: entry.user_id.clone(),
                            entry_id: entry.id,
                        };
                        if refs.insert(external_ref.clone(), location).is_some() {
                            return Err(corrupt(format!(
                                "external reference '{}' recorded twice",
                                external_ref
                            )));
                        }
                    }
                    if entry.is_completed() {
                        book.account.balance = entry.resulting_balance;
                    }
                    next_id = entry.id + 1;
                    book.entries.push(entry);
                }
                JournalRecord::Settled { entry } => {
                    let book = books.get_mut(&entry.user_id).ok_or_else(|| {
                        corrupt(format!("settlement {} for unknown account", entry.id))
                    })?;
                    if entry.is_completed() {
                        book.account.balance = entry.resulting_balance;
                    }
                    let slot = book.entry_mut(entry.id).ok_or_else(|| {
                        corrupt(format!("settlement of unknown entry {}", entry.id))
                    })?;
                    *slot = entry;
                }
                JournalRecord::Archived { user_id } => {
                    let book = books
                        .get_mut(&user_id)
                        .ok_or_else(|| corrupt(format!("archive of unknown account '{}'", user_id)))?;
                    book.account.archived = true;
                }
            }
        }

        let store = Self::empty(journal, next_id);
        {
            let mut published = store.books.write();
            for (user_id, state) in books {
                let book = UserBook::new(state.account.clone());
                *book.state.write() = state;
                published.insert(user_id, Arc::new(book));
            }
        }
        *store.refs.write() = refs;

        Ok(store)
    }

    fn book(&self, user_id: &str) -> Option<Arc<UserBook>> {
        self.books.read().get(user_id).cloned()
    }

    fn snapshot(book: &UserBook) -> Account {
        book.state.read().account.clone()
    }

    /// Existing account, or a newly opened one with a zero balance
    ///
    /// Creation is serialized, so of two concurrent calls for the same user
    /// exactly one opens the account and the other reads it.
    pub async fn get_or_create(&self, user_id: &str) -> Result<Account, LedgerError> {
        if let Some(book) = self.book(user_id) {
            return Ok(Self::snapshot(&book));
        }

        let opening = self.opening.clone().lock_owned().await;
        if let Some(book) = self.book(user_id) {
            return Ok(Self::snapshot(&book));
        }

        let account = Account::new(user_id);
        let books = self.books.clone();
        let opened = account.clone();
        let publish: Publish = Box::new(move |durable| {
            if durable {
                books
                    .write()
                    .insert(opened.user_id.clone(), Arc::new(UserBook::new(opened)));
            }
            drop(opening);
        });

        let receiver = self.writer.submit(
            JournalRecord::Opened {
                account: account.clone(),
            },
            publish,
        );
        durable(receiver).await?;

        tracing::debug!(user_id, "Opened account");
        Ok(account)
    }

    /// Point-in-time read of one account
    pub fn read(&self, user_id: &str) -> Option<Account> {
        self.book(user_id).map(|book| Self::snapshot(&book))
    }

    /// Every known user id, sorted
    pub fn user_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.books.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Open a unit of work on an existing account
    ///
    /// Waits at most `timeout` for the account's scope.
    pub async fn begin(
        &self,
        user_id: &str,
        timeout: Duration,
    ) -> Result<UnitOfWork<'_>, LedgerError> {
        let book = self
            .book(user_id)
            .ok_or_else(|| LedgerError::AccountNotFound {
                user_id: user_id.to_string(),
            })?;

        let guard = tokio::time::timeout(timeout, book.scope.clone().lock_owned())
            .await
            .map_err(|_| LedgerError::LockTimeout {
                user_id: user_id.to_string(),
            })?;

        Ok(UnitOfWork {
            store: self,
            book,
            scope: guard,
        })
    }

    pub fn find_by_external_ref(&self, external_ref: &str) -> Option<LedgerEntry> {
        let location = self.refs.read().get(external_ref).cloned()?;
        let book = self.book(&location.user_id)?;
        let state = book.state.read();
        let entry = state.entry(location.entry_id).cloned();
        entry
    }

    /// Entries of one user, newest first, ordered by `created_at` then `id`
    pub fn list_by_user(&self, user_id: &str, page: usize, page_size: usize) -> Vec<LedgerEntry> {
        let Some(book) = self.book(user_id) else {
            return Vec::new();
        };

        let mut entries = {
            let state = book.state.read();
            state.entries.clone()
        };
        entries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        entries
            .into_iter()
            .skip(page.saturating_sub(1).saturating_mul(page_size))
            .take(page_size)
            .collect()
    }

    pub fn count_by_user(&self, user_id: &str) -> usize {
        self.book(user_id)
            .map(|book| {
                let state = book.state.read();
                state.entries.len()
            })
            .unwrap_or(0)
    }

    /// Sum of the signed amounts of all COMPLETED entries of one user
    pub fn sum_completed(&self, user_id: &str) -> i64 {
        self.book(user_id)
            .map(|book| {
                let state = book.state.read();
                state.entries.iter().map(LedgerEntry::completed_amount).sum()
            })
            .unwrap_or(0)
    }

    pub fn check_consistency(&self, user_id: &str) -> Option<ConsistencyReport> {
        let book = self.book(user_id)?;
        let state = book.state.read();

        let mut completed: Vec<&LedgerEntry> =
            state.entries.iter().filter(|e| e.is_completed()).collect();
        completed.sort_by_key(|entry| (effective_at(entry), entry.id));

        let mut running = 0i64;
        let mut running_total_ok = true;
        for entry in &completed {
            running += entry.amount;
            if entry.resulting_balance != running {
                running_total_ok = false;
            }
        }

        Some(ConsistencyReport {
            user_id: user_id.to_string(),
            balance: state.account.balance,
            sum_completed: running,
            entries: state.entries.len(),
            running_total_ok,
        })
    }
}

/// When an entry moved the balance
fn effective_at(entry: &LedgerEntry) -> DateTime<Utc> {
    entry.settled_at.unwrap_or(entry.created_at)
}

/// Exclusive, atomic scope over one account
///
/// Dropping it without committing releases the scope and changes nothing.
pub struct UnitOfWork<'a> {
    store: &'a LedgerStore,
    book: Arc<UserBook>,
    scope: OwnedMutexGuard<()>,
}

impl UnitOfWork<'_> {
    pub fn account(&self) -> Account {
        self.book.state.read().account.clone()
    }

    pub fn find_by_external_ref(&self, external_ref: &str) -> Option<LedgerEntry> {
        self.store.find_by_external_ref(external_ref)
    }

    /// Write one entry and, when it is COMPLETED, the matching balance
    ///
    /// The resulting balance is computed here from the balance being
    /// replaced, never read back afterwards.
    pub(crate) async fn commit_entry(self, new: NewEntry) -> Result<LedgerEntry, LedgerError> {
        let UnitOfWork { store, book, scope } = self;

        let (entry, receiver) = {
            let mut next_id = store.commit.lock();
            let mut refs = store.refs.write();

            if let Some(external_ref) = &new.external_ref {
                if refs.contains_key(external_ref) {
                    return Err(LedgerError::DuplicateExternalRef {
                        external_ref: external_ref.clone(),
                    });
                }
            }

            let current = book.state.read().account.balance;
            let resulting_balance = match new.status {
                EntryStatus::Completed => current
                    .checked_add(new.amount)
                    .ok_or(LedgerError::InvalidAmount { amount: new.amount })?,
                _ => current,
            };
            if resulting_balance < 0 {
                return Err(LedgerError::InsufficientBalance {
                    user_id: new.user_id,
                    balance: current,
                    requested: new.amount.saturating_neg(),
                });
            }

            let entry = LedgerEntry {
                id: *next_id,
                user_id: new.user_id,
                amount: new.amount,
                resulting_balance,
                entry_type: new.entry_type,
                reason: new.reason,
                status: new.status,
                external_ref: new.external_ref,
                description: new.description,
                created_at: Utc::now(),
                settled_at: None,
            };
            *next_id += 1;

            // Reserved now so a concurrent commit under the same reference
            // fails; released again if the write does not become durable
            if let Some(external_ref) = &entry.external_ref {
                refs.insert(
                    external_ref.clone(),
                    RefLocation {
                        user_id: entry.user_id.clone(),
                        entry_id: entry.id,
                    },
                );
            }
            drop(refs);

            let refs = store.refs.clone();
            let posted = entry.clone();
            let publish: Publish = Box::new(move |durable| {
                if durable {
                    let mut state = book.state.write();
                    if posted.is_completed() {
                        state.account.balance = posted.resulting_balance;
                    }
                    state.entries.push(posted);
                } else if let Some(external_ref) = &posted.external_ref {
                    refs.write().remove(external_ref);
                }
                drop(scope);
            });

            let receiver = store.writer.submit(
                JournalRecord::Posted {
                    entry: entry.clone(),
                },
                publish,
            );
            (entry, receiver)
        };

        durable(receiver).await?;
        Ok(entry)
    }

    /// Move a PENDING entry to COMPLETED or FAILED
    pub(crate) async fn settle_entry(
        self,
        entry_id: u64,
        status: EntryStatus,
    ) -> Result<LedgerEntry, LedgerError> {
        let UnitOfWork { store, book, scope } = self;

        let (pending, current) = {
            let state = book.state.read();
            let pending = state.entry(entry_id).cloned();
            (pending, state.account.balance)
        };
        let mut entry = pending.ok_or_else(|| LedgerError::EntryNotFound {
            external_ref: format!("#{}", entry_id),
        })?;

        if entry.status != EntryStatus::Pending {
            return Err(LedgerError::ExternalRefConflict {
                external_ref: entry.external_ref.unwrap_or_default(),
                status: entry.status,
            });
        }

        entry.resulting_balance = match status {
            EntryStatus::Completed => current
                .checked_add(entry.amount)
                .filter(|balance| *balance >= 0)
                .ok_or(LedgerError::InvalidAmount {
                    amount: entry.amount,
                })?,
            _ => current,
        };
        entry.status = status;
        entry.settled_at = Some(Utc::now());

        let settled = entry.clone();
        let publish: Publish = Box::new(move |durable| {
            if durable {
                let mut state = book.state.write();
                if settled.is_completed() {
                    state.account.balance = settled.resulting_balance;
                }
                if let Some(slot) = state.entry_mut(settled.id) {
                    *slot = settled;
                }
            }
            drop(scope);
        });

        let receiver = store.writer.submit(
            JournalRecord::Settled {
                entry: entry.clone(),
            },
            publish,
        );
        durable(receiver).await?;
        Ok(entry)
    }

    /// Soft-archive the account
    pub(crate) async fn archive(self) -> Result<Account, LedgerError> {
        let mut account = self.account();
        if account.archived {
            return Ok(account);
        }
        account.archived = true;

        let UnitOfWork { store, book, scope } = self;
        let publish: Publish = Box::new(move |durable| {
            if durable {
                book.state.write().account.archived = true;
            }
            drop(scope);
        });

        let receiver = store.writer.submit(
            JournalRecord::Archived {
                user_id: account.user_id.clone(),
            },
            publish,
        );
        durable(receiver).await?;
        Ok(account)
    }
}
