use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::thread;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::error::StorageError;
use crate::models::{Account, LedgerEntry};

/// One committed unit of work
///
/// A posted entry carries its `resulting_balance`, which is the account
/// balance after the commit, so a single record is enough to restore both the
/// ledger and the account it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum JournalRecord {
    Opened { account: Account },
    Posted { entry: LedgerEntry },
    Settled { entry: LedgerEntry },
    Archived { user_id: String },
}

/// Durable write-ahead journal behind the ledger store
///
/// # WAL (Write-Ahead Log) Pattern
///
/// 1. **Write First**: a commit is appended (and synced) before it becomes visible
/// 2. **Publish**: only then is the in-memory account and ledger state updated
/// 3. **Crash Recovery**: on restart every record is replayed to rebuild state
///
/// If `append` fails nothing has been published, so a failed commit leaves no
/// trace in memory.
pub trait Journal: Send {
    /// Append one record durably
    ///
    /// Implementations must either persist the whole record or leave the
    /// journal as it was before the call.
    fn append(&mut self, record: &JournalRecord) -> Result<(), StorageError>;

    /// Append several records with one durable write
    ///
    /// Same all-or-nothing rule as `append`, over the whole batch.
    fn append_batch(&mut self, records: &[JournalRecord]) -> Result<(), StorageError> {
        for record in records {
            self.append(record)?;
        }
        Ok(())
    }

    /// Every record in append order
    fn replay(&self) -> Result<Vec<JournalRecord>, StorageError>;
}

/// Journal kept in process memory
///
/// Useful for tests and for running the service without a data directory.
/// State does not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: Vec<JournalRecord>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Journal for MemoryJournal {
    fn append(&mut self, record: &JournalRecord) -> Result<(), StorageError> {
        self.records.push(record.clone());
        Ok(())
    }

    fn append_batch(&mut self, records: &[JournalRecord]) -> Result<(), StorageError> {
        self.records.extend_from_slice(records);
        Ok(())
    }

    fn replay(&self) -> Result<Vec<JournalRecord>, StorageError> {
        Ok(self.records.clone())
    }
}

/// Append-only JSON-lines journal on disk
///
/// Each record is one line, written with a single `write_all` and followed by
/// `sync_data`. A line without its trailing newline is a torn write from a
/// crash; it is cut off when the journal is opened.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: File,
    len: u64,
}

impl FileJournal {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let complete = bytes
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|idx| idx + 1)
            .unwrap_or(0);

        if complete < bytes.len() {
            warn!(
                path = %path.display(),
                dropped_bytes = bytes.len() - complete,
                "Discarding torn record at end of journal"
            );
            file.set_len(complete as u64)?;
            file.sync_all()?;
        }

        Ok(Self {
            path,
            file,
            len: complete as u64,
        })
    }
}

impl Journal for FileJournal {
    fn append(&mut self, record: &JournalRecord) -> Result<(), StorageError> {
        self.append_batch(std::slice::from_ref(record))
    }

    fn append_batch(&mut self, records: &[JournalRecord]) -> Result<(), StorageError> {
        let mut lines = Vec::new();
        for record in records {
            serde_json::to_writer(&mut lines, record)?;
            lines.push(b'\n');
        }

        let written = self
            .file
            .write_all(&lines)
            .and_then(|_| self.file.sync_data());

        if let Err(err) = written {
            // Roll the file back so a partial line can't be replayed later
            if let Err(truncate_err) = self.file.set_len(self.len) {
                warn!(
                    path = %self.path.display(),
                    error = %truncate_err,
                    "Failed to roll back journal after write error"
                );
            }
            return Err(err.into());
        }

        self.len += lines.len() as u64;
        Ok(())
    }

    fn replay(&self) -> Result<Vec<JournalRecord>, StorageError> {
        let bytes = fs::read(&self.path)?;
        let complete = &bytes[..(self.len as usize).min(bytes.len())];

        complete
            .split(|b| *b == b'\n')
            .enumerate()
            .filter(|(_, line)| !line.is_empty())
            .map(|(idx, line)| {
                serde_json::from_slice(line).map_err(|err| StorageError::Corrupt {
                    line: idx + 1,
                    reason: err.to_string(),
                })
            })
            .collect()
    }
}

/// Upper bound on records folded into one durable write
const MAX_GROUP_COMMIT: usize = 256;

/// Runs after a record's write attempt, with `true` when it is durable
pub(crate) type Publish = Box<dyn FnOnce(bool) + Send>;

struct PendingWrite {
    record: JournalRecord,
    publish: Publish,
    done: oneshot::Sender<Result<(), StorageError>>,
}

/// Group-commit writer owning the journal
///
/// Records are written on a dedicated thread, so a slow `sync_data` never
/// blocks an async worker. Whatever queued up while the previous write was
/// in flight goes out in the next one, sharing a single fsync.
///
/// Each record carries a publish step that the writer runs right after the
/// write, whether or not the submitter is still waiting for the answer. A
/// durable record is therefore always made visible in memory, even when the
/// request that produced it was cancelled.
pub(crate) struct JournalWriter {
    queue: mpsc::UnboundedSender<PendingWrite>,
}

impl JournalWriter {
    pub(crate) fn spawn(journal: Box<dyn Journal>) -> Self {
        let (queue, pending) = mpsc::unbounded_channel();
        thread::spawn(move || write_loop(journal, pending));
        Self { queue }
    }

    /// Queue `record`; the receiver resolves once it is durable or has failed
    ///
    /// Submission order is journal order.
    pub(crate) fn submit(
        &self,
        record: JournalRecord,
        publish: Publish,
    ) -> oneshot::Receiver<Result<(), StorageError>> {
        let (done, receiver) = oneshot::channel();
        let write = PendingWrite {
            record,
            publish,
            done,
        };
        if let Err(mpsc::error::SendError(write)) = self.queue.send(write) {
            (write.publish)(false);
            let _ = write
                .done
                .send(Err(StorageError::Unavailable("journal writer stopped".to_string())));
        }
        receiver
    }
}

/// Wait for a submitted record
pub(crate) async fn durable(
    receiver: oneshot::Receiver<Result<(), StorageError>>,
) -> Result<(), StorageError> {
    receiver
        .await
        .unwrap_or_else(|_| Err(StorageError::Unavailable("journal writer stopped".to_string())))
}

fn write_loop(mut journal: Box<dyn Journal>, mut pending: mpsc::UnboundedReceiver<PendingWrite>) {
    while let Some(first) = pending.blocking_recv() {
        let mut batch = vec![first];
        while batch.len() < MAX_GROUP_COMMIT {
            match pending.try_recv() {
                Ok(next) => batch.push(next),
                Err(_) => break,
            }
        }

        let records: Vec<JournalRecord> = batch.iter().map(|write| write.record.clone()).collect();
        let outcome = journal.append_batch(&records).map_err(|err| err.to_string());
        if let Err(reason) = &outcome {
            warn!(records = records.len(), error = %reason, "Journal write failed");
        }

        for write in batch {
            (write.publish)(outcome.is_ok());
            let answer = outcome
                .clone()
                .map_err(StorageError::Unavailable);
            // The submitter may have gone away; the record is settled either way
            let _ = write.done.send(answer);
        }
    }
}
