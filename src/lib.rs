pub mod engine;
pub mod error;
pub mod history;
pub mod models;
pub mod operator_queue;
pub mod persistence;
pub mod reconciler;
pub mod service;
pub mod store;

use std::io::{Read, Write};
use std::path::Path;

use serde::Serialize;
use tracing::warn;

use engine::{CoinEngine, EngineConfig};
use error::Result;
use models::MutationRow;
use persistence::FileJournal;
use store::ConsistencyReport;

/// Apply mutations from a CSV reader through the engine and write the
/// resulting balances to a CSV writer
///
/// Rows that fail to parse or are rejected by the engine are logged and
/// skipped; storage faults abort the run.
pub async fn process_mutations<R: Read, W: Write>(
    engine: &CoinEngine,
    reader: R,
    writer: W,
) -> Result<()> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    for (idx, result) in csv_reader.deserialize::<MutationRow>().enumerate() {
        let row = match result {
            Ok(row) => row,
            Err(err) => {
                warn!(row = idx + 1, error = %err, "Skipping malformed mutation row");
                continue;
            }
        };

        let direction = row.direction;
        if let Err(err) = engine.post(direction, row.into()).await {
            if err.is_retryable() {
                return Err(err.into());
            }
            warn!(row = idx + 1, error = %err, "Mutation rejected");
        }
    }

    write_balances(engine, writer)?;

    Ok(())
}

#[derive(Serialize)]
struct BalanceRow<'a> {
    user: &'a str,
    balance: i64,
    entries: usize,
}

/// Write every account balance to CSV, sorted by user id
fn write_balances<W: Write>(engine: &CoinEngine, writer: W) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    let store = engine.store();

    for user_id in store.user_ids() {
        let Some(account) = store.read(&user_id) else {
            continue;
        };
        csv_writer.serialize(BalanceRow {
            user: &user_id,
            balance: account.balance,
            entries: store.count_by_user(&user_id),
        })?;
    }

    csv_writer.flush()?;
    Ok(())
}

/// Replay a journal file and compare every balance with its ledger
pub fn verify_journal(path: &Path) -> Result<Vec<ConsistencyReport>> {
    let engine = CoinEngine::recover(Box::new(FileJournal::open(path)?), EngineConfig::default())?;
    let store = engine.store();

    Ok(store
        .user_ids()
        .iter()
        .filter_map(|user_id| store.check_consistency(user_id))
        .collect())
}
