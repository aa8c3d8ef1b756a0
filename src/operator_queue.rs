use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("operator queue IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("operator queue serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A verified payment event that could not be applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEvent {
    pub event_id: String,
    pub event_type: String,
    pub reason: String,
    pub user_id: Option<String>,
    pub coins: Option<i64>,
    pub session_id: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub deliveries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct QueueData {
    events: BTreeMap<String, FailedEvent>,
}

/// Events waiting for manual follow-up
///
/// Keyed by provider event id, so redeliveries of the same event update one
/// record. With a path the queue is persisted after every change so nothing
/// is lost across restarts.
#[derive(Debug)]
pub struct OperatorQueue {
    path: Option<PathBuf>,
    data: QueueData,
}

impl OperatorQueue {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: QueueData::default(),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let path = path.into();
        let data = if path.exists() {
            let bytes = std::fs::read(&path)?;
            if bytes.is_empty() {
                QueueData::default()
            } else {
                serde_json::from_slice(&bytes)?
            }
        } else {
            QueueData::default()
        };

        Ok(Self {
            path: Some(path),
            data,
        })
    }

    pub async fn record(
        &mut self,
        event_id: &str,
        event_type: &str,
        reason: impl Into<String>,
        details: FailureDetails,
    ) -> Result<FailedEvent, QueueError> {
        let now = Utc::now();
        let reason = reason.into();

        let event = match self.data.events.get(event_id) {
            Some(previous) => FailedEvent {
                reason,
                last_seen_at: now,
                deliveries: previous.deliveries.saturating_add(1),
                ..previous.clone()
            },
            None => FailedEvent {
                event_id: event_id.to_string(),
                event_type: event_type.to_string(),
                reason,
                user_id: details.user_id,
                coins: details.coins,
                session_id: details.session_id,
                first_seen_at: now,
                last_seen_at: now,
                deliveries: 1,
            },
        };

        self.data
            .events
            .insert(event_id.to_string(), event.clone());
        self.persist().await?;
        Ok(event)
    }

    pub fn get(&self, event_id: &str) -> Option<&FailedEvent> {
        self.data.events.get(event_id)
    }

    pub fn list(&self) -> Vec<FailedEvent> {
        self.data.events.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.data.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.events.is_empty()
    }

    /// Replace the file atomically: write a sibling, sync it, rename it over
    async fn persist(&self) -> Result<(), QueueError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let bytes = serde_json::to_vec_pretty(&self.data)?;
        let tmp_path = path.with_extension("json.tmp");
        let mut tmp = fs::File::create(&tmp_path).await?;
        tmp.write_all(&bytes).await?;
        tmp.sync_all().await?;
        drop(tmp);

        fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

/// Whatever could be extracted from the event before it failed
#[derive(Debug, Clone, Default)]
pub struct FailureDetails {
    pub user_id: Option<String>,
    pub coins: Option<i64>,
    pub session_id: Option<String>,
}
