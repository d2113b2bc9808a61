//! Append-only JSONL journal store.
//!
//! Wraps [`InMemoryStore`] as the live index and journals every mutation to
//! a JSONL file, one event per line, fsync'd on append so records survive a
//! crash immediately after the write.  `load` replays the journal; corrupt
//! lines are skipped with a warning rather than poisoning the whole file.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keepsake_config::ThresholdConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::schema::{HumanDecision, Memory, ValidationState};
use crate::store::{BatchOutcome, InMemoryStore, MemoryStore, StoreError, UpsertOutcome};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JournalEvent {
    Upsert { memory: Box<Memory> },
    Replace { superseded: Vec<Uuid>, memory: Box<Memory> },
    Review { memory_id: Uuid, decision: HumanDecision },
    Thresholds { config: ThresholdConfig, version: u64 },
    Outcome { outcome: BatchOutcome },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalRecord {
    occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    event: JournalEvent,
}

/// JSONL-backed store: an in-memory index plus a durable journal.
pub struct JournalStore {
    index: InMemoryStore,
    file: Mutex<std::fs::File>,
    path: PathBuf,
}

impl JournalStore {
    /// Open (or create) the journal at `path` and replay it into the index.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let index = InMemoryStore::default();
        if path.exists() {
            replay(&path, &index).await?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        Ok(Self {
            index,
            file: Mutex::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> usize {
        self.index.len().await
    }

    async fn append(&self, event: JournalEvent) -> Result<(), StoreError> {
        let record = JournalRecord {
            occurred_at: Utc::now(),
            event,
        };
        let line = serde_json::to_string(&record)?;
        let mut file = self.file.lock().await;
        writeln!(file, "{line}")?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

async fn replay(path: &Path, index: &InMemoryStore) -> Result<(), StoreError> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut corrupt = 0usize;

    for (line_idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: JournalRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(err) => {
                corrupt += 1;
                tracing::warn!(
                    line = line_idx + 1,
                    error = %err,
                    path = %path.display(),
                    "corrupt journal line skipped"
                );
                continue;
            }
        };
        match record.event {
            JournalEvent::Upsert { memory } => {
                let _ = index.upsert(*memory).await?;
            }
            JournalEvent::Replace { superseded, memory } => {
                let _ = index.replace(&superseded, *memory).await?;
            }
            JournalEvent::Review { memory_id, decision } => {
                // A review on a record the journal no longer holds (e.g.
                // superseded later) is not an error on replay.
                let _ = index.apply_review(memory_id, decision).await;
            }
            JournalEvent::Thresholds { config, version } => {
                let (_, current) = index.read_thresholds().await?;
                if version == current + 1 {
                    let _ = index.write_thresholds(config, current).await?;
                }
            }
            JournalEvent::Outcome { outcome } => {
                index.record_batch_outcome(outcome).await?;
            }
        }
    }

    if corrupt > 0 {
        tracing::warn!(corrupt_lines = corrupt, path = %path.display(), "journal replayed with skipped lines");
    }
    Ok(())
}

#[async_trait]
impl MemoryStore for JournalStore {
    async fn find_by_hash(&self, hash: &[u8; 32]) -> Result<Option<Memory>, StoreError> {
        self.index.find_by_hash(hash).await
    }

    async fn find_candidates(
        &self,
        participant_ids: &BTreeSet<String>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<Memory>, StoreError> {
        self.index
            .find_candidates(participant_ids, window_start, window_end)
            .await
    }

    async fn upsert(&self, memory: Memory) -> Result<UpsertOutcome, StoreError> {
        let outcome = self.index.upsert(memory.clone()).await?;
        if matches!(outcome, UpsertOutcome::Inserted(_)) {
            self.append(JournalEvent::Upsert {
                memory: Box::new(memory),
            })
            .await?;
        }
        Ok(outcome)
    }

    async fn replace(&self, superseded: &[Uuid], memory: Memory) -> Result<Uuid, StoreError> {
        let id = self.index.replace(superseded, memory.clone()).await?;
        self.append(JournalEvent::Replace {
            superseded: superseded.to_vec(),
            memory: Box::new(memory),
        })
        .await?;
        Ok(id)
    }

    async fn record_batch_outcome(&self, outcome: BatchOutcome) -> Result<(), StoreError> {
        self.index.record_batch_outcome(outcome.clone()).await?;
        self.append(JournalEvent::Outcome { outcome }).await
    }

    async fn read_thresholds(&self) -> Result<(ThresholdConfig, u64), StoreError> {
        self.index.read_thresholds().await
    }

    async fn write_thresholds(
        &self,
        config: ThresholdConfig,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let version = self.index.write_thresholds(config, expected_version).await?;
        self.append(JournalEvent::Thresholds { config, version })
            .await?;
        Ok(version)
    }

    async fn next_for_review(&self, max_n: usize) -> Result<Vec<Memory>, StoreError> {
        self.index.next_for_review(max_n).await
    }

    async fn apply_review(
        &self,
        memory_id: Uuid,
        decision: HumanDecision,
    ) -> Result<(ValidationState, Memory), StoreError> {
        let result = self.index.apply_review(memory_id, decision).await?;
        self.append(JournalEvent::Review { memory_id, decision })
            .await?;
        Ok(result)
    }
}
