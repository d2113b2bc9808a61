//! Persistence and message-store interfaces, plus the in-memory reference
//! implementation used by tests and embedders.
//!
//! Every operation is concurrency-safe.  `upsert` is atomic per content
//! hash: a second memory with an existing hash is reported as `Merged`
//! without insertion.  Threshold writes are compare-and-swap on a version
//! counter.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keepsake_config::ThresholdConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::confirm::apply_feedback;
use crate::schema::{HumanDecision, Memory, Message, ValidationState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("threshold version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },
    #[error("invalid operation: {0}")]
    Invalid(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

// ─── message store (consumed) ────────────────────────────────────────────────

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Messages of one conversation, ordered by timestamp ascending.
    async fn list_messages(
        &self,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, StoreError>;
}

/// Fixed in-process message store.
#[derive(Debug, Default)]
pub struct StaticMessageStore {
    conversations: HashMap<String, Vec<Message>>,
}

impl StaticMessageStore {
    pub fn new(messages: impl IntoIterator<Item = Message>) -> Self {
        let mut conversations: HashMap<String, Vec<Message>> = HashMap::new();
        for message in messages {
            conversations
                .entry(message.conversation_id.clone())
                .or_default()
                .push(message);
        }
        for list in conversations.values_mut() {
            list.sort_by_key(|m| m.timestamp);
        }
        Self { conversations }
    }
}

#[async_trait]
impl MessageStore for StaticMessageStore {
    async fn list_messages(
        &self,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, StoreError> {
        let messages = self
            .conversations
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        Ok(messages
            .into_iter()
            .filter(|m| since.is_none_or(|s| m.timestamp >= s))
            .filter(|m| until.is_none_or(|u| m.timestamp <= u))
            .collect())
    }
}

// ─── memory store (consumed) ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Completed,
    Failed,
}

/// Outcome record written for every processed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub error_class: Option<String>,
    pub memories_extracted: usize,
    pub spent_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(Uuid),
    Merged(Uuid),
}

impl UpsertOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Merged(id) => *id,
        }
    }
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn find_by_hash(&self, hash: &[u8; 32]) -> Result<Option<Memory>, StoreError>;

    /// Candidates sharing at least one participant inside the time window.
    async fn find_candidates(
        &self,
        participant_ids: &BTreeSet<String>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<Memory>, StoreError>;

    /// Atomic per content hash: when a memory with the same hash already
    /// exists, returns `Merged(existing_id)` without inserting.
    async fn upsert(&self, memory: Memory) -> Result<UpsertOutcome, StoreError>;

    /// Commit a merge: retire the superseded records and insert the merged
    /// memory in one atomic step.  Returns the surviving id.
    async fn replace(&self, superseded: &[Uuid], memory: Memory) -> Result<Uuid, StoreError>;

    async fn record_batch_outcome(&self, outcome: BatchOutcome) -> Result<(), StoreError>;

    async fn read_thresholds(&self) -> Result<(ThresholdConfig, u64), StoreError>;

    /// Compare-and-swap threshold write; returns the new version.
    async fn write_thresholds(
        &self,
        config: ThresholdConfig,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    /// Needs-review memories ordered by validation priority descending.
    async fn next_for_review(&self, max_n: usize) -> Result<Vec<Memory>, StoreError>;

    /// Apply a human verdict; returns the state before and the updated
    /// memory.  Overrides of auto decisions are accepted (they feed the
    /// adaptive thresholds).
    async fn apply_review(
        &self,
        memory_id: Uuid,
        decision: HumanDecision,
    ) -> Result<(ValidationState, Memory), StoreError>;
}

// ─── in-memory reference implementation ──────────────────────────────────────

#[derive(Debug, Default)]
struct StoreInner {
    by_hash: HashMap<[u8; 32], Memory>,
    id_to_hash: HashMap<Uuid, [u8; 32]>,
    outcomes: Vec<BatchOutcome>,
    thresholds: ThresholdConfig,
    thresholds_version: u64,
}

/// Map-backed store.  A single mutex over the whole state gives every trait
/// operation the required atomicity, including per-hash upsert exclusion.
#[derive(Debug)]
pub struct InMemoryStore {
    inner: Mutex<StoreInner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(ThresholdConfig::default())
    }
}

impl InMemoryStore {
    pub fn new(thresholds: ThresholdConfig) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                thresholds,
                ..StoreInner::default()
            }),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.by_hash.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn all(&self) -> Vec<Memory> {
        self.inner.lock().await.by_hash.values().cloned().collect()
    }

    pub async fn batch_outcomes(&self) -> Vec<BatchOutcome> {
        self.inner.lock().await.outcomes.clone()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn find_by_hash(&self, hash: &[u8; 32]) -> Result<Option<Memory>, StoreError> {
        Ok(self.inner.lock().await.by_hash.get(hash).cloned())
    }

    async fn find_candidates(
        &self,
        participant_ids: &BTreeSet<String>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<Memory>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .by_hash
            .values()
            .filter(|m| m.extracted_at >= window_start && m.extracted_at <= window_end)
            .filter(|m| m.participants.iter().any(|p| participant_ids.contains(&p.id)))
            .cloned()
            .collect())
    }

    async fn upsert(&self, memory: Memory) -> Result<UpsertOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.by_hash.get(&memory.content_hash) {
            return Ok(UpsertOutcome::Merged(existing.id));
        }
        let id = memory.id;
        inner.id_to_hash.insert(id, memory.content_hash);
        inner.by_hash.insert(memory.content_hash, memory);
        Ok(UpsertOutcome::Inserted(id))
    }

    async fn replace(&self, superseded: &[Uuid], memory: Memory) -> Result<Uuid, StoreError> {
        let mut inner = self.inner.lock().await;
        for id in superseded {
            if let Some(hash) = inner.id_to_hash.remove(id) {
                inner.by_hash.remove(&hash);
            }
        }
        if let Some(existing) = inner.by_hash.get(&memory.content_hash) {
            return Ok(existing.id);
        }
        let id = memory.id;
        inner.id_to_hash.insert(id, memory.content_hash);
        inner.by_hash.insert(memory.content_hash, memory);
        Ok(id)
    }

    async fn record_batch_outcome(&self, outcome: BatchOutcome) -> Result<(), StoreError> {
        self.inner.lock().await.outcomes.push(outcome);
        Ok(())
    }

    async fn read_thresholds(&self) -> Result<(ThresholdConfig, u64), StoreError> {
        let inner = self.inner.lock().await;
        Ok((inner.thresholds, inner.thresholds_version))
    }

    async fn write_thresholds(
        &self,
        config: ThresholdConfig,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.thresholds_version != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                actual: inner.thresholds_version,
            });
        }
        if !config.is_valid() {
            return Err(StoreError::Invalid(
                "threshold ordering invariant violated".to_string(),
            ));
        }
        inner.thresholds = config;
        inner.thresholds_version += 1;
        Ok(inner.thresholds_version)
    }

    async fn next_for_review(&self, max_n: usize) -> Result<Vec<Memory>, StoreError> {
        let inner = self.inner.lock().await;
        let mut pending: Vec<Memory> = inner
            .by_hash
            .values()
            .filter(|m| m.validation == ValidationState::NeedsReview)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.significance
                .validation_priority
                .total_cmp(&a.significance.validation_priority)
        });
        pending.truncate(max_n);
        Ok(pending)
    }

    async fn apply_review(
        &self,
        memory_id: Uuid,
        decision: HumanDecision,
    ) -> Result<(ValidationState, Memory), StoreError> {
        let mut inner = self.inner.lock().await;
        let hash = *inner
            .id_to_hash
            .get(&memory_id)
            .ok_or_else(|| StoreError::NotFound(format!("memory {memory_id}")))?;
        let memory = inner
            .by_hash
            .get_mut(&hash)
            .ok_or_else(|| StoreError::NotFound(format!("memory {memory_id}")))?;

        let original = memory.validation;
        let next = apply_feedback(original, decision)
            .map_err(|err| StoreError::Invalid(err.to_string()))?;
        memory.validation = next;
        Ok((original, memory.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sample_memory;

    #[tokio::test]
    async fn upsert_is_atomic_per_hash() {
        let store = InMemoryStore::default();
        let memory = sample_memory("the same exact memory", &["A"], 0.8);

        let first = store.upsert(memory.clone()).await.unwrap();
        let mut resubmitted = memory.clone();
        resubmitted.id = Uuid::new_v4();
        let second = store.upsert(resubmitted).await.unwrap();

        assert!(matches!(first, UpsertOutcome::Inserted(_)));
        assert_eq!(second, UpsertOutcome::Merged(first.id()));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn candidates_filter_by_participant_and_window() {
        let store = InMemoryStore::default();
        let memory = sample_memory("a chat between alice and bob", &["A", "B"], 0.8);
        let at = memory.extracted_at;
        store.upsert(memory).await.unwrap();

        let overlapping: BTreeSet<String> = ["B".to_string(), "C".to_string()].into();
        let hits = store
            .find_candidates(&overlapping, at - chrono::Duration::hours(1), at + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let disjoint: BTreeSet<String> = ["Z".to_string()].into();
        let misses = store
            .find_candidates(&disjoint, at - chrono::Duration::hours(1), at + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(misses.is_empty());

        let stale = store
            .find_candidates(&overlapping, at + chrono::Duration::hours(2), at + chrono::Duration::hours(3))
            .await
            .unwrap();
        assert!(stale.is_empty());
    }

    #[tokio::test]
    async fn replace_retires_superseded_records() {
        let store = InMemoryStore::default();
        let first = sample_memory("version one of this memory", &["A"], 0.8);
        let second = sample_memory("a different second memory", &["A"], 0.8);
        store.upsert(first.clone()).await.unwrap();
        store.upsert(second.clone()).await.unwrap();

        let merged = sample_memory("the merged survivor memory", &["A"], 0.8);
        let survivor = store
            .replace(&[first.id, second.id], merged.clone())
            .await
            .unwrap();
        assert_eq!(survivor, merged.id);
        assert_eq!(store.len().await, 1);
        assert!(store.find_by_hash(&first.content_hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn threshold_cas_rejects_stale_version() {
        let store = InMemoryStore::default();
        let (config, version) = store.read_thresholds().await.unwrap();
        let next = store.write_thresholds(config, version).await.unwrap();
        assert_eq!(next, version + 1);

        let stale = store.write_thresholds(config, version).await;
        assert!(matches!(stale, Err(StoreError::VersionConflict { .. })));
    }

    #[tokio::test]
    async fn review_queue_orders_by_priority() {
        let store = InMemoryStore::default();
        let mut low = sample_memory("low priority review item", &["A"], 0.5);
        low.validation = ValidationState::NeedsReview;
        low.significance.validation_priority = 2.0;
        let mut high = sample_memory("high priority review item", &["A"], 0.5);
        high.validation = ValidationState::NeedsReview;
        high.significance.validation_priority = 8.0;
        store.upsert(low).await.unwrap();
        store.upsert(high.clone()).await.unwrap();

        let queue = store.next_for_review(10).await.unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].id, high.id);
    }

    #[tokio::test]
    async fn apply_review_returns_original_state() {
        let store = InMemoryStore::default();
        let mut memory = sample_memory("awaiting a human verdict", &["A"], 0.5);
        memory.validation = ValidationState::NeedsReview;
        store.upsert(memory.clone()).await.unwrap();

        let (original, updated) = store
            .apply_review(memory.id, HumanDecision::Approve)
            .await
            .unwrap();
        assert_eq!(original, ValidationState::NeedsReview);
        assert_eq!(updated.validation, ValidationState::HumanApproved);
    }

    #[tokio::test]
    async fn message_store_filters_by_time() {
        use crate::testutil::sample_messages;
        let messages = sample_messages("conv", &["A", "B", "A"]);
        let cutoff = messages[1].timestamp;
        let store = StaticMessageStore::new(messages.clone());

        let all = store.list_messages("conv", None, None).await.unwrap();
        assert_eq!(all.len(), 3);

        let late = store.list_messages("conv", Some(cutoff), None).await.unwrap();
        assert_eq!(late.len(), 2);

        let none = store.list_messages("other", None, None).await.unwrap();
        assert!(none.is_empty());
    }
}
