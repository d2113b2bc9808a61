//! End-to-end pipeline scenarios with a scripted LLM and the in-memory
//! store.  Timing-sensitive assertions run on the paused tokio clock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use keepsake_config::EngineConfig;
use keepsake_llm::{CallParams, LlmClient, RawResponse, TokenUsage, TransportError};
use keepsake_memory::{
    Batch, BatchStatus, HumanDecision, InMemoryStore, Message, MemoryStore, StaticMessageStore,
    ValidationState,
};
use keepsake_runtime::Pipeline;
use keepsake_runtime::batch::estimate_batch_tokens;
use uuid::Uuid;

// ─── scripted LLM ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Step {
    Reply(String),
    RateLimited,
    ServerError,
}

struct ScriptedLlm {
    steps: StdMutex<VecDeque<Step>>,
}

impl ScriptedLlm {
    fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: StdMutex::new(steps.into_iter().collect()),
        })
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn call(&self, _prompt: &str, params: &CallParams) -> Result<RawResponse, TransportError> {
        let step = self
            .steps
            .lock()
            .expect("script poisoned")
            .pop_front()
            .unwrap_or(Step::ServerError);
        match step {
            Step::Reply(content) => Ok(RawResponse {
                content,
                usage: TokenUsage {
                    tokens_in: 400,
                    tokens_out: 120,
                },
                model: params.model.clone(),
            }),
            Step::RateLimited => Err(TransportError::RateLimited { retry_after: None }),
            Step::ServerError => Err(TransportError::Server {
                status: 500,
                body: "scripted failure".to_string(),
            }),
        }
    }
}

// ─── fixtures ────────────────────────────────────────────────────────────────

/// Three messages between alice (`A`) and bob (`B`) within five minutes.
fn conversation(conversation_id: &str, prefix: &str) -> Vec<Message> {
    let start = Utc.with_ymd_and_hms(2026, 7, 30, 10, 0, 0).unwrap();
    let texts = [
        "I'm really sorry about yesterday, I was unfair to you",
        "Thank you for saying that, it means a lot to me",
        "I'm glad we talked it through, I feel much better now",
    ];
    texts
        .iter()
        .enumerate()
        .map(|(i, text)| Message {
            id: format!("{prefix}{i}"),
            conversation_id: conversation_id.to_string(),
            author_id: if i % 2 == 0 { "A" } else { "B" }.to_string(),
            timestamp: start + chrono::Duration::minutes(2 * i as i64),
            text: (*text).to_string(),
        })
        .collect()
}

/// A well-formed extraction reply grounded in the given message ids.
fn extraction_reply(
    ids: &[&str],
    summary: &str,
    mood: &str,
    themes: &[&str],
    confidence: f64,
) -> String {
    let sources = ids
        .iter()
        .map(|id| format!("\"{id}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let themes = themes
        .iter()
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let valence = if mood == "negative" { -0.6 } else { 0.6 };
    format!(
        r#"{{
        "memories": [{{
            "summary": "{summary}",
            "source_message_ids": [{sources}],
            "participants": [
                {{"id": "A", "display_name": "Alice", "role": "friend"}},
                {{"id": "B", "display_name": "Bob", "role": "friend"}}
            ],
            "emotional_context": {{
                "primary_mood": "{mood}",
                "intensity": 7,
                "valence": {valence},
                "themes": [{themes}]
            }},
            "relationship_dynamics": {{
                "closeness": 7, "tension": 3, "supportiveness": 8,
                "interaction_quality": "positive", "connection_strength": 0.8
            }},
            "mood_score": {{"score": 7.2, "confidence": 0.8, "descriptors": ["warm"],
                "factors": [{{"kind": "sentiment", "weight": 0.6, "evidence": ["warm words"]}}]}},
            "evidence": [{{"source_message_id": "{first}", "excerpt": "I'm really sorry", "relevance": 0.9}}],
            "confidence": {confidence}
        }}]
    }}"#,
        first = ids[0],
    )
}

/// The three-message conversation reply used by most scenarios.
fn memory_reply(id_prefix: &str, summary: &str, confidence: f64) -> String {
    let ids = [
        format!("{id_prefix}0"),
        format!("{id_prefix}1"),
        format!("{id_prefix}2"),
    ];
    let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
    extraction_reply(
        &ids,
        summary,
        "positive",
        &["apology", "reconciliation"],
        confidence,
    )
}

/// Hand-built batch that bypasses `BatchBuilder`, sized by raw text volume.
fn bulky_batch(chars_per_message: usize, count: usize) -> Batch {
    let start = Utc.with_ymd_and_hms(2026, 7, 30, 10, 0, 0).unwrap();
    let messages: Vec<Message> = (0..count)
        .map(|i| Message {
            id: format!("m{i}"),
            conversation_id: "bulk".to_string(),
            author_id: if i % 2 == 0 { "A" } else { "B" }.to_string(),
            timestamp: start + chrono::Duration::minutes(i as i64),
            text: "word ".repeat(chars_per_message / 5),
        })
        .collect();
    Batch {
        id: Uuid::new_v4(),
        conversation_id: "bulk".to_string(),
        window_start: messages[0].timestamp,
        window_end: messages[count - 1].timestamp,
        estimated_cost_tokens: estimate_batch_tokens(&messages),
        priority_score: 0.0,
        messages,
    }
}

fn single_worker_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.worker_count = 1;
    config.retry.jitter_fraction = 0.0;
    config
}

async fn start_pipeline(
    config: EngineConfig,
    llm: Arc<ScriptedLlm>,
    messages: Vec<Message>,
    store: Arc<InMemoryStore>,
) -> Pipeline {
    let message_store = Arc::new(StaticMessageStore::new(messages));
    Pipeline::start(config, llm, message_store, store)
        .await
        .expect("pipeline start")
}

// ─── scenarios ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn happy_path_extracts_and_auto_approves() {
    let llm = ScriptedLlm::new([Step::Reply(memory_reply(
        "m",
        "Alice apologized warmly to Bob and they reconciled",
        0.82,
    ))]);
    let store = Arc::new(InMemoryStore::default());
    let pipeline = start_pipeline(single_worker_config(), llm, conversation("conv", "m"), store.clone()).await;

    assert_eq!(pipeline.enqueue_conversation("conv").await.unwrap(), 1);
    let snapshot = pipeline.join().await;

    assert_eq!(snapshot.memories_extracted, 1);
    assert_eq!(snapshot.auto_approved, 1);
    assert_eq!(snapshot.needs_review, 0);
    assert_eq!(snapshot.auto_rejected, 0);
    assert_eq!(snapshot.batches_completed, 1);
    assert_eq!(snapshot.batches_failed, 0);

    let persisted = store.all().await;
    assert_eq!(persisted.len(), 1);
    let memory = &persisted[0];
    assert_eq!(memory.validation, ValidationState::AutoApproved);
    assert!(memory.confidence >= 0.75, "confidence = {}", memory.confidence);
    assert_eq!(memory.source_message_ids, vec!["m0", "m1", "m2"]);
    // Evidence links stay inside the memory's own sources.
    assert!(
        memory
            .evidence
            .iter()
            .all(|e| memory.source_message_ids.contains(&e.source_message_id))
    );
}

#[tokio::test(start_paused = true)]
async fn duplicate_submission_persists_once() {
    let reply = memory_reply("m", "Alice apologized warmly to Bob and they reconciled", 0.82);
    let llm = ScriptedLlm::new([Step::Reply(reply.clone()), Step::Reply(reply)]);
    let store = Arc::new(InMemoryStore::default());
    let pipeline = start_pipeline(single_worker_config(), llm, conversation("conv", "m"), store.clone()).await;

    pipeline.enqueue_conversation("conv").await.unwrap();
    pipeline.enqueue_conversation("conv").await.unwrap();
    let snapshot = pipeline.join().await;

    assert_eq!(snapshot.memories_extracted, 2);
    assert_eq!(store.len().await, 1, "identical content hash must persist once");
}

#[tokio::test(start_paused = true)]
async fn rate_limit_retries_with_backoff_then_succeeds() {
    let mut config = single_worker_config();
    config.rate.requests_per_second = 10.0;

    let llm = ScriptedLlm::new([
        Step::RateLimited,
        Step::RateLimited,
        Step::Reply(memory_reply(
            "m",
            "Alice apologized warmly to Bob and they reconciled",
            0.82,
        )),
    ]);
    let store = Arc::new(InMemoryStore::default());
    let pipeline = start_pipeline(config, llm, conversation("conv", "m"), store.clone()).await;

    let started = tokio::time::Instant::now();
    pipeline.enqueue_conversation("conv").await.unwrap();
    let snapshot = pipeline.join().await;
    let elapsed = started.elapsed();

    // Base-1s exponential backoff: 1s after the first 429, 2s after the second.
    assert!(elapsed >= Duration::from_secs(3), "elapsed = {elapsed:?}");
    assert_eq!(snapshot.requests, 3);
    assert_eq!(snapshot.memories_extracted, 1);
    assert_eq!(store.len().await, 1);
    assert_eq!(snapshot.batches_failed, 0);
}

#[tokio::test(start_paused = true)]
async fn budget_exceeded_is_fatal_and_stops_intake() {
    let mut config = single_worker_config();
    config.budget.max_usd = Some(0.01);
    // ~400 estimated tokens at this price ≈ 0.02 USD per call.
    config.budget.usd_per_1k_tokens = 0.05;

    let llm = ScriptedLlm::new([Step::Reply(memory_reply(
        "m",
        "Alice apologized warmly to Bob and they reconciled",
        0.82,
    ))]);
    let store = Arc::new(InMemoryStore::default());
    let pipeline = start_pipeline(config, llm, conversation("conv", "m"), store.clone()).await;

    pipeline.enqueue_conversation("conv").await.unwrap();

    // Wait for the batch outcome to land.
    let outcome = loop {
        let outcomes = store.batch_outcomes().await;
        if let Some(outcome) = outcomes.first() {
            break outcome.clone();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(outcome.status, BatchStatus::Failed);
    assert_eq!(outcome.error_class.as_deref(), Some("BudgetExceeded"));

    // Intake is closed once the fatal error lands.
    let refused = loop {
        match pipeline.enqueue_conversation("conv").await {
            Err(_) => break true,
            Ok(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    };
    assert!(refused);

    let snapshot = pipeline.join().await;
    assert_eq!(snapshot.memories_extracted, 0);
    assert_eq!(snapshot.requests, 0, "no LLM call may happen past the budget");
    assert!(store.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn prose_wrapped_json_parses_and_pure_prose_fails_batch() {
    // Conversation "good" answers with JSON wrapped in prose; conversation
    // "bad" never produces JSON and exhausts the two tightened re-requests.
    let good_reply = format!(
        "Here is the memory you asked for: {} I hope this helps!",
        memory_reply("g", "Alice apologized warmly to Bob and they reconciled", 0.82)
    );
    let prose = "There was an apology and everyone felt better.".to_string();
    let llm = ScriptedLlm::new([
        Step::Reply(prose.clone()),
        Step::Reply(prose.clone()),
        Step::Reply(prose),
        Step::Reply(good_reply),
    ]);

    let store = Arc::new(InMemoryStore::default());
    let mut messages = conversation("bad", "b");
    messages.extend(conversation("good", "g"));
    let pipeline = start_pipeline(single_worker_config(), llm, messages, store.clone()).await;

    pipeline.enqueue_conversation("bad").await.unwrap();
    pipeline.enqueue_conversation("good").await.unwrap();
    let snapshot = pipeline.join().await;

    // The failed batch never poisons the next one.
    assert_eq!(snapshot.batches_failed, 1);
    assert_eq!(snapshot.batches_completed, 1);
    assert_eq!(snapshot.memories_extracted, 1);
    assert_eq!(store.len().await, 1);

    let outcomes = store.batch_outcomes().await;
    assert!(
        outcomes
            .iter()
            .any(|o| o.error_class.as_deref() == Some("ParseFail"))
    );
}

#[tokio::test(start_paused = true)]
async fn near_duplicate_memories_merge_with_origins() {
    let llm = ScriptedLlm::new([
        Step::Reply(memory_reply("m", "Alice apologized warmly to Bob", 0.82)),
        Step::Reply(memory_reply("n", "Alice offered a warm apology to Bob", 0.82)),
    ]);
    let store = Arc::new(InMemoryStore::default());
    let mut messages = conversation("first", "m");
    messages.extend(conversation("second", "n"));
    let pipeline = start_pipeline(single_worker_config(), llm, messages, store.clone()).await;

    pipeline.enqueue_conversation("first").await.unwrap();
    pipeline.enqueue_conversation("second").await.unwrap();
    let snapshot = pipeline.join().await;

    assert_eq!(snapshot.memories_extracted, 2);
    let persisted = store.all().await;
    assert_eq!(persisted.len(), 1, "near-duplicates must merge into one record");
    let merged = &persisted[0];
    assert_eq!(merged.metadata.merged_from.len(), 2);
    // Sources from both extractions survive the merge.
    assert!(merged.source_message_ids.iter().any(|id| id.starts_with('m')));
    assert!(merged.source_message_ids.iter().any(|id| id.starts_with('n')));
}

#[tokio::test(start_paused = true)]
async fn oversize_batch_splits_once_and_processes_both_halves() {
    // 12 messages of ~1000 tokens each: the whole batch breaks the 8000-token
    // request budget, but each half fits, so one split must recover it.
    let batch = bulky_batch(4000, 12);
    assert!(batch.estimated_cost_tokens > 8000, "fixture must be oversize");

    // The split cuts on the speaker change nearest the midpoint: m0..m5 and
    // m6..m11.  One reply per sub-batch, dissimilar enough not to merge.
    let llm = ScriptedLlm::new([
        Step::Reply(extraction_reply(
            &["m0", "m1"],
            "Alice apologized warmly to Bob after the long silence",
            "positive",
            &["apology", "reconciliation"],
            0.82,
        )),
        Step::Reply(extraction_reply(
            &["m6", "m7"],
            "Bob admitted he was hurt and angry about the cancelled plans",
            "negative",
            &["conflict", "disappointment"],
            0.82,
        )),
    ]);
    let store = Arc::new(InMemoryStore::default());
    let pipeline = start_pipeline(single_worker_config(), llm, Vec::new(), store.clone()).await;

    pipeline.enqueue_batch(batch).await.unwrap();
    let snapshot = pipeline.join().await;

    // One batch outcome, two LLM calls, two memories.
    assert_eq!(snapshot.batches_completed, 1);
    assert_eq!(snapshot.batches_failed, 0);
    assert_eq!(snapshot.requests, 2);
    assert_eq!(snapshot.memories_extracted, 2);
    assert_eq!(store.len().await, 2);

    let outcomes = store.batch_outcomes().await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, BatchStatus::Completed);
    assert_eq!(outcomes[0].memories_extracted, 2);
}

#[tokio::test(start_paused = true)]
async fn oversize_batch_gives_up_after_one_split() {
    // Each half is still over budget after the single permitted split, so
    // the batch fails as Oversize without ever reaching the LLM, and the
    // pipeline keeps serving later work.
    let batch = bulky_batch(8000, 12);

    let llm = ScriptedLlm::new([Step::Reply(memory_reply(
        "m",
        "Alice apologized warmly to Bob and they reconciled",
        0.82,
    ))]);
    let store = Arc::new(InMemoryStore::default());
    let pipeline =
        start_pipeline(single_worker_config(), llm, conversation("conv", "m"), store.clone()).await;

    pipeline.enqueue_batch(batch).await.unwrap();
    let failed = loop {
        let outcomes = store.batch_outcomes().await;
        if let Some(outcome) = outcomes.iter().find(|o| o.status == BatchStatus::Failed) {
            break outcome.clone();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(failed.error_class.as_deref(), Some("Oversize"));
    assert_eq!(pipeline.status().requests, 0, "give-up must spend nothing");

    pipeline.enqueue_conversation("conv").await.unwrap();
    let snapshot = pipeline.join().await;

    assert_eq!(snapshot.batches_failed, 1);
    assert_eq!(snapshot.batches_completed, 1);
    assert_eq!(snapshot.memories_extracted, 1);
    assert_eq!(snapshot.requests, 1);
    assert_eq!(store.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn zero_rate_cancellation_returns_promptly() {
    let mut config = single_worker_config();
    config.rate.requests_per_second = 0.0;

    let llm = ScriptedLlm::new([Step::Reply(memory_reply(
        "m",
        "Alice apologized warmly to Bob and they reconciled",
        0.82,
    ))]);
    let store = Arc::new(InMemoryStore::default());
    let pipeline = start_pipeline(config, llm, conversation("conv", "m"), store.clone()).await;

    pipeline.enqueue_conversation("conv").await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    pipeline.cancel();
    let snapshot = pipeline.join().await;

    assert_eq!(snapshot.requests, 0, "0 rps must let no request through");
    assert!(store.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn empty_conversation_makes_no_batches_and_no_calls() {
    let llm = ScriptedLlm::new([]);
    let store = Arc::new(InMemoryStore::default());
    let pipeline = start_pipeline(single_worker_config(), llm, Vec::new(), store.clone()).await;

    assert_eq!(pipeline.enqueue_conversation("missing").await.unwrap(), 0);
    let snapshot = pipeline.join().await;
    assert_eq!(snapshot.requests, 0);
    assert_eq!(snapshot.memories_extracted, 0);
    assert!(store.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn review_feedback_adjusts_thresholds() {
    // A mid-confidence extraction lands in needs-review.
    let llm = ScriptedLlm::new([Step::Reply(memory_reply(
        "m",
        "A short uncertain impression of the talk",
        0.1,
    ))]);
    let store = Arc::new(InMemoryStore::default());
    let pipeline = start_pipeline(single_worker_config(), llm, conversation("conv", "m"), store.clone()).await;

    pipeline.enqueue_conversation("conv").await.unwrap();

    let queued = loop {
        let queue = pipeline.next_for_review(10).await.unwrap();
        if !queue.is_empty() {
            break queue;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].validation, ValidationState::NeedsReview);

    // A human approval of a review item is a false negative: the
    // auto-approve threshold steps down and persists through the CAS write.
    pipeline
        .submit_feedback(vec![(queued[0].id, HumanDecision::Approve)])
        .await
        .unwrap();

    let (thresholds, version) = store.read_thresholds().await.unwrap();
    assert!(version >= 1);
    assert!((thresholds.auto_approve - 0.74).abs() < 1e-9);

    let updated = store.all().await;
    assert_eq!(updated[0].validation, ValidationState::HumanApproved);

    let snapshot = pipeline.join().await;
    assert_eq!(snapshot.needs_review, 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_review_id_is_an_error() {
    let llm = ScriptedLlm::new([]);
    let store = Arc::new(InMemoryStore::default());
    let pipeline = start_pipeline(single_worker_config(), llm, Vec::new(), store).await;

    let result = pipeline
        .submit_feedback(vec![(Uuid::new_v4(), HumanDecision::Reject)])
        .await;
    assert!(result.is_err());
    pipeline.join().await;
}
