//! Pipeline orchestrator: bounded batch queue, worker pool, cancellation,
//! and the per-batch stage chain.
//!
//! Worker straight line: dequeue → rate-limit acquire → cost reserve → LLM
//! call (with retry) → parse → per-memory confidence / significance /
//! routing / dedup / persist → cost commit → progress events.  Per-memory
//! failures never fail a batch; per-batch failures never stop the pipeline;
//! budget and auth failures stop intake while in-flight work drains.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Duration as ChronoDuration;
use keepsake_config::EngineConfig;
use keepsake_llm::{CallParams, LlmClient, RawResponse};
use keepsake_memory::{
    AdaptiveThresholds, Batch, BatchOutcome, BatchStatus, HumanDecision, Memory, MemoryStore,
    MessageStore, ValidationState, confidence, confirm, dedup, significance,
};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::{BatchBuilder, split_batch};
use crate::error::EngineError;
use crate::limiter::{CostLedger, RateLimiter};
use crate::parser::{ParseResult, parse_response};
use crate::progress::{ProgressCounters, ProgressEvent, ProgressSnapshot};
use crate::prompt_builder::{TIGHTEN_SUFFIX, build_extraction_prompt};
use crate::retry::{RetryController, RetryDecision};

/// Queue depth multiplier over the worker count.
const QUEUE_DEPTH_PER_WORKER: usize = 4;
/// Progress is logged every this many processed batches.
const PROGRESS_LOG_EVERY: u64 = 10;

struct Shared {
    config: EngineConfig,
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn MemoryStore>,
    limiter: RateLimiter,
    ledger: CostLedger,
    counters: ProgressCounters,
    retry: RetryController,
    thresholds: Mutex<AdaptiveThresholds>,
    /// Set on budget/auth failure: intake closes, in-flight work drains.
    fatal: AtomicBool,
}

/// Running extraction pipeline.
pub struct Pipeline {
    shared: Arc<Shared>,
    messages: Arc<dyn MessageStore>,
    builder: BatchBuilder,
    batch_tx: std::sync::Mutex<Option<mpsc::Sender<Batch>>>,
    cancel_tx: watch::Sender<bool>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    drain: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Spin up the worker pool and progress drain.
    pub async fn start(
        config: EngineConfig,
        llm: Arc<dyn LlmClient>,
        messages: Arc<dyn MessageStore>,
        store: Arc<dyn MemoryStore>,
    ) -> Result<Self, EngineError> {
        let worker_count = config.effective_worker_count();

        // The store's thresholds win once they have ever been written;
        // otherwise the configured defaults seed the learner.
        let (stored, version) = store.read_thresholds().await?;
        let thresholds = if version > 0 { stored } else { config.thresholds };

        let shared = Arc::new(Shared {
            limiter: RateLimiter::new(config.rate.requests_per_second, config.rate.request_burst),
            ledger: CostLedger::new(config.budget.max_usd),
            counters: ProgressCounters::default(),
            retry: RetryController::new(config.retry),
            thresholds: Mutex::new(AdaptiveThresholds::new(thresholds)),
            fatal: AtomicBool::new(false),
            config,
            llm,
            store,
        });

        let (batch_tx, batch_rx) = mpsc::channel::<Batch>(worker_count * QUEUE_DEPTH_PER_WORKER);
        let batch_rx = Arc::new(Mutex::new(batch_rx));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::unbounded_channel::<ProgressEvent>();

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            workers.push(tokio::spawn(run_worker(
                shared.clone(),
                batch_rx.clone(),
                cancel_rx.clone(),
                event_tx.clone(),
                worker_id,
            )));
        }
        drop(event_tx);

        let drain = tokio::spawn(drain_events(shared.clone(), event_rx));

        info!(workers = worker_count, "pipeline started");
        Ok(Self {
            builder: BatchBuilder::new(shared.config.batch.clone()),
            shared,
            messages,
            batch_tx: std::sync::Mutex::new(Some(batch_tx)),
            cancel_tx,
            workers: std::sync::Mutex::new(workers),
            drain: std::sync::Mutex::new(Some(drain)),
        })
    }

    /// Batch a conversation and enqueue the result.  Returns how many
    /// batches were queued.
    pub async fn enqueue_conversation(&self, conversation_id: &str) -> Result<usize, EngineError> {
        if self.shared.fatal.load(Ordering::SeqCst) {
            return Err(EngineError::Cancelled);
        }
        let messages = self
            .messages
            .list_messages(conversation_id, None, None)
            .await?;
        let batches = self.builder.build(&messages);
        let count = batches.len();

        for batch in batches {
            self.enqueue_batch(batch).await?;
        }
        debug!(conversation_id, batches = count, "conversation enqueued");
        Ok(count)
    }

    /// Enqueue one pre-built batch.  Embedders that run their own batching
    /// feed the pipeline through here; intake refuses once a fatal error
    /// has landed or `cancel` has closed the queue.
    pub async fn enqueue_batch(&self, batch: Batch) -> Result<(), EngineError> {
        if self.shared.fatal.load(Ordering::SeqCst) {
            return Err(EngineError::Cancelled);
        }
        let sender = {
            // Poisoned locks recover their guard: a panicking holder leaves
            // these coordination mutexes in a usable state.
            let guard = self.batch_tx.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        let Some(sender) = sender else {
            return Err(EngineError::Cancelled);
        };
        if sender.send(batch).await.is_err() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    /// Current progress snapshot.
    pub fn status(&self) -> ProgressSnapshot {
        self.shared.counters.snapshot(&self.shared.ledger.stats())
    }

    /// Graceful stop: close intake and signal cancellation.  In-flight
    /// requests observe the signal at their next suspension point.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
        self.batch_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Close intake, wait for queued work to drain, and return the final
    /// snapshot.
    pub async fn join(self) -> ProgressSnapshot {
        self.batch_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let workers: Vec<_> = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.await;
        }
        let drain = self.drain.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(drain) = drain {
            let _ = drain.await;
        }
        self.shared.counters.snapshot(&self.shared.ledger.stats())
    }

    /// Review queue hand-off, ordered by validation priority.
    pub async fn next_for_review(&self, max_n: usize) -> Result<Vec<Memory>, EngineError> {
        Ok(self.shared.store.next_for_review(max_n).await?)
    }

    /// Apply human verdicts and feed the adaptive threshold learner.  The
    /// updated thresholds are persisted through the CAS interface.
    pub async fn submit_feedback(
        &self,
        feedback: Vec<(Uuid, HumanDecision)>,
    ) -> Result<(), EngineError> {
        for (memory_id, decision) in feedback {
            let (original, updated) = self.shared.store.apply_review(memory_id, decision).await?;
            debug!(
                memory_id = %memory_id,
                from = ?original,
                to = ?updated.validation,
                "review applied"
            );
            let config = {
                let mut learner = self.shared.thresholds.lock().await;
                learner.observe(original, decision);
                learner.config()
            };
            // CAS write with re-read on conflict.
            loop {
                let (_, version) = self.shared.store.read_thresholds().await?;
                match self.shared.store.write_thresholds(config, version).await {
                    Ok(_) => break,
                    Err(keepsake_memory::StoreError::VersionConflict { .. }) => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    }
}

// ─── worker loop ─────────────────────────────────────────────────────────────

async fn run_worker(
    shared: Arc<Shared>,
    batch_rx: Arc<Mutex<mpsc::Receiver<Batch>>>,
    cancel: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<ProgressEvent>,
    worker_id: usize,
) {
    loop {
        if *cancel.borrow() || shared.fatal.load(Ordering::SeqCst) {
            break;
        }

        let batch = {
            let mut rx = batch_rx.lock().await;
            let mut cancel = cancel.clone();
            tokio::select! {
                batch = rx.recv() => batch,
                _ = cancel.changed() => None,
            }
        };
        let Some(batch) = batch else { break };

        let batch_id = batch.id;
        match process_batch(&shared, batch, &cancel, &events, 0).await {
            Ok(report) => {
                let _ = events.send(ProgressEvent::BatchCompleted {
                    memories_extracted: report.memories_extracted,
                });
                let _ = shared
                    .store
                    .record_batch_outcome(BatchOutcome {
                        batch_id,
                        status: BatchStatus::Completed,
                        error_class: None,
                        memories_extracted: report.memories_extracted,
                        spent_usd: report.spent_usd,
                    })
                    .await;
            }
            Err(error) => {
                warn!(worker_id, batch_id = %batch_id, class = error.class(), error = %error, "batch failed");
                let _ = events.send(ProgressEvent::BatchFailed {
                    error_class: error.class(),
                });
                let _ = shared
                    .store
                    .record_batch_outcome(BatchOutcome {
                        batch_id,
                        status: BatchStatus::Failed,
                        error_class: Some(error.class().to_string()),
                        memories_extracted: 0,
                        spent_usd: 0.0,
                    })
                    .await;
                if error.is_fatal() {
                    shared.fatal.store(true, Ordering::SeqCst);
                    info!(class = error.class(), "fatal error: intake closed, draining in-flight work");
                    break;
                }
            }
        }
    }
    debug!(worker_id, "worker stopped");
}

async fn drain_events(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<ProgressEvent>) {
    let mut batches_seen = 0u64;
    while let Some(event) = events.recv().await {
        if matches!(
            event,
            ProgressEvent::BatchCompleted { .. } | ProgressEvent::BatchFailed { .. }
        ) {
            batches_seen += 1;
        }
        shared.counters.apply(&event);
        if batches_seen > 0 && batches_seen % PROGRESS_LOG_EVERY == 0 {
            let snapshot = shared.counters.snapshot(&shared.ledger.stats());
            info!(
                batches_completed = snapshot.batches_completed,
                batches_failed = snapshot.batches_failed,
                memories = snapshot.memories_extracted,
                spent_usd = snapshot.spent_usd,
                "progress"
            );
        }
    }
}

// ─── batch processing ────────────────────────────────────────────────────────

struct BatchReport {
    memories_extracted: usize,
    spent_usd: f64,
}

fn process_batch<'a>(
    shared: &'a Arc<Shared>,
    batch: Batch,
    cancel: &'a watch::Receiver<bool>,
    events: &'a mpsc::UnboundedSender<ProgressEvent>,
    split_depth: u32,
) -> std::pin::Pin<Box<dyn Future<Output = Result<BatchReport, EngineError>> + Send + 'a>> {
    Box::pin(async move {
        // Oversize batches split once on a conversational boundary.
        let budget = shared.config.batch.token_budget_per_request;
        if batch.estimated_cost_tokens > budget {
            let oversize = EngineError::Oversize {
                estimated: batch.estimated_cost_tokens,
                budget,
            };
            match shared.retry.decide(&oversize, split_depth) {
                RetryDecision::SplitBatch => {
                    let Some((head, tail)) = split_batch(&batch) else {
                        return Err(oversize);
                    };
                    debug!(batch_id = %batch.id, "oversize batch split into two sub-batches");
                    let first = process_batch(shared, head, cancel, events, split_depth + 1).await?;
                    let second = process_batch(shared, tail, cancel, events, split_depth + 1).await?;
                    return Ok(BatchReport {
                        memories_extracted: first.memories_extracted + second.memories_extracted,
                        spent_usd: first.spent_usd + second.spent_usd,
                    });
                }
                _ => return Err(oversize),
            }
        }

        shared.limiter.acquire(cancel).await?;

        let estimated_usd = batch.estimated_cost_tokens as f64 / 1000.0
            * shared.config.budget.usd_per_1k_tokens;
        let reservation = shared.ledger.reserve(estimated_usd)?;

        let raw = match call_with_retry(shared, &batch, cancel).await {
            Ok(raw) => raw,
            Err(error) => {
                shared.ledger.release(reservation);
                return Err(error);
            }
        };

        let (response, memories, dropped) = raw;
        for reason in &dropped {
            debug!(batch_id = %batch.id, reason, "memory dropped by parser");
            let _ = events.send(ProgressEvent::MemoryDropped);
        }

        let extracted = memories.len();
        for memory in memories {
            match process_memory(shared, &batch, memory).await {
                Ok(event) => {
                    let _ = events.send(event);
                }
                Err(error) => {
                    // A single memory failure never fails the batch.
                    warn!(batch_id = %batch.id, class = error.class(), error = %error, "memory dropped");
                    let _ = events.send(ProgressEvent::MemoryDropped);
                }
            }
        }

        let actual_usd = response.usage.total() as f64 / 1000.0
            * shared.config.budget.usd_per_1k_tokens;
        shared.ledger.commit(
            reservation,
            actual_usd,
            response.usage.tokens_in,
            response.usage.tokens_out,
        );

        Ok(BatchReport {
            memories_extracted: extracted,
            spent_usd: actual_usd,
        })
    })
}

/// Issue the LLM call, parsing the reply, with the retry strategy table
/// driving recovery: backoff for rate-limit/transport classes, tightened
/// prompt re-requests for parse failures.
async fn call_with_retry(
    shared: &Shared,
    batch: &Batch,
    cancel: &watch::Receiver<bool>,
) -> Result<(RawResponse, Vec<Memory>, Vec<String>), EngineError> {
    let base_prompt = build_extraction_prompt(batch);
    let params = CallParams {
        model: shared.config.llm.model.clone(),
        timeout: Duration::from_secs(shared.config.rate.request_timeout_seconds),
        max_tokens: None,
    };

    let mut tightened = false;
    let mut rate_limit_attempts = 0u32;
    let mut transport_attempts = 0u32;
    let mut parse_attempts = 0u32;

    loop {
        if *cancel.borrow() {
            return Err(EngineError::Cancelled);
        }

        let prompt = if tightened {
            format!("{base_prompt}{TIGHTEN_SUFFIX}")
        } else {
            base_prompt.clone()
        };

        shared.ledger.note_request();
        match shared.llm.call(&prompt, &params).await {
            Ok(response) => match parse_response(&response.content, batch, &response.model) {
                ParseResult::Parsed { memories, dropped } => {
                    return Ok((response, memories, dropped));
                }
                ParseResult::Failed { kind, detail } => {
                    let error = EngineError::Parse { kind, detail };
                    match shared.retry.decide(&error, parse_attempts) {
                        RetryDecision::TightenPrompt => {
                            parse_attempts += 1;
                            tightened = true;
                            debug!(batch_id = %batch.id, attempt = parse_attempts, "re-requesting with tightened prompt");
                        }
                        _ => return Err(error),
                    }
                }
            },
            Err(transport) => {
                let error = EngineError::from_transport(transport);
                let attempts = match error {
                    EngineError::RateLimited { .. } => &mut rate_limit_attempts,
                    _ => &mut transport_attempts,
                };
                match shared.retry.decide(&error, *attempts) {
                    RetryDecision::RetryAfter(delay) => {
                        *attempts += 1;
                        debug!(batch_id = %batch.id, class = error.class(), delay_ms = delay.as_millis() as u64, "backing off before retry");
                        let mut cancel = cancel.clone();
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            changed = cancel.changed() => {
                                if changed.is_err() || *cancel.borrow() {
                                    return Err(EngineError::Cancelled);
                                }
                            }
                        }
                    }
                    _ => return Err(error),
                }
            }
        }
    }
}

/// Per-memory stage chain: confidence → mood delta → significance →
/// auto-confirmation → dedup/persist.
async fn process_memory(
    shared: &Shared,
    batch: &Batch,
    mut memory: Memory,
) -> Result<ProgressEvent, EngineError> {
    let breakdown = confidence::assess(&memory, &batch.messages);
    memory.confidence = breakdown.overall;

    let now = memory.extracted_at;
    let lookback = ChronoDuration::hours(significance::MOOD_DELTA_LOOKBACK_HOURS);
    let mut priors: Vec<(chrono::DateTime<chrono::Utc>, f64)> = shared
        .store
        .find_candidates(&memory.participant_ids(), now - lookback, now)
        .await?
        .into_iter()
        .filter(|prior| prior.id != memory.id)
        .map(|prior| (prior.extracted_at, prior.mood_score.score))
        .collect();
    priors.sort_by(|a, b| b.0.cmp(&a.0));
    let priors: Vec<significance::PriorMood> = priors
        .into_iter()
        .map(|(at, score)| significance::PriorMood { at, score })
        .collect();

    memory.mood_score.delta =
        significance::detect_mood_delta(&memory.mood_score, now, &priors);
    memory.significance = significance::analyze(&memory, &shared.config.significance, now);

    let thresholds = {
        let learner = shared.thresholds.lock().await;
        learner.config()
    };
    memory.validation = confirm::route(memory.confidence, &thresholds);
    let validation = memory.validation;
    let confidence_value = memory.confidence;

    let outcome = dedup::resolve(memory, shared.store.as_ref(), &shared.config.similarity)
        .await
        .map_err(|err| match err {
            dedup::DedupError::MergeBlocked(state) => {
                EngineError::Validation(format!("merge blocked by {state:?} record"))
            }
            dedup::DedupError::Store(store) => EngineError::Store(store),
        })?;
    debug!(id = %outcome.id(), outcome = ?outcome, "memory resolved");

    Ok(ProgressEvent::MemoryRouted {
        confidence: confidence_value,
        auto_approved: validation == ValidationState::AutoApproved,
        needs_review: validation == ValidationState::NeedsReview,
        auto_rejected: validation == ValidationState::AutoRejected,
    })
}
