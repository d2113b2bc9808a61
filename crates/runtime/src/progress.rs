//! Pipeline progress counters.
//!
//! Workers publish [`ProgressEvent`]s over a channel; the orchestrator's
//! drain task is the single mutator of [`ProgressCounters`].  Readers take
//! atomic snapshots and always observe monotonic counts.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::limiter::UsageStats;

/// Events workers emit as they move through the stage chain.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    BatchCompleted {
        memories_extracted: usize,
    },
    BatchFailed {
        error_class: &'static str,
    },
    MemoryRouted {
        confidence: f64,
        auto_approved: bool,
        needs_review: bool,
        auto_rejected: bool,
    },
    MemoryDropped,
}

#[derive(Debug, Default)]
pub struct ProgressCounters {
    batches_completed: AtomicU64,
    batches_failed: AtomicU64,
    memories_extracted: AtomicU64,
    memories_dropped: AtomicU64,
    auto_approved: AtomicU64,
    needs_review: AtomicU64,
    auto_rejected: AtomicU64,
    /// Confidence sum in millis, so the average stays lock-free.
    confidence_sum_milli: AtomicU64,
}

impl ProgressCounters {
    pub fn apply(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::BatchCompleted { memories_extracted } => {
                self.batches_completed.fetch_add(1, Ordering::Relaxed);
                self.memories_extracted
                    .fetch_add(*memories_extracted as u64, Ordering::Relaxed);
            }
            ProgressEvent::BatchFailed { .. } => {
                self.batches_failed.fetch_add(1, Ordering::Relaxed);
            }
            ProgressEvent::MemoryRouted {
                confidence,
                auto_approved,
                needs_review,
                auto_rejected,
            } => {
                self.confidence_sum_milli
                    .fetch_add((confidence * 1000.0) as u64, Ordering::Relaxed);
                if *auto_approved {
                    self.auto_approved.fetch_add(1, Ordering::Relaxed);
                }
                if *needs_review {
                    self.needs_review.fetch_add(1, Ordering::Relaxed);
                }
                if *auto_rejected {
                    self.auto_rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
            ProgressEvent::MemoryDropped => {
                self.memories_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self, usage: &UsageStats) -> ProgressSnapshot {
        let memories_extracted = self.memories_extracted.load(Ordering::Relaxed);
        let routed = self.auto_approved.load(Ordering::Relaxed)
            + self.needs_review.load(Ordering::Relaxed)
            + self.auto_rejected.load(Ordering::Relaxed);
        let average_confidence = if routed == 0 {
            0.0
        } else {
            self.confidence_sum_milli.load(Ordering::Relaxed) as f64 / 1000.0 / routed as f64
        };

        ProgressSnapshot {
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            memories_extracted,
            memories_dropped: self.memories_dropped.load(Ordering::Relaxed),
            average_confidence,
            auto_approved: self.auto_approved.load(Ordering::Relaxed),
            needs_review: self.needs_review.load(Ordering::Relaxed),
            auto_rejected: self.auto_rejected.load(Ordering::Relaxed),
            spent_usd: usage.spent_usd,
            requests: usage.requests,
        }
    }
}

/// Atomically-readable description of pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub batches_completed: u64,
    pub batches_failed: u64,
    pub memories_extracted: u64,
    pub memories_dropped: u64,
    pub average_confidence: f64,
    pub auto_approved: u64,
    pub needs_review: u64,
    pub auto_rejected: u64,
    pub spent_usd: f64,
    pub requests: u64,
}
