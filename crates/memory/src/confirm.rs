//! Auto-confirmation: threshold routing plus adaptive threshold learning.
//!
//! Routing is a pure function of confidence and the current thresholds.
//! The adaptive learner consumes human feedback one tuple at a time and
//! nudges `auto_approve` by a bounded step, never letting an update violate
//! the threshold ordering invariant.

use keepsake_config::ThresholdConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::schema::{HumanDecision, Memory, ValidationState};

/// Bounded learning step applied per feedback tuple.
const THRESHOLD_STEP: f64 = 0.01;
/// Clamp range for the adaptive `auto_approve` threshold.
const AUTO_APPROVE_FLOOR: f64 = 0.60;
const AUTO_APPROVE_CEIL: f64 = 0.95;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfirmError {
    #[error("memory is in state {0:?}, which does not accept a human decision")]
    NotReviewable(ValidationState),
}

/// Route a pending memory by its confidence.
pub fn route(confidence: f64, thresholds: &ThresholdConfig) -> ValidationState {
    if confidence >= thresholds.auto_approve {
        ValidationState::AutoApproved
    } else if confidence <= thresholds.auto_reject {
        ValidationState::AutoRejected
    } else {
        ValidationState::NeedsReview
    }
}

/// Apply a human verdict.  Only `needs-review` memories accept one.
pub fn apply_human_decision(
    current: ValidationState,
    decision: HumanDecision,
) -> Result<ValidationState, ConfirmError> {
    if current != ValidationState::NeedsReview {
        return Err(ConfirmError::NotReviewable(current));
    }
    Ok(match decision {
        HumanDecision::Approve => ValidationState::HumanApproved,
        HumanDecision::Reject => ValidationState::HumanRejected,
    })
}

/// Apply an out-of-band feedback verdict.  Unlike [`apply_human_decision`]
/// this also accepts overrides of auto decisions; that is where the false
/// positives the adaptive learner feeds on come from.  Human-terminal and
/// pending states still refuse.
pub fn apply_feedback(
    current: ValidationState,
    decision: HumanDecision,
) -> Result<ValidationState, ConfirmError> {
    match current {
        ValidationState::NeedsReview
        | ValidationState::AutoApproved
        | ValidationState::AutoRejected => Ok(match decision {
            HumanDecision::Approve => ValidationState::HumanApproved,
            HumanDecision::Reject => ValidationState::HumanRejected,
        }),
        other => Err(ConfirmError::NotReviewable(other)),
    }
}

/// Per-memory routing decisions aggregated over a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingCounts {
    pub auto_approved: usize,
    pub needs_review: usize,
    pub auto_rejected: usize,
}

/// Route every memory in place and return the batch-level counts.
pub fn route_batch(memories: &mut [Memory], thresholds: &ThresholdConfig) -> RoutingCounts {
    let mut counts = RoutingCounts::default();
    for memory in memories.iter_mut() {
        memory.validation = route(memory.confidence, thresholds);
        match memory.validation {
            ValidationState::AutoApproved => counts.auto_approved += 1,
            ValidationState::AutoRejected => counts.auto_rejected += 1,
            _ => counts.needs_review += 1,
        }
    }
    counts
}

// ─── adaptive thresholds ─────────────────────────────────────────────────────

/// Confusion counts accumulated from human feedback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackCounts {
    pub false_positives: u64,
    pub false_negatives: u64,
    pub agreements: u64,
}

/// Learns the `auto_approve` threshold from `{original, human}` feedback
/// tuples.  A false positive (auto-approved, human rejected) raises the
/// threshold; a false negative (sent to review, human approved) lowers it.
#[derive(Debug, Clone)]
pub struct AdaptiveThresholds {
    config: ThresholdConfig,
    counts: FeedbackCounts,
}

impl AdaptiveThresholds {
    pub fn new(config: ThresholdConfig) -> Self {
        Self {
            config,
            counts: FeedbackCounts::default(),
        }
    }

    pub fn config(&self) -> ThresholdConfig {
        self.config
    }

    pub fn counts(&self) -> FeedbackCounts {
        self.counts
    }

    /// Fold one feedback tuple into the confusion counts and nudge the
    /// threshold.  Updates that would break the ordering invariant are
    /// rejected and logged; the previous config stays in force.
    pub fn observe(&mut self, original: ValidationState, human: HumanDecision) {
        let step = match (original, human) {
            (ValidationState::AutoApproved, HumanDecision::Reject) => {
                self.counts.false_positives += 1;
                THRESHOLD_STEP
            }
            (ValidationState::NeedsReview, HumanDecision::Approve) => {
                self.counts.false_negatives += 1;
                -THRESHOLD_STEP
            }
            _ => {
                self.counts.agreements += 1;
                return;
            }
        };

        let mut candidate = self.config;
        candidate.auto_approve =
            (candidate.auto_approve + step).clamp(AUTO_APPROVE_FLOOR, AUTO_APPROVE_CEIL);

        if !candidate.is_valid() {
            warn!(
                auto_approve = candidate.auto_approve,
                review_lower = candidate.review_lower,
                auto_reject = candidate.auto_reject,
                "adaptive threshold update rejected: ordering invariant would break"
            );
            return;
        }

        if candidate.auto_approve != self.config.auto_approve {
            info!(
                from = self.config.auto_approve,
                to = candidate.auto_approve,
                false_positives = self.counts.false_positives,
                false_negatives = self.counts.false_negatives,
                "auto-approve threshold adjusted"
            );
        }
        self.config = candidate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sample_memory;

    #[test]
    fn routing_respects_thresholds() {
        let thresholds = ThresholdConfig::default();
        assert_eq!(route(0.82, &thresholds), ValidationState::AutoApproved);
        assert_eq!(route(0.75, &thresholds), ValidationState::AutoApproved);
        assert_eq!(route(0.60, &thresholds), ValidationState::NeedsReview);
        assert_eq!(route(0.30, &thresholds), ValidationState::AutoRejected);
        assert_eq!(route(0.10, &thresholds), ValidationState::AutoRejected);
    }

    #[test]
    fn human_decision_only_from_needs_review() {
        assert_eq!(
            apply_human_decision(ValidationState::NeedsReview, HumanDecision::Approve),
            Ok(ValidationState::HumanApproved)
        );
        assert_eq!(
            apply_human_decision(ValidationState::NeedsReview, HumanDecision::Reject),
            Ok(ValidationState::HumanRejected)
        );
        assert!(apply_human_decision(ValidationState::AutoApproved, HumanDecision::Reject).is_err());
        assert!(apply_human_decision(ValidationState::Pending, HumanDecision::Approve).is_err());
    }

    #[test]
    fn batch_routing_counts_every_decision() {
        let thresholds = ThresholdConfig::default();
        let mut memories = vec![
            sample_memory("confident and clear summary", &["A"], 0.9),
            sample_memory("middling summary of the chat", &["A"], 0.5),
            sample_memory("barely grounded impression", &["A"], 0.1),
        ];
        let counts = route_batch(&mut memories, &thresholds);
        assert_eq!(counts.auto_approved, 1);
        assert_eq!(counts.needs_review, 1);
        assert_eq!(counts.auto_rejected, 1);
        assert_eq!(memories[0].validation, ValidationState::AutoApproved);
        assert_eq!(memories[2].validation, ValidationState::AutoRejected);
    }

    #[test]
    fn false_positive_raises_auto_approve() {
        let mut learner = AdaptiveThresholds::new(ThresholdConfig::default());
        learner.observe(ValidationState::AutoApproved, HumanDecision::Reject);
        assert!((learner.config().auto_approve - 0.76).abs() < 1e-9);
        assert_eq!(learner.counts().false_positives, 1);
    }

    #[test]
    fn false_negative_lowers_auto_approve() {
        let mut learner = AdaptiveThresholds::new(ThresholdConfig::default());
        learner.observe(ValidationState::NeedsReview, HumanDecision::Approve);
        assert!((learner.config().auto_approve - 0.74).abs() < 1e-9);
        assert_eq!(learner.counts().false_negatives, 1);
    }

    #[test]
    fn auto_approve_is_clamped_to_band() {
        let mut learner = AdaptiveThresholds::new(ThresholdConfig {
            auto_approve: 0.95,
            auto_reject: 0.30,
            review_lower: 0.50,
        });
        learner.observe(ValidationState::AutoApproved, HumanDecision::Reject);
        assert_eq!(learner.config().auto_approve, 0.95);

        let mut learner = AdaptiveThresholds::new(ThresholdConfig {
            auto_approve: 0.60,
            auto_reject: 0.30,
            review_lower: 0.50,
        });
        learner.observe(ValidationState::NeedsReview, HumanDecision::Approve);
        assert_eq!(learner.config().auto_approve, 0.60);
    }

    #[test]
    fn invariant_violating_update_is_rejected() {
        // review_lower sits right at auto_approve: lowering would break
        // review_lower <= auto_approve, so the update must be dropped.
        let start = ThresholdConfig {
            auto_approve: 0.70,
            auto_reject: 0.30,
            review_lower: 0.70,
        };
        let mut learner = AdaptiveThresholds::new(start);
        learner.observe(ValidationState::NeedsReview, HumanDecision::Approve);
        assert_eq!(learner.config().auto_approve, 0.70);
        assert_eq!(learner.counts().false_negatives, 1);
    }

    #[test]
    fn agreements_do_not_move_thresholds() {
        let mut learner = AdaptiveThresholds::new(ThresholdConfig::default());
        learner.observe(ValidationState::NeedsReview, HumanDecision::Reject);
        assert_eq!(learner.config(), ThresholdConfig::default());
        assert_eq!(learner.counts().agreements, 1);
    }
}
