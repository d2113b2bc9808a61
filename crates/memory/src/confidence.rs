//! Five-factor confidence calculation.
//!
//! Each factor lands in `[0, 1]`; the overall score is their weighted sum
//! (weights total 1).  Out-of-range inputs are clamped, missing inputs score
//! 0 on their factor, and the full decomposition is returned for
//! traceability.

use serde::{Deserialize, Serialize};

use crate::schema::{Memory, Message, PrimaryMood, clamp01};

const WEIGHT_MODEL: f64 = 0.25;
const WEIGHT_COHERENCE: f64 = 0.25;
const WEIGHT_RELATIONSHIP: f64 = 0.20;
const WEIGHT_TEMPORAL: f64 = 0.15;
const WEIGHT_CONTENT: f64 = 0.15;

/// Theme count at which the spread component bottoms out.
const MAX_COHERENT_THEMES: f64 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub model_confidence: f64,
    pub emotional_coherence: f64,
    pub relationship_accuracy: f64,
    pub temporal_consistency: f64,
    pub content_quality: f64,
    pub overall: f64,
}

/// Assess a freshly parsed memory against the batch messages it came from.
pub fn assess(memory: &Memory, batch_messages: &[Message]) -> ConfidenceBreakdown {
    let model_confidence = clamp01(memory.confidence);
    let emotional_coherence = emotional_coherence(memory);
    let relationship_accuracy = relationship_accuracy(memory);
    let temporal_consistency = temporal_consistency(memory, batch_messages);
    let content_quality = content_quality(memory);

    let overall = clamp01(
        WEIGHT_MODEL * model_confidence
            + WEIGHT_COHERENCE * emotional_coherence
            + WEIGHT_RELATIONSHIP * relationship_accuracy
            + WEIGHT_TEMPORAL * temporal_consistency
            + WEIGHT_CONTENT * content_quality,
    );

    ConfidenceBreakdown {
        model_confidence,
        emotional_coherence,
        relationship_accuracy,
        temporal_consistency,
        content_quality,
        overall,
    }
}

/// Theme spread (fewer declared themes = a more coherent reading) combined
/// with an intensity/valence vs. primary-mood alignment check.
fn emotional_coherence(memory: &Memory) -> f64 {
    let ctx = &memory.emotional_context;

    let theme_count = ctx.themes.len();
    let spread = if theme_count == 0 {
        0.0
    } else if theme_count == 1 {
        1.0
    } else {
        1.0 - ((theme_count as f64).ln() / MAX_COHERENT_THEMES.ln()).min(1.0)
    };

    let alignment = match ctx.primary_mood {
        PrimaryMood::Neutral if ctx.intensity > 6.0 => 0.0,
        PrimaryMood::Positive if ctx.valence < -0.2 => 0.0,
        PrimaryMood::Negative if ctx.valence > 0.2 => 0.0,
        PrimaryMood::Mixed | PrimaryMood::Ambiguous => 0.5,
        _ => 1.0,
    };

    clamp01(0.6 * spread + 0.4 * alignment)
}

/// Structural completeness of the relationship dynamics block.
fn relationship_accuracy(memory: &Memory) -> f64 {
    let dynamics = &memory.relationship_dynamics;
    let mut score = 0.0;
    for value in [dynamics.closeness, dynamics.tension, dynamics.supportiveness] {
        if (1.0..=10.0).contains(&value) {
            score += 0.8 / 3.0;
        }
    }
    if dynamics.connection_strength > 0.0 && dynamics.connection_strength <= 1.0 {
        score += 0.2;
    }
    clamp01(score)
}

/// Source-message linkage and timestamp sanity.
fn temporal_consistency(memory: &Memory, batch_messages: &[Message]) -> f64 {
    if memory.source_message_ids.is_empty() {
        return 0.0;
    }

    let mut score = 0.0;

    let all_sources_resolve = memory
        .source_message_ids
        .iter()
        .all(|id| batch_messages.iter().any(|m| &m.id == id));
    if all_sources_resolve {
        score += 0.4;
    }

    let monotone = batch_messages
        .windows(2)
        .all(|pair| pair[0].timestamp <= pair[1].timestamp);
    if monotone {
        score += 0.3;
    }

    let last_timestamp = batch_messages.iter().map(|m| m.timestamp).max();
    if last_timestamp.is_none_or(|last| memory.extracted_at >= last) {
        score += 0.3;
    }

    score
}

/// Summary length, evidence presence, and evidence relevance.
fn content_quality(memory: &Memory) -> f64 {
    let mut score = 0.0;

    let summary_chars = memory.summary.chars().count();
    if (16..=1000).contains(&summary_chars) {
        score += 0.4;
    }

    if !memory.evidence.is_empty() {
        score += 0.3;
        let mean_relevance = memory.evidence.iter().map(|e| e.relevance).sum::<f64>()
            / memory.evidence.len() as f64;
        if mean_relevance >= 0.4 {
            score += 0.3;
        }
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{sample_memory, sample_messages};

    #[test]
    fn weights_sum_to_one() {
        let total =
            WEIGHT_MODEL + WEIGHT_COHERENCE + WEIGHT_RELATIONSHIP + WEIGHT_TEMPORAL + WEIGHT_CONTENT;
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn well_formed_memory_scores_high() {
        let messages = sample_messages("conv", &["A", "B", "A"]);
        let mut memory = sample_memory(
            "Alice apologized warmly to Bob after their argument",
            &["A", "B"],
            0.85,
        );
        memory.source_message_ids = messages.iter().map(|m| m.id.clone()).collect();
        memory.evidence[0].source_message_id = messages[0].id.clone();

        let breakdown = assess(&memory, &messages);
        assert!(breakdown.overall > 0.75, "overall = {}", breakdown.overall);
        assert_eq!(breakdown.temporal_consistency, 1.0);
        assert_eq!(breakdown.content_quality, 1.0);
    }

    #[test]
    fn model_confidence_is_clamped() {
        let messages = sample_messages("conv", &["A"]);
        let mut memory = sample_memory("a perfectly reasonable summary", &["A"], 1.7);
        memory.source_message_ids = vec![messages[0].id.clone()];
        let breakdown = assess(&memory, &messages);
        assert_eq!(breakdown.model_confidence, 1.0);
    }

    #[test]
    fn missing_evidence_zeroes_that_part() {
        let messages = sample_messages("conv", &["A"]);
        let mut memory = sample_memory("summary long enough to count", &["A"], 0.8);
        memory.source_message_ids = vec![messages[0].id.clone()];
        memory.evidence.clear();
        let breakdown = assess(&memory, &messages);
        assert_eq!(breakdown.content_quality, 0.4);
    }

    #[test]
    fn short_summary_loses_content_points() {
        let messages = sample_messages("conv", &["A"]);
        let mut memory = sample_memory("tiny", &["A"], 0.8);
        memory.source_message_ids = vec![messages[0].id.clone()];
        let breakdown = assess(&memory, &messages);
        assert!(breakdown.content_quality < 0.7);
    }

    #[test]
    fn dangling_source_ids_hurt_temporal_consistency() {
        let messages = sample_messages("conv", &["A"]);
        let mut memory = sample_memory("summary long enough to count", &["A"], 0.8);
        memory.source_message_ids = vec!["msg-that-does-not-exist".to_string()];
        let breakdown = assess(&memory, &messages);
        assert!(breakdown.temporal_consistency < 0.7);
    }

    #[test]
    fn neutral_mood_with_extreme_intensity_is_incoherent() {
        let messages = sample_messages("conv", &["A"]);
        let mut aligned = sample_memory("summary long enough to count", &["A"], 0.8);
        aligned.source_message_ids = vec![messages[0].id.clone()];
        let mut misaligned = aligned.clone();
        misaligned.emotional_context.primary_mood = PrimaryMood::Neutral;
        misaligned.emotional_context.intensity = 9.0;

        let a = assess(&aligned, &messages);
        let b = assess(&misaligned, &messages);
        assert!(a.emotional_coherence > b.emotional_coherence);
    }

    #[test]
    fn empty_sources_score_zero_temporal() {
        let messages = sample_messages("conv", &["A"]);
        let mut memory = sample_memory("summary long enough to count", &["A"], 0.8);
        memory.source_message_ids.clear();
        assert_eq!(assess(&memory, &messages).temporal_consistency, 0.0);
    }
}
