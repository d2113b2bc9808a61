//! Significance scoring and mood-delta detection.
//!
//! Significance is a weighted blend of four components, each on a ten-point
//! scale.  Mood deltas compare the current mood score against the most
//! recent prior scores for overlapping participants within 24 hours.

use chrono::{DateTime, Duration, Utc};
use keepsake_config::SignificanceWeights;
use tracing::debug;

use crate::affect::{has_high_impact_lexeme, has_vulnerability_marker, urgency_score};
use crate::schema::{
    DeltaDirection, DeltaKind, DeltaSignificance, Memory, MoodDelta, MoodScore,
    SignificanceCategory, SignificanceComponents, SignificanceScore, clamp01, clamp10,
};

/// Recency half-life for temporal relevance.
const RECENCY_HALF_LIFE_DAYS: f64 = 30.0;

/// Conversations longer than this read as extended engagement.
const EXTENDED_WINDOW_MESSAGES: usize = 20;

/// Theme identifiers that mark a life event.
const LIFE_EVENT_THEMES: &[&str] = &[
    "milestone", "loss", "health", "transition", "birth", "death", "move",
    "breakup", "wedding", "diagnosis", "graduation", "anniversary",
];

/// How far back prior mood observations count toward a delta.
pub const MOOD_DELTA_LOOKBACK_HOURS: i64 = 24;

/// A prior mood observation for an overlapping participant set.
#[derive(Debug, Clone, Copy)]
pub struct PriorMood {
    pub at: DateTime<Utc>,
    pub score: f64,
}

/// Compute the full significance score for a memory as of `now`.
///
/// `memory.confidence` must already hold the final calculated confidence;
/// validation priority floats uncertain-yet-significant memories to the top.
pub fn analyze(memory: &Memory, weights: &SignificanceWeights, now: DateTime<Utc>) -> SignificanceScore {
    let components = SignificanceComponents {
        emotional_salience: emotional_salience(memory),
        relationship_impact: relationship_impact(memory),
        contextual_importance: contextual_importance(memory),
        temporal_relevance: temporal_relevance(memory, now),
    };

    let overall = clamp10(
        weights.emotional_salience * components.emotional_salience
            + weights.relationship_impact * components.relationship_impact
            + weights.contextual_importance * components.contextual_importance
            + weights.temporal_relevance * components.temporal_relevance,
    );

    let confidence = clamp01(0.5 * memory.confidence + 0.5 * clamp01(memory.mood_score.confidence));
    let validation_priority = clamp10(overall * (1.0 - clamp01(memory.confidence)));

    SignificanceScore {
        overall,
        components,
        category: SignificanceCategory::from_overall(overall),
        validation_priority,
        confidence,
    }
}

/// Departure of the mood score from the 5.0 baseline, weighted by mood
/// confidence, with bonuses for high-impact lexemes and urgency markers.
fn emotional_salience(memory: &Memory) -> f64 {
    let mood = &memory.mood_score;
    let base = (mood.score - 5.0).abs() * 2.0;
    let weighted = base * (0.5 + 0.5 * clamp01(mood.confidence));

    let marker_text = memory
        .emotional_context
        .emotional_markers
        .iter()
        .map(|m| m.phrase.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    let mut bonus = 0.0;
    if has_high_impact_lexeme(&memory.summary) || has_high_impact_lexeme(&marker_text) {
        bonus += 1.5;
    }
    bonus += urgency_score(&memory.summary);

    clamp10(weighted + bonus)
}

/// Mean departure of the relationship axes from neutral, boosted for close
/// ties and vulnerability.  Axes outside `[1, 10]` count as unreported.
fn relationship_impact(memory: &Memory) -> f64 {
    let dynamics = &memory.relationship_dynamics;

    let in_range = |v: f64| (1.0..=10.0).contains(&v);
    let closeness = if in_range(dynamics.closeness) { (dynamics.closeness - 5.0).abs() * 2.0 } else { 0.0 };
    let tension = if in_range(dynamics.tension) { dynamics.tension } else { 0.0 };
    let support = if in_range(dynamics.supportiveness) { (dynamics.supportiveness - 5.0).abs() * 2.0 } else { 0.0 };

    let mut score = (closeness + tension + support) / 3.0;

    if memory.participants.iter().any(|p| p.role.is_close_tie()) {
        score *= 1.25;
    }
    if has_vulnerability_marker(&memory.summary) {
        score += 1.0;
    }

    clamp10(score)
}

/// Life-event themes dominate; long conversation windows add a mild boost.
fn contextual_importance(memory: &Memory) -> f64 {
    let mut score = 2.0;

    let life_events = memory
        .emotional_context
        .themes
        .iter()
        .filter(|theme| {
            let theme = theme.to_lowercase();
            LIFE_EVENT_THEMES.iter().any(|t| theme.contains(t))
        })
        .count();
    score += (life_events as f64 * 2.0).min(5.0);

    if memory.source_message_ids.len() > EXTENDED_WINDOW_MESSAGES {
        score += 1.0;
    }

    clamp10(score)
}

/// Exponential recency decay with a 30-day half-life.
fn temporal_relevance(memory: &Memory, now: DateTime<Utc>) -> f64 {
    let age_days = (now - memory.extracted_at).num_seconds().max(0) as f64 / 86_400.0;
    clamp10(10.0 * 0.5_f64.powf(age_days / RECENCY_HALF_LIFE_DAYS))
}

// ─── mood delta ──────────────────────────────────────────────────────────────

/// Detect and classify a mood delta against prior observations.
///
/// `priors` must be sorted most-recent-first and already filtered to
/// overlapping participants within [`MOOD_DELTA_LOOKBACK_HOURS`].
/// Classification precedence: repair, spike, then sudden/gradual by timing.
/// Three consecutive prior scores within ±1 of each other mark a sustained
/// mood: no delta is emitted, whatever the current score.  Fewer than three
/// priors never suppress.
pub fn detect_mood_delta(
    current: &MoodScore,
    current_at: DateTime<Utc>,
    priors: &[PriorMood],
) -> Option<MoodDelta> {
    let previous = priors.first()?;
    let magnitude = (current.score - previous.score).abs();
    let elapsed = current_at - previous.at;

    if priors.len() >= 3 {
        let band = [priors[0].score, priors[1].score, priors[2].score];
        let max = band.iter().cloned().fold(f64::MIN, f64::max);
        let min = band.iter().cloned().fold(f64::MAX, f64::min);
        if max - min <= 1.0 {
            debug!(score = current.score, "mood sustained, no delta emitted");
            return None;
        }
    }

    let direction = if current.score >= previous.score {
        DeltaDirection::Positive
    } else {
        DeltaDirection::Negative
    };

    let kind = if previous.score < 4.0 && current.score >= 5.0 {
        DeltaKind::Repair
    } else if current.score >= 8.0 && magnitude >= 2.0 && direction == DeltaDirection::Positive {
        DeltaKind::Spike
    } else if magnitude >= 2.0 {
        if elapsed <= Duration::minutes(30) {
            DeltaKind::Sudden
        } else {
            DeltaKind::Gradual
        }
    } else {
        return None;
    };

    let significance = if magnitude >= 3.5 {
        DeltaSignificance::High
    } else if magnitude >= 2.0 {
        DeltaSignificance::Medium
    } else {
        DeltaSignificance::Low
    };

    Some(MoodDelta {
        previous_score: previous.score,
        current_score: current.score,
        magnitude,
        direction,
        significance,
        kind,
        confidence: clamp01(current.confidence * (0.6 + 0.1 * priors.len() as f64).min(1.0)),
        detected_at: current_at,
    })
}
