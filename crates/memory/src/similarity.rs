//! Similarity scoring between two memories across four axes.
//!
//! Axis weights: emotional 0.35, participant 0.25, temporal 0.15,
//! content 0.25.  `overall >= duplicate_at` marks a duplicate,
//! `[near_duplicate_at, duplicate_at)` a near-duplicate headed for merge.

use std::collections::BTreeSet;

use keepsake_config::SimilarityConfig;

use crate::hash::normalize_summary;
use crate::schema::Memory;

/// Temporal comparison window: memories further apart than this score 0.
const TEMPORAL_WINDOW_HOURS: f64 = 72.0;

const WEIGHT_EMOTIONAL: f64 = 0.35;
const WEIGHT_PARTICIPANT: f64 = 0.25;
const WEIGHT_TEMPORAL: f64 = 0.15;
const WEIGHT_CONTENT: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityScore {
    pub overall: f64,
    pub emotional: f64,
    pub participant: f64,
    pub temporal: f64,
    pub content: f64,
}

impl SimilarityScore {
    pub fn is_duplicate(&self, config: &SimilarityConfig) -> bool {
        self.overall >= config.duplicate_at
    }

    pub fn is_near_duplicate(&self, config: &SimilarityConfig) -> bool {
        self.overall >= config.near_duplicate_at && self.overall < config.duplicate_at
    }
}

/// Score two memories.  Symmetric, and `score(a, a).overall == 1`.
pub fn score(a: &Memory, b: &Memory) -> SimilarityScore {
    let emotional = emotional_similarity(a, b);
    let participant = jaccard(&a.participant_ids(), &b.participant_ids());
    let temporal = temporal_similarity(a, b);
    let content = jaccard(&summary_tokens(&a.summary), &summary_tokens(&b.summary));

    let overall = WEIGHT_EMOTIONAL * emotional
        + WEIGHT_PARTICIPANT * participant
        + WEIGHT_TEMPORAL * temporal
        + WEIGHT_CONTENT * content;

    SimilarityScore {
        overall,
        emotional,
        participant,
        temporal,
        content,
    }
}

/// Emotional axis: mean of (a) cosine over the `[mood one-hot ‖ intensity/10]`
/// vector and (b) theme Jaccard.  Both parts are 1 for identical inputs.
fn emotional_similarity(a: &Memory, b: &Memory) -> f64 {
    let vec_a = emotional_vector(a);
    let vec_b = emotional_vector(b);
    let cosine_part = cosine(&vec_a, &vec_b);
    let theme_part = jaccard(&a.emotional_context.themes, &b.emotional_context.themes);
    (cosine_part + theme_part) / 2.0
}

fn emotional_vector(memory: &Memory) -> [f64; 6] {
    let mut vector = [0.0; 6];
    vector[memory.emotional_context.primary_mood.one_hot_index()] = 1.0;
    vector[5] = memory.emotional_context.intensity / 10.0;
    vector
}

fn temporal_similarity(a: &Memory, b: &Memory) -> f64 {
    let delta = (a.extracted_at - b.extracted_at).num_seconds().abs() as f64;
    let window = TEMPORAL_WINDOW_HOURS * 3600.0;
    (1.0 - delta / window).max(0.0)
}

/// Token set of the normalized summary; tokens shorter than 2 chars drop out.
pub fn summary_tokens(summary: &str) -> BTreeSet<String> {
    normalize_summary(summary)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() >= 2)
        .map(str::to_string)
        .collect()
}

/// Jaccard index with `jaccard(∅, ∅) = 1` so self-similarity stays 1.
pub fn jaccard<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

fn cosine(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return if norm_a == norm_b { 1.0 } else { 0.0 };
    }
    dot / (norm_a * norm_b)
}
