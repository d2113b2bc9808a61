//! Deduplication and merge.
//!
//! Resolution order per candidate memory: exact hash hit, then similarity
//! against candidates sharing participants inside a 72-hour window.  Merge
//! arithmetic is commutative and associative up to set ordering and the
//! one-decimal rounding it applies.

use chrono::Duration;
use keepsake_config::SimilarityConfig;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::hash::content_hash;
use crate::schema::{
    EvidenceItem, Memory, MoodFactor, SignificanceCategory, ValidationState, clamp01, round1,
};
use crate::similarity;
use crate::store::{MemoryStore, StoreError, UpsertOutcome};

/// Evidence items kept on a merged memory.
const MERGED_EVIDENCE_CAP: usize = 10;
/// Confidence discount applied to every merge result.
const MERGE_CONFIDENCE_SCALE: f64 = 0.95;
/// Candidate lookup window, matching the temporal similarity axis.
const CANDIDATE_WINDOW_HOURS: i64 = 72;

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("merge blocked: {0:?} memories do not merge")]
    MergeBlocked(ValidationState),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How a candidate memory was resolved against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupOutcome {
    /// Fresh memory, inserted as-is.
    Inserted(Uuid),
    /// Exact hash duplicate; the existing id is returned, nothing inserted.
    ExactDuplicate(Uuid),
    /// Similarity at or above the duplicate cutoff; records were merged.
    Merged(Uuid),
    /// Similarity in the near-duplicate band; merged with origins retained.
    NearDuplicate(Uuid),
}

impl DedupOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            DedupOutcome::Inserted(id)
            | DedupOutcome::ExactDuplicate(id)
            | DedupOutcome::Merged(id)
            | DedupOutcome::NearDuplicate(id) => *id,
        }
    }
}

/// Resolve one candidate memory against the persisted store.
pub async fn resolve(
    candidate: Memory,
    store: &dyn MemoryStore,
    config: &SimilarityConfig,
) -> Result<DedupOutcome, DedupError> {
    // 1. Exact duplicate by content hash.
    if let Some(existing) = store.find_by_hash(&candidate.content_hash).await? {
        debug!(id = %existing.id, "exact duplicate by content hash");
        return Ok(DedupOutcome::ExactDuplicate(existing.id));
    }

    // 2. Similarity sweep over participant-overlapping recent memories.
    let window = Duration::hours(CANDIDATE_WINDOW_HOURS);
    let candidates = store
        .find_candidates(
            &candidate.participant_ids(),
            candidate.extracted_at - window,
            candidate.extracted_at + window,
        )
        .await?;

    let best = candidates
        .into_iter()
        .filter(|existing| !existing.validation.is_rejected())
        .map(|existing| {
            let score = similarity::score(&existing, &candidate);
            (existing, score)
        })
        .max_by(|a, b| a.1.overall.total_cmp(&b.1.overall));

    if let Some((existing, score)) = best {
        if score.is_duplicate(config) {
            let merged = merge(&existing, &candidate, false)?;
            let id = store.replace(&[existing.id], merged).await?;
            info!(overall = score.overall, id = %id, "duplicate merged");
            return Ok(DedupOutcome::Merged(id));
        }
        if score.is_near_duplicate(config) {
            let merged = merge(&existing, &candidate, true)?;
            let id = store.replace(&[existing.id], merged).await?;
            info!(overall = score.overall, id = %id, "near-duplicate merged, origins retained");
            return Ok(DedupOutcome::NearDuplicate(id));
        }
    }

    // 3. Genuinely new.
    match store.upsert(candidate).await? {
        UpsertOutcome::Inserted(id) => Ok(DedupOutcome::Inserted(id)),
        // Lost a race with a concurrent upsert of the same hash; the
        // existing record wins, mirroring the exact-duplicate path.
        UpsertOutcome::Merged(id) => Ok(DedupOutcome::ExactDuplicate(id)),
    }
}

/// Merge two memories per the metadata-preserving rules.
///
/// `retain_origins` marks the near-duplicate branch: both source ids are
/// recorded in `metadata.merged_from`.  Rejected memories never merge.
pub fn merge(a: &Memory, b: &Memory, retain_origins: bool) -> Result<Memory, DedupError> {
    if a.validation.is_rejected() {
        return Err(DedupError::MergeBlocked(a.validation));
    }
    if b.validation.is_rejected() {
        return Err(DedupError::MergeBlocked(b.validation));
    }

    let weight_a = a.confidence.max(1e-6);
    let weight_b = b.confidence.max(1e-6);
    let weighted = |x: f64, y: f64| round1((x * weight_a + y * weight_b) / (weight_a + weight_b));

    // Higher confidence wins ties on descriptive fields; ties go to length.
    let (lead, tail) = if (a.confidence, a.summary.len()) >= (b.confidence, b.summary.len()) {
        (a, b)
    } else {
        (b, a)
    };

    let mut source_message_ids: Vec<String> = a
        .source_message_ids
        .iter()
        .chain(&b.source_message_ids)
        .cloned()
        .collect();
    source_message_ids.sort();
    source_message_ids.dedup();

    let mut participants = a.participants.clone();
    for participant in &b.participants {
        if !participants.iter().any(|p| p.id == participant.id) {
            participants.push(participant.clone());
        }
    }
    participants.sort();

    let mut emotional_context = lead.emotional_context.clone();
    emotional_context.intensity = weighted(
        a.emotional_context.intensity,
        b.emotional_context.intensity,
    );
    emotional_context.valence =
        weighted(a.emotional_context.valence, b.emotional_context.valence);
    emotional_context
        .themes
        .extend(tail.emotional_context.themes.iter().cloned());
    for marker in &tail.emotional_context.emotional_markers {
        match emotional_context
            .emotional_markers
            .iter_mut()
            .find(|m| m.phrase == marker.phrase)
        {
            Some(existing) => existing.strength = existing.strength.max(marker.strength),
            None => emotional_context.emotional_markers.push(marker.clone()),
        }
    }

    let mut relationship_dynamics = lead.relationship_dynamics.clone();
    relationship_dynamics.closeness = weighted(
        a.relationship_dynamics.closeness,
        b.relationship_dynamics.closeness,
    );
    relationship_dynamics.tension = weighted(
        a.relationship_dynamics.tension,
        b.relationship_dynamics.tension,
    );
    relationship_dynamics.supportiveness = weighted(
        a.relationship_dynamics.supportiveness,
        b.relationship_dynamics.supportiveness,
    );
    relationship_dynamics.connection_strength = weighted(
        a.relationship_dynamics.connection_strength,
        b.relationship_dynamics.connection_strength,
    );

    let mut mood_score = lead.mood_score.clone();
    mood_score.score = weighted(a.mood_score.score, b.mood_score.score);
    mood_score.confidence = weighted(a.mood_score.confidence, b.mood_score.confidence);
    for descriptor in &tail.mood_score.descriptors {
        if !mood_score.descriptors.contains(descriptor) {
            mood_score.descriptors.push(descriptor.clone());
        }
    }
    mood_score.factors = merge_factors(&a.mood_score.factors, &b.mood_score.factors);

    let evidence = merge_evidence(&a.evidence, &b.evidence);

    let confidence = clamp01(
        (a.confidence * weight_a + b.confidence * weight_b) / (weight_a + weight_b)
            * MERGE_CONFIDENCE_SCALE,
    );

    let mut significance = lead.significance.clone();
    significance.overall = weighted(a.significance.overall, b.significance.overall);
    significance.category = SignificanceCategory::from_overall(significance.overall);
    significance.validation_priority = round1(significance.overall * (1.0 - confidence));

    let mut merged_from: Vec<Uuid> = Vec::new();
    if retain_origins {
        merged_from.extend(&a.metadata.merged_from);
        merged_from.extend(&b.metadata.merged_from);
        merged_from.push(a.id);
        merged_from.push(b.id);
        merged_from.sort();
        merged_from.dedup();
    }

    let mut merged = Memory {
        id: Uuid::new_v4(),
        source_message_ids,
        participants,
        emotional_context,
        relationship_dynamics,
        mood_score,
        significance,
        summary: lead.summary.clone(),
        evidence,
        confidence,
        validation: ValidationState::strictest(a.validation, b.validation),
        content_hash: [0; 32],
        extracted_at: a.extracted_at.max(b.extracted_at),
        metadata: crate::schema::MemoryMetadata {
            model: lead.metadata.model.clone(),
            prompt_version: lead.metadata.prompt_version.clone(),
            batch_id: lead.metadata.batch_id,
            merged_from,
        },
    };
    merged.content_hash = content_hash(&merged);
    Ok(merged)
}

/// Union mood factors by kind, keeping the higher weight.
fn merge_factors(a: &[MoodFactor], b: &[MoodFactor]) -> Vec<MoodFactor> {
    let mut merged: Vec<MoodFactor> = a.to_vec();
    for factor in b {
        match merged.iter_mut().find(|f| f.kind == factor.kind) {
            Some(existing) => {
                if factor.weight > existing.weight {
                    *existing = factor.clone();
                }
            }
            None => merged.push(factor.clone()),
        }
    }
    merged
}

/// Union evidence by source message, keep the more relevant item per source,
/// then cap by relevance.
fn merge_evidence(a: &[EvidenceItem], b: &[EvidenceItem]) -> Vec<EvidenceItem> {
    let mut merged: Vec<EvidenceItem> = Vec::new();
    for item in a.iter().chain(b) {
        match merged
            .iter_mut()
            .find(|e| e.source_message_id == item.source_message_id)
        {
            Some(existing) => {
                if item.relevance > existing.relevance {
                    *existing = item.clone();
                }
            }
            None => merged.push(item.clone()),
        }
    }
    merged.sort_by(|x, y| y.relevance.total_cmp(&x.relevance));
    merged.truncate(MERGED_EVIDENCE_CAP);
    merged
}
