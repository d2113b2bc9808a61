//! Core data model: messages in, emotional memories out.
//!
//! Everything here is plain serde data.  Range invariants are enforced by the
//! clamping helpers at the bottom; themes are a `BTreeSet` so iteration order
//! is deterministic wherever the set feeds the content hash.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── input side ──────────────────────────────────────────────────────────────

/// A single conversational message, supplied ordered-by-timestamp by the
/// upstream message store.  Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub author_id: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    /// The journal owner ("self" on the wire; `Self` is reserved in Rust).
    #[serde(rename = "self")]
    Own,
    Partner,
    Family,
    Friend,
    Colleague,
    Professional,
    Other,
}

impl ParticipantRole {
    /// Roles whose presence amplifies relationship impact.
    pub fn is_close_tie(&self) -> bool {
        matches!(self, ParticipantRole::Partner | ParticipantRole::Family)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub role: ParticipantRole,
}

// ─── emotional analysis ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimaryMood {
    Positive,
    Negative,
    Neutral,
    Mixed,
    Ambiguous,
}

impl PrimaryMood {
    /// Stable lowercase literal, used verbatim in the canonical signature.
    pub fn as_str(&self) -> &'static str {
        match self {
            PrimaryMood::Positive => "positive",
            PrimaryMood::Negative => "negative",
            PrimaryMood::Neutral => "neutral",
            PrimaryMood::Mixed => "mixed",
            PrimaryMood::Ambiguous => "ambiguous",
        }
    }

    /// Index into the one-hot mood vector used by similarity scoring.
    pub fn one_hot_index(&self) -> usize {
        match self {
            PrimaryMood::Positive => 0,
            PrimaryMood::Negative => 1,
            PrimaryMood::Neutral => 2,
            PrimaryMood::Mixed => 3,
            PrimaryMood::Ambiguous => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionalMarker {
    pub phrase: String,
    pub strength: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionalContext {
    pub primary_mood: PrimaryMood,
    /// Affective intensity in `[1, 10]`.
    pub intensity: f64,
    /// Valence in `[-1, 1]`.
    pub valence: f64,
    pub themes: BTreeSet<String>,
    #[serde(default)]
    pub emotional_markers: Vec<EmotionalMarker>,
    #[serde(default)]
    pub contextual_events: Vec<String>,
    #[serde(default)]
    pub temporal_patterns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionQuality {
    Positive,
    Neutral,
    Negative,
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDynamics {
    /// `[1, 10]`; `0.0` marks a field the model did not report.
    pub closeness: f64,
    pub tension: f64,
    pub supportiveness: f64,
    #[serde(default)]
    pub communication_patterns: Vec<String>,
    pub interaction_quality: InteractionQuality,
    /// `[0, 1]`.
    pub connection_strength: f64,
}

// ─── mood scoring ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoodFactorKind {
    Sentiment,
    Psychological,
    Relational,
    Conversational,
    Baseline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodFactor {
    pub kind: MoodFactorKind,
    pub weight: f64,
    #[serde(default)]
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaDirection {
    Positive,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaSignificance {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaKind {
    Sudden,
    Gradual,
    Repair,
    Spike,
    Sustained,
}

/// A labelled change in mood score between consecutive memories of
/// overlapping participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodDelta {
    pub previous_score: f64,
    pub current_score: f64,
    pub magnitude: f64,
    pub direction: DeltaDirection,
    pub significance: DeltaSignificance,
    pub kind: DeltaKind,
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodScore {
    /// `[0, 10]`; 5 is baseline.
    pub score: f64,
    pub confidence: f64,
    #[serde(default)]
    pub descriptors: Vec<String>,
    #[serde(default)]
    pub factors: Vec<MoodFactor>,
    #[serde(default)]
    pub delta: Option<MoodDelta>,
}

// ─── evidence & significance ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub source_message_id: String,
    pub excerpt: String,
    pub relevance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignificanceCategory {
    Low,
    Medium,
    High,
    Critical,
}

impl SignificanceCategory {
    pub fn from_overall(overall: f64) -> Self {
        if overall >= 8.0 {
            SignificanceCategory::Critical
        } else if overall >= 6.0 {
            SignificanceCategory::High
        } else if overall >= 4.0 {
            SignificanceCategory::Medium
        } else {
            SignificanceCategory::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SignificanceComponents {
    pub emotional_salience: f64,
    pub relationship_impact: f64,
    pub contextual_importance: f64,
    pub temporal_relevance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificanceScore {
    /// Weighted sum of the components, `[0, 10]`.
    pub overall: f64,
    pub components: SignificanceComponents,
    pub category: SignificanceCategory,
    /// Review ordering key: high for uncertain-yet-significant memories.
    pub validation_priority: f64,
    pub confidence: f64,
}

// ─── validation lifecycle ────────────────────────────────────────────────────

/// Validation state of a memory.  Declaration order doubles as strictness
/// order for the non-rejected states (`pending < needs-review <
/// auto-approved < human-approved`); the rejected states never merge.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationState {
    #[default]
    Pending,
    NeedsReview,
    AutoApproved,
    HumanApproved,
    AutoRejected,
    HumanRejected,
}

impl ValidationState {
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            ValidationState::AutoRejected | ValidationState::HumanRejected
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ValidationState::Pending | ValidationState::NeedsReview
        )
    }

    /// The stricter of two non-rejected states.  Callers must rule out
    /// rejection first; merging a rejected memory is blocked upstream.
    pub fn strictest(a: ValidationState, b: ValidationState) -> ValidationState {
        debug_assert!(!a.is_rejected() && !b.is_rejected());
        a.max(b)
    }
}

/// A human reviewer's verdict on a needs-review memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HumanDecision {
    Approve,
    Reject,
}

// ─── the memory record ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MemoryMetadata {
    pub model: String,
    pub prompt_version: String,
    pub batch_id: Uuid,
    /// Ids of near-duplicate memories folded into this one.
    #[serde(default)]
    pub merged_from: Vec<Uuid>,
}

/// A validated emotional memory.  Immutable after write; merges produce a
/// new record superseding the originals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: Uuid,
    pub source_message_ids: Vec<String>,
    pub participants: Vec<Participant>,
    pub emotional_context: EmotionalContext,
    pub relationship_dynamics: RelationshipDynamics,
    pub mood_score: MoodScore,
    pub significance: SignificanceScore,
    pub summary: String,
    pub evidence: Vec<EvidenceItem>,
    pub confidence: f64,
    pub validation: ValidationState,
    /// SHA-256 of the canonical signature; primary dedup key.
    pub content_hash: [u8; 32],
    pub extracted_at: DateTime<Utc>,
    pub metadata: MemoryMetadata,
}

impl Memory {
    /// Sorted distinct participant ids.
    pub fn participant_ids(&self) -> BTreeSet<String> {
        self.participants.iter().map(|p| p.id.clone()).collect()
    }

    pub fn content_hash_hex(&self) -> String {
        self.content_hash.iter().map(|b| format!("{b:02x}")).collect()
    }
}

// ─── batches ─────────────────────────────────────────────────────────────────

/// An ordered, non-empty group of messages submitted as one LLM request.
/// Immutable once emitted by the batch builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub conversation_id: String,
    pub messages: Vec<Message>,
    pub estimated_cost_tokens: usize,
    pub priority_score: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl Batch {
    /// Sorted distinct author ids.
    pub fn author_ids(&self) -> BTreeSet<String> {
        self.messages.iter().map(|m| m.author_id.clone()).collect()
    }

    pub fn message_ids(&self) -> BTreeSet<String> {
        self.messages.iter().map(|m| m.id.clone()).collect()
    }
}

// ─── clamping helpers ────────────────────────────────────────────────────────

pub fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Clamp to the ten-point scales used throughout the model.
pub fn clamp10(value: f64) -> f64 {
    value.clamp(0.0, 10.0)
}

/// Intensity and the relationship axes live in `[1, 10]`.
pub fn clamp_intensity(value: f64) -> f64 {
    value.clamp(1.0, 10.0)
}

pub fn clamp_valence(value: f64) -> f64 {
    value.clamp(-1.0, 1.0)
}

/// Round to one decimal, the precision kept by merge arithmetic.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
