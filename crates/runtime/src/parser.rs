//! Tolerant response parsing and structural validation.
//!
//! The parser never panics on model output.  It extracts the outermost JSON
//! object, walks the `memories` array, clamps numeric ranges, enforces the
//! evidence-links-to-sources invariant, and returns a [`ParseResult`] sum
//! type that downstream stages pattern-match on.

use chrono::Utc;
use keepsake_llm::extract_json_object;
use keepsake_memory::{
    Batch, EmotionalContext, EmotionalMarker, EvidenceItem, Memory, MemoryMetadata, MoodFactor,
    MoodFactorKind, MoodScore, Participant, ParticipantRole, PrimaryMood, RelationshipDynamics,
    SignificanceCategory, SignificanceComponents, SignificanceScore, ValidationState,
};
use keepsake_memory::schema::{clamp_intensity, clamp_valence, clamp01, clamp10};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::ParseFailKind;
use crate::prompt_builder::PROMPT_VERSION;

/// Outcome of parsing one LLM response.
#[derive(Debug)]
pub enum ParseResult {
    /// Valid memories plus the reasons for any individually dropped ones.
    Parsed {
        memories: Vec<Memory>,
        dropped: Vec<String>,
    },
    Failed {
        kind: ParseFailKind,
        detail: String,
    },
}

// ─── wire drafts ─────────────────────────────────────────────────────────────
// Unknown fields are ignored by default; missing fields take these defaults.

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    memories: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MemoryDraft {
    summary: String,
    source_message_ids: Vec<String>,
    participants: Vec<ParticipantDraft>,
    emotional_context: EmotionalContextDraft,
    relationship_dynamics: RelationshipDraft,
    mood_score: MoodDraft,
    evidence: Vec<EvidenceDraft>,
    confidence: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ParticipantDraft {
    id: String,
    display_name: String,
    role: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct EmotionalContextDraft {
    primary_mood: String,
    intensity: f64,
    valence: f64,
    themes: Vec<String>,
    emotional_markers: Vec<MarkerDraft>,
    contextual_events: Vec<String>,
    temporal_patterns: Vec<String>,
}

impl Default for EmotionalContextDraft {
    fn default() -> Self {
        Self {
            primary_mood: "neutral".to_string(),
            intensity: 1.0,
            valence: 0.0,
            themes: Vec::new(),
            emotional_markers: Vec::new(),
            contextual_events: Vec::new(),
            temporal_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MarkerDraft {
    phrase: String,
    strength: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RelationshipDraft {
    closeness: f64,
    tension: f64,
    supportiveness: f64,
    communication_patterns: Vec<String>,
    interaction_quality: String,
    connection_strength: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MoodDraft {
    score: f64,
    confidence: f64,
    descriptors: Vec<String>,
    factors: Vec<FactorDraft>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FactorDraft {
    kind: String,
    weight: f64,
    evidence: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EvidenceDraft {
    source_message_id: String,
    excerpt: String,
    relevance: f64,
}

// ─── entry point ─────────────────────────────────────────────────────────────

/// Parse one raw LLM reply against the batch it answers.
pub fn parse_response(content: &str, batch: &Batch, model: &str) -> ParseResult {
    let Some(object) = extract_json_object(content) else {
        return ParseResult::Failed {
            kind: ParseFailKind::ParseFail,
            detail: "no JSON object found in response".to_string(),
        };
    };

    let envelope: ResponseEnvelope = match serde_json::from_str(object) {
        Ok(envelope) => envelope,
        Err(err) => {
            return ParseResult::Failed {
                kind: ParseFailKind::ParseFail,
                detail: format!("extracted object is not valid JSON: {err}"),
            };
        }
    };

    let Some(raw_memories) = envelope.memories else {
        return ParseResult::Failed {
            kind: ParseFailKind::SchemaFail,
            detail: "top-level `memories` array is missing".to_string(),
        };
    };

    let mut memories = Vec::new();
    let mut dropped = Vec::new();
    let total = raw_memories.len();

    for (index, raw) in raw_memories.into_iter().enumerate() {
        let draft: MemoryDraft = match serde_json::from_value(raw) {
            Ok(draft) => draft,
            Err(err) => {
                dropped.push(format!("memory[{index}]: not an object ({err})"));
                continue;
            }
        };
        match materialize(draft, batch, model) {
            Ok(memory) => memories.push(memory),
            Err(reason) => {
                warn!(index, reason = %reason, "memory dropped during validation");
                dropped.push(format!("memory[{index}]: {reason}"));
            }
        }
    }

    // The model produced memory objects but none survived validation: treat
    // as a schema failure so the tightened re-request can run.
    if total > 0 && memories.is_empty() {
        return ParseResult::Failed {
            kind: ParseFailKind::SchemaFail,
            detail: dropped.join("; "),
        };
    }

    ParseResult::Parsed { memories, dropped }
}

/// Turn a draft into a full memory, or explain why it cannot be one.
fn materialize(draft: MemoryDraft, batch: &Batch, model: &str) -> Result<Memory, String> {
    let summary = draft.summary.trim().to_string();
    if summary.is_empty() {
        return Err("summary is missing or empty".to_string());
    }

    let batch_ids = batch.message_ids();
    let mut source_message_ids: Vec<String> = draft
        .source_message_ids
        .into_iter()
        .filter(|id| batch_ids.contains(id))
        .collect();
    source_message_ids.sort();
    source_message_ids.dedup();
    if source_message_ids.is_empty() {
        return Err("no source message id resolves to this batch".to_string());
    }

    let participants = if draft.participants.is_empty() {
        // Fall back to the batch roster when the model omits participants.
        batch
            .author_ids()
            .into_iter()
            .map(|id| Participant {
                display_name: id.clone(),
                id,
                role: ParticipantRole::Other,
            })
            .collect()
    } else {
        draft
            .participants
            .into_iter()
            .filter(|p| !p.id.trim().is_empty())
            .map(|p| Participant {
                display_name: if p.display_name.trim().is_empty() {
                    p.id.clone()
                } else {
                    p.display_name
                },
                role: parse_role(&p.role),
                id: p.id,
            })
            .collect()
    };

    let emotional_context = EmotionalContext {
        primary_mood: parse_mood(&draft.emotional_context.primary_mood),
        intensity: clamp_intensity(draft.emotional_context.intensity),
        valence: clamp_valence(draft.emotional_context.valence),
        themes: draft
            .emotional_context
            .themes
            .into_iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect(),
        emotional_markers: draft
            .emotional_context
            .emotional_markers
            .into_iter()
            .filter(|m| !m.phrase.trim().is_empty())
            .map(|m| EmotionalMarker {
                phrase: m.phrase,
                strength: clamp01(m.strength),
            })
            .collect(),
        contextual_events: draft.emotional_context.contextual_events,
        temporal_patterns: draft.emotional_context.temporal_patterns,
    };

    let dynamics = draft.relationship_dynamics;
    let clamp_axis = |v: f64| if v > 0.0 { v.clamp(1.0, 10.0) } else { 0.0 };
    let relationship_dynamics = RelationshipDynamics {
        closeness: clamp_axis(dynamics.closeness),
        tension: clamp_axis(dynamics.tension),
        supportiveness: clamp_axis(dynamics.supportiveness),
        communication_patterns: dynamics.communication_patterns,
        interaction_quality: parse_quality(&dynamics.interaction_quality),
        connection_strength: clamp01(dynamics.connection_strength),
    };

    let mood_score = MoodScore {
        score: clamp10(draft.mood_score.score),
        confidence: clamp01(draft.mood_score.confidence),
        descriptors: draft.mood_score.descriptors,
        factors: draft
            .mood_score
            .factors
            .into_iter()
            .filter_map(|f| {
                parse_factor_kind(&f.kind).map(|kind| MoodFactor {
                    kind,
                    weight: clamp01(f.weight),
                    evidence: f.evidence,
                })
            })
            .collect(),
        delta: None,
    };

    // Evidence must point inside the memory's own sources.
    let evidence: Vec<EvidenceItem> = draft
        .evidence
        .into_iter()
        .filter(|e| source_message_ids.contains(&e.source_message_id))
        .map(|e| EvidenceItem {
            source_message_id: e.source_message_id,
            excerpt: e.excerpt,
            relevance: clamp01(e.relevance),
        })
        .collect();

    let mut memory = Memory {
        id: Uuid::new_v4(),
        source_message_ids,
        participants,
        emotional_context,
        relationship_dynamics,
        mood_score,
        significance: placeholder_significance(),
        summary,
        evidence,
        confidence: clamp01(draft.confidence),
        validation: ValidationState::Pending,
        content_hash: [0; 32],
        extracted_at: Utc::now(),
        metadata: MemoryMetadata {
            model: model.to_string(),
            prompt_version: PROMPT_VERSION.to_string(),
            batch_id: batch.id,
            merged_from: Vec::new(),
        },
    };
    memory.content_hash = keepsake_memory::content_hash(&memory);
    Ok(memory)
}

/// Significance is computed downstream; parsing seeds a neutral placeholder.
fn placeholder_significance() -> SignificanceScore {
    SignificanceScore {
        overall: 0.0,
        components: SignificanceComponents::default(),
        category: SignificanceCategory::Low,
        validation_priority: 0.0,
        confidence: 0.0,
    }
}

fn parse_mood(raw: &str) -> PrimaryMood {
    match raw.trim().to_lowercase().as_str() {
        "positive" => PrimaryMood::Positive,
        "negative" => PrimaryMood::Negative,
        "mixed" => PrimaryMood::Mixed,
        "ambiguous" => PrimaryMood::Ambiguous,
        _ => PrimaryMood::Neutral,
    }
}

fn parse_role(raw: &str) -> ParticipantRole {
    match raw.trim().to_lowercase().as_str() {
        "self" => ParticipantRole::Own,
        "partner" => ParticipantRole::Partner,
        "family" => ParticipantRole::Family,
        "friend" => ParticipantRole::Friend,
        "colleague" => ParticipantRole::Colleague,
        "professional" => ParticipantRole::Professional,
        _ => ParticipantRole::Other,
    }
}

fn parse_quality(raw: &str) -> keepsake_memory::InteractionQuality {
    use keepsake_memory::InteractionQuality::*;
    match raw.trim().to_lowercase().as_str() {
        "positive" => Positive,
        "negative" => Negative,
        "mixed" => Mixed,
        _ => Neutral,
    }
}

fn parse_factor_kind(raw: &str) -> Option<MoodFactorKind> {
    use MoodFactorKind::*;
    match raw.trim().to_lowercase().as_str() {
        "sentiment" => Some(Sentiment),
        "psychological" => Some(Psychological),
        "relational" => Some(Relational),
        "conversational" => Some(Conversational),
        "baseline" => Some(Baseline),
        _ => None,
    }
}
