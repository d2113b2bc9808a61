//! Shared constructors for unit tests.

use chrono::{Duration, TimeZone, Utc};
use uuid::Uuid;

use crate::hash::content_hash;
use crate::schema::{
    EmotionalContext, EvidenceItem, InteractionQuality, Memory, MemoryMetadata, Message,
    MoodScore, Participant, ParticipantRole, PrimaryMood, RelationshipDynamics,
    SignificanceCategory, SignificanceComponents, SignificanceScore, ValidationState,
};

pub fn sample_mood(score: f64, confidence: f64) -> MoodScore {
    MoodScore {
        score,
        confidence,
        descriptors: vec!["warm".to_string()],
        factors: Vec::new(),
        delta: None,
    }
}

/// A fully-populated memory with a recomputed content hash.  The fixed
/// timestamp keeps hash and similarity assertions reproducible.
pub fn sample_memory(summary: &str, participant_ids: &[&str], confidence: f64) -> Memory {
    let participants = participant_ids
        .iter()
        .map(|id| Participant {
            id: (*id).to_string(),
            display_name: format!("Person {id}"),
            role: ParticipantRole::Friend,
        })
        .collect();

    let mut memory = Memory {
        id: Uuid::new_v4(),
        source_message_ids: vec!["m1".to_string()],
        participants,
        emotional_context: EmotionalContext {
            primary_mood: PrimaryMood::Positive,
            intensity: 7.0,
            valence: 0.6,
            themes: ["apology".to_string()].into(),
            emotional_markers: Vec::new(),
            contextual_events: Vec::new(),
            temporal_patterns: Vec::new(),
        },
        relationship_dynamics: RelationshipDynamics {
            closeness: 7.0,
            tension: 3.0,
            supportiveness: 8.0,
            communication_patterns: Vec::new(),
            interaction_quality: InteractionQuality::Positive,
            connection_strength: 0.8,
        },
        mood_score: sample_mood(7.0, 0.8),
        significance: SignificanceScore {
            overall: 5.0,
            components: SignificanceComponents::default(),
            category: SignificanceCategory::Medium,
            validation_priority: 0.0,
            confidence: 0.8,
        },
        summary: summary.to_string(),
        evidence: vec![EvidenceItem {
            source_message_id: "m1".to_string(),
            excerpt: "an excerpt".to_string(),
            relevance: 0.7,
        }],
        confidence,
        validation: ValidationState::Pending,
        content_hash: [0; 32],
        extracted_at: Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap(),
        metadata: MemoryMetadata::default(),
    };
    memory.content_hash = content_hash(&memory);
    memory
}

/// Messages one minute apart, ids `msg-0`, `msg-1`, …
pub fn sample_messages(conversation_id: &str, authors: &[&str]) -> Vec<Message> {
    let start = Utc.with_ymd_and_hms(2026, 3, 14, 11, 0, 0).unwrap();
    authors
        .iter()
        .enumerate()
        .map(|(i, author)| Message {
            id: format!("msg-{i}"),
            conversation_id: conversation_id.to_string(),
            author_id: (*author).to_string(),
            timestamp: start + Duration::minutes(i as i64),
            text: format!("message {i} from {author}"),
        })
        .collect()
}
