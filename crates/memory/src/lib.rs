pub mod affect;
pub mod confidence;
pub mod confirm;
pub mod dedup;
pub mod hash;
pub mod journal;
pub mod schema;
pub mod significance;
pub mod similarity;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use confidence::ConfidenceBreakdown;
pub use confirm::{AdaptiveThresholds, FeedbackCounts, RoutingCounts};
pub use dedup::{DedupError, DedupOutcome};
pub use hash::{canonical_signature, content_hash, normalize_summary};
pub use journal::JournalStore;
pub use schema::{
    Batch, DeltaDirection, DeltaKind, DeltaSignificance, EmotionalContext, EmotionalMarker,
    EvidenceItem, HumanDecision, InteractionQuality, Memory, MemoryMetadata, Message, MoodDelta,
    MoodFactor, MoodFactorKind, MoodScore, Participant, ParticipantRole, PrimaryMood,
    RelationshipDynamics, SignificanceCategory, SignificanceComponents, SignificanceScore,
    ValidationState,
};
pub use significance::{MOOD_DELTA_LOOKBACK_HOURS, PriorMood};
pub use similarity::SimilarityScore;
pub use store::{
    BatchOutcome, BatchStatus, InMemoryStore, MemoryStore, MessageStore, StaticMessageStore,
    StoreError, UpsertOutcome,
};
