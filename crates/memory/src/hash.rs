//! Canonical content signature and SHA-256 digest.
//!
//! The signature is the dedup identity of a memory: same mood, same
//! participants, same normalized summary, same themes ⇒ same hash, no matter
//! how the fields were ordered or spaced on the way in.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::schema::Memory;

/// Field separator inside the canonical signature.
const UNIT_SEPARATOR: char = '\u{1F}';

/// NFKC-normalize, lowercase, trim, and collapse internal whitespace.
pub fn normalize_summary(summary: &str) -> String {
    let folded: String = summary.nfkc().collect::<String>().to_lowercase();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Build the canonical signature string:
/// `mood ␟ sorted-participant-ids ␟ normalized-summary ␟ sorted-themes`.
pub fn canonical_signature(memory: &Memory) -> String {
    let participant_ids = memory
        .participant_ids()
        .into_iter()
        .collect::<Vec<_>>()
        .join(",");

    // BTreeSet iteration is already sorted.
    let themes = memory
        .emotional_context
        .themes
        .iter()
        .cloned()
        .collect::<Vec<_>>()
        .join(",");

    let mut signature = String::new();
    signature.push_str(memory.emotional_context.primary_mood.as_str());
    signature.push(UNIT_SEPARATOR);
    signature.push_str(&participant_ids);
    signature.push(UNIT_SEPARATOR);
    signature.push_str(&normalize_summary(&memory.summary));
    signature.push(UNIT_SEPARATOR);
    signature.push_str(&themes);
    signature
}

/// SHA-256 over the UTF-8 canonical signature.
pub fn content_hash(memory: &Memory) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(canonical_signature(memory).as_bytes());
    hasher.finalize().into()
}
