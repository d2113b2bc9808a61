//! Deterministic extraction-prompt assembly.
//!
//! Section order is fixed (roster, conversation window, analysis directive,
//! output schema) and the prompt version is stamped into every memory's
//! metadata so an extraction can be reproduced later.

use keepsake_memory::Batch;

/// Bumped whenever prompt layout or the output contract changes.
pub const PROMPT_VERSION: &str = "keepsake-extract/1";

/// Suffix appended on parse-failure re-requests.
pub const TIGHTEN_SUFFIX: &str = "\n\nReturn only valid JSON matching the schema.";

/// Assemble the extraction prompt for one batch.  Pure function of the
/// batch contents: identical batches produce identical prompts.
pub fn build_extraction_prompt(batch: &Batch) -> String {
    let roster_block = build_roster_block(batch);
    let window_block = build_window_block(batch);

    format!(
        "You are an emotional-memory analyst. Read the conversation window \
below and extract the emotionally meaningful memories it contains.\n\n\
PARTICIPANTS:\n{roster_block}\n\n\
CONVERSATION WINDOW ({count} messages):\n{window_block}\n\n\
ANALYSIS DIRECTIVE — for every memory report:\n\
1. primary mood (positive | negative | neutral | mixed | ambiguous), intensity 1-10, valence -1..1\n\
2. themes: short lowercase identifiers\n\
3. relationship dynamics: closeness 1-10, tension 1-10, supportiveness 1-10, \
interaction quality, connection strength 0-1\n\
4. mood score 0-10 with descriptors and contributing factors\n\
5. evidence: verbatim excerpts with their source message ids and relevance 0-1\n\
6. your confidence 0-1 in the extraction\n\n\
OUTPUT SCHEMA — reply with a single top-level JSON object:\n\
{{\"memories\": [{{\n\
  \"summary\": \"one or two sentences\",\n\
  \"source_message_ids\": [\"...\"],\n\
  \"participants\": [{{\"id\": \"...\", \"display_name\": \"...\", \"role\": \"self|partner|family|friend|colleague|professional|other\"}}],\n\
  \"emotional_context\": {{\"primary_mood\": \"...\", \"intensity\": 0, \"valence\": 0, \"themes\": [\"...\"], \"emotional_markers\": [{{\"phrase\": \"...\", \"strength\": 0}}]}},\n\
  \"relationship_dynamics\": {{\"closeness\": 0, \"tension\": 0, \"supportiveness\": 0, \"interaction_quality\": \"positive|neutral|negative|mixed\", \"connection_strength\": 0}},\n\
  \"mood_score\": {{\"score\": 0, \"confidence\": 0, \"descriptors\": [\"...\"], \"factors\": [{{\"kind\": \"sentiment|psychological|relational|conversational|baseline\", \"weight\": 0, \"evidence\": [\"...\"]}}]}},\n\
  \"evidence\": [{{\"source_message_id\": \"...\", \"excerpt\": \"...\", \"relevance\": 0}}],\n\
  \"confidence\": 0\n\
}}]}}\n\
Do not wrap the object in markdown or add commentary.",
        count = batch.messages.len(),
    )
}

fn build_roster_block(batch: &Batch) -> String {
    batch
        .author_ids()
        .into_iter()
        .map(|id| format!("- {id}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_window_block(batch: &Batch) -> String {
    batch
        .messages
        .iter()
        .map(|m| {
            format!(
                "[{id}] {ts} — {author}: {text}",
                id = m.id,
                ts = m.timestamp.to_rfc3339(),
                author = m.author_id,
                text = m.text,
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use keepsake_memory::Message;
    use uuid::Uuid;

    fn batch() -> Batch {
        let start = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap();
        let messages = vec![
            Message {
                id: "m1".into(),
                conversation_id: "conv".into(),
                author_id: "alice".into(),
                timestamp: start,
                text: "I'm sorry about yesterday".into(),
            },
            Message {
                id: "m2".into(),
                conversation_id: "conv".into(),
                author_id: "bob".into(),
                timestamp: start + chrono::Duration::minutes(2),
                text: "Thank you, that means a lot".into(),
            },
        ];
        Batch {
            id: Uuid::new_v4(),
            conversation_id: "conv".into(),
            window_start: messages[0].timestamp,
            window_end: messages[1].timestamp,
            estimated_cost_tokens: 400,
            priority_score: 1.0,
            messages,
        }
    }

    #[test]
    fn prompt_is_deterministic() {
        let b = batch();
        assert_eq!(build_extraction_prompt(&b), build_extraction_prompt(&b));
    }

    #[test]
    fn sections_appear_in_fixed_order() {
        let prompt = build_extraction_prompt(&batch());
        let roster = prompt.find("PARTICIPANTS:").unwrap();
        let window = prompt.find("CONVERSATION WINDOW").unwrap();
        let directive = prompt.find("ANALYSIS DIRECTIVE").unwrap();
        let schema = prompt.find("OUTPUT SCHEMA").unwrap();
        assert!(roster < window && window < directive && directive < schema);
    }

    #[test]
    fn roster_lists_distinct_authors_sorted() {
        let prompt = build_extraction_prompt(&batch());
        let roster_start = prompt.find("- alice").unwrap();
        let bob = prompt.find("- bob").unwrap();
        assert!(roster_start < bob);
    }

    #[test]
    fn window_renders_timestamp_author_text() {
        let prompt = build_extraction_prompt(&batch());
        assert!(prompt.contains("alice: I'm sorry about yesterday"));
        assert!(prompt.contains("[m2]"));
        assert!(prompt.contains("2026-03-14T09:00:00+00:00"));
    }

    #[test]
    fn schema_stanza_demands_a_memories_object() {
        let prompt = build_extraction_prompt(&batch());
        assert!(prompt.contains("{\"memories\": ["));
    }
}
