//! Batch construction: context-window segmentation, salience scoring, and
//! cost-bounded packing.
//!
//! No LLM calls happen here; salience comes from the cheap affect lexicon
//! so prioritization never spends budget.

use chrono::Duration;
use keepsake_config::{BatchConfig, PriorityMode};
use keepsake_memory::affect::affect_term_density;
use keepsake_memory::similarity::jaccard;
use keepsake_memory::{Batch, Message};
use std::collections::BTreeSet;
use tracing::{debug, warn};
use uuid::Uuid;

/// Tokens budgeted for prompt scaffolding around the rendered messages.
pub const PROMPT_SCAFFOLD_TOKENS: usize = 350;

/// Messages peeked past a candidate boundary for the author-shift check.
const AUTHOR_LOOKAHEAD: usize = 5;

#[derive(Debug, Clone)]
pub struct BatchBuilder {
    config: BatchConfig,
}

impl BatchBuilder {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// Build the batch sequence for one conversation's ordered messages.
    pub fn build(&self, messages: &[Message]) -> Vec<Batch> {
        if messages.is_empty() {
            return Vec::new();
        }

        let windows = self.segment(messages);
        let packed = self.pack(windows);

        let mut batches: Vec<Batch> = packed
            .into_iter()
            .filter_map(|msgs| self.finish_batch(msgs))
            .collect();

        match self.config.priority_mode {
            PriorityMode::Quality => {
                batches.sort_by(|a, b| b.priority_score.total_cmp(&a.priority_score));
            }
            PriorityMode::Throughput => {}
            PriorityMode::Cost => {
                batches.sort_by(|a, b| {
                    a.estimated_cost_tokens
                        .cmp(&b.estimated_cost_tokens)
                        .then(a.window_start.cmp(&b.window_start))
                });
            }
        }

        debug!(
            batches = batches.len(),
            mode = ?self.config.priority_mode,
            "batch sequence built"
        );
        batches
    }

    /// Segment into context windows: a new window starts on a long silence,
    /// a material author-set shift, or a token overflow.
    pub(crate) fn segment(&self, messages: &[Message]) -> Vec<Vec<Message>> {
        let gap = Duration::minutes(self.config.context_gap_minutes);
        let mut windows: Vec<Vec<Message>> = Vec::new();
        let mut current: Vec<Message> = Vec::new();
        let mut current_tokens = 0usize;
        let mut current_authors: BTreeSet<String> = BTreeSet::new();

        for (index, message) in messages.iter().enumerate() {
            let tokens = estimate_message_tokens(message);
            let boundary = if let Some(last) = current.last() {
                let silence = message.timestamp - last.timestamp > gap;
                let overflow =
                    current_tokens + tokens > self.config.token_budget_per_request;
                let lookahead: BTreeSet<String> = messages
                    [index..messages.len().min(index + AUTHOR_LOOKAHEAD)]
                    .iter()
                    .map(|m| m.author_id.clone())
                    .collect();
                let author_shift = jaccard(&current_authors, &lookahead) < 0.5;
                silence || overflow || author_shift
            } else {
                false
            };

            if boundary {
                windows.push(std::mem::take(&mut current));
                current_tokens = 0;
                current_authors.clear();
            }

            current_tokens += tokens;
            current_authors.insert(message.author_id.clone());
            current.push(message.clone());
        }
        if !current.is_empty() {
            windows.push(current);
        }
        windows
    }

    /// Pack windows into batches of `batch_min..=batch_max` messages,
    /// preserving order.  The trailing remainder may fall short of the
    /// minimum; messages are never invented to pad it.
    fn pack(&self, windows: Vec<Vec<Message>>) -> Vec<Vec<Message>> {
        let mut batches: Vec<Vec<Message>> = Vec::new();
        let mut current: Vec<Message> = Vec::new();

        for window in windows {
            let chunks = if window.len() > self.config.batch_max {
                split_on_speaker_boundaries(window, self.config.batch_max)
            } else {
                vec![window]
            };

            for chunk in chunks {
                if !current.is_empty() && current.len() + chunk.len() > self.config.batch_max {
                    batches.push(std::mem::take(&mut current));
                }
                current.extend(chunk);
                if current.len() >= self.config.batch_min {
                    batches.push(std::mem::take(&mut current));
                }
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }

        // Enforce the per-request token budget, splitting on speaker
        // boundaries until every batch fits.
        let budget = self.config.token_budget_per_request;
        let mut bounded: Vec<Vec<Message>> = Vec::new();
        let mut queue: Vec<Vec<Message>> = batches;
        queue.reverse();
        while let Some(batch) = queue.pop() {
            if estimate_batch_tokens(&batch) <= budget {
                bounded.push(batch);
                continue;
            }
            if batch.len() <= 1 {
                warn!(
                    tokens = estimate_batch_tokens(&batch),
                    budget, "single message exceeds the request token budget; skipped"
                );
                continue;
            }
            let midpoint = batch.len() / 2;
            let cut = nearest_speaker_boundary(&batch, midpoint);
            let (head, tail) = batch.split_at(cut);
            queue.push(tail.to_vec());
            queue.push(head.to_vec());
        }
        bounded
    }

    fn finish_batch(&self, messages: Vec<Message>) -> Option<Batch> {
        let first = messages.first()?;
        let last = messages.last()?;
        Some(Batch {
            id: Uuid::new_v4(),
            conversation_id: first.conversation_id.clone(),
            window_start: first.timestamp,
            window_end: last.timestamp,
            estimated_cost_tokens: estimate_batch_tokens(&messages),
            priority_score: salience(&messages),
            messages,
        })
    }
}

/// Emotional salience heuristic: affect term density scaled by turn count
/// and participant count.
pub fn salience(messages: &[Message]) -> f64 {
    if messages.is_empty() {
        return 0.0;
    }
    let joined = messages
        .iter()
        .map(|m| m.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let authors: BTreeSet<&str> = messages.iter().map(|m| m.author_id.as_str()).collect();

    let density = affect_term_density(&joined);
    let turn_factor = 1.0 + (messages.len() as f64 / 50.0).min(1.0);
    let participant_factor = 1.0 + 0.1 * (authors.len().saturating_sub(1)) as f64;
    density * 10.0 * turn_factor * participant_factor
}

/// Split an in-flight batch in two for oversize recovery.  The cut lands on
/// the speaker change nearest the midpoint.
pub fn split_batch(batch: &Batch) -> Option<(Batch, Batch)> {
    if batch.messages.len() < 2 {
        return None;
    }
    let cut = nearest_speaker_boundary(&batch.messages, batch.messages.len() / 2);
    let (head, tail) = batch.messages.split_at(cut);
    Some((rebatch(batch, head.to_vec())?, rebatch(batch, tail.to_vec())?))
}

fn rebatch(original: &Batch, messages: Vec<Message>) -> Option<Batch> {
    let first = messages.first()?;
    let last = messages.last()?;
    Some(Batch {
        id: Uuid::new_v4(),
        conversation_id: original.conversation_id.clone(),
        window_start: first.timestamp,
        window_end: last.timestamp,
        estimated_cost_tokens: estimate_batch_tokens(&messages),
        priority_score: salience(&messages),
        messages,
    })
}

/// Index of the speaker change closest to `target` (never 0 or `len`).
fn nearest_speaker_boundary(messages: &[Message], target: usize) -> usize {
    let mut best = target.clamp(1, messages.len() - 1);
    let mut best_distance = usize::MAX;
    for i in 1..messages.len() {
        if messages[i].author_id != messages[i - 1].author_id {
            let distance = i.abs_diff(target);
            if distance < best_distance {
                best = i;
                best_distance = distance;
            }
        }
    }
    best
}

/// Split a window into chunks no larger than `max`, cutting on speaker
/// changes where possible.
fn split_on_speaker_boundaries(window: Vec<Message>, max: usize) -> Vec<Vec<Message>> {
    let mut chunks = Vec::new();
    let mut rest = window;
    while rest.len() > max {
        let cut = nearest_speaker_boundary(&rest, max);
        let tail = rest.split_off(cut);
        chunks.push(std::mem::replace(&mut rest, tail));
    }
    if !rest.is_empty() {
        chunks.push(rest);
    }
    chunks
}

/// Rough size of one rendered message: chars/4 plus line framing.
pub fn estimate_message_tokens(message: &Message) -> usize {
    message.text.chars().count() / 4 + 8
}

pub fn estimate_batch_tokens(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(estimate_message_tokens)
        .sum::<usize>()
        + PROMPT_SCAFFOLD_TOKENS
}
