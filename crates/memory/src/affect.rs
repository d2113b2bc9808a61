//! Heuristic affect signals over raw message text.
//!
//! These are deliberately cheap lexicon lookups: the batch builder uses them
//! to rank context windows *before* any LLM spend, and the significance
//! analyzer uses them to bump scores for high-impact language.  Rough signal
//! is the goal, not a sentiment model.

const POSITIVE_TERMS: &[&str] = &[
    "love", "loved", "happy", "grateful", "thankful", "proud", "excited",
    "relieved", "hopeful", "joy", "wonderful", "amazing", "better", "calm",
    "safe", "supported", "warm", "glad", "forgive", "forgave", "apology",
    "apologized", "sorry", "reconciled", "hug", "laughed", "celebrate",
];

const NEGATIVE_TERMS: &[&str] = &[
    "sad", "angry", "furious", "hurt", "scared", "afraid", "anxious",
    "worried", "lonely", "ashamed", "guilty", "exhausted", "overwhelmed",
    "hopeless", "cried", "crying", "fight", "fought", "argument", "yelled",
    "ignored", "betrayed", "jealous", "resent", "hate", "miserable", "upset",
];

/// Lexemes that mark an episode as high-impact regardless of polarity.
const HIGH_IMPACT_TERMS: &[&str] = &[
    "grief", "grieving", "crisis", "breakthrough", "euphoric", "devastated",
    "heartbroken", "diagnosis", "funeral", "divorce", "miscarriage", "relapse",
    "panic", "trauma",
];

/// Markers of contextual urgency.
const URGENCY_TERMS: &[&str] = &[
    "urgent", "emergency", "immediately", "now", "help", "please", "tonight",
    "hospital", "cant", "can't",
];

/// Markers of emotional vulnerability and disclosure.
const VULNERABILITY_TERMS: &[&str] = &[
    "scared", "ashamed", "vulnerable", "lonely", "confess", "admit", "secret",
    "embarrassed", "afraid", "crying", "honest", "trust",
];

const NEGATION_TOKENS: &[&str] = &["not", "no", "never", "without"];

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fraction of tokens that carry affect (positive, negative, or high-impact).
/// Returns `[0, 1]`; empty text scores 0.
pub fn affect_term_density(text: &str) -> f64 {
    let words = tokens(text);
    if words.is_empty() {
        return 0.0;
    }
    let hits = words
        .iter()
        .filter(|w| {
            POSITIVE_TERMS.contains(&w.as_str())
                || NEGATIVE_TERMS.contains(&w.as_str())
                || HIGH_IMPACT_TERMS.contains(&w.as_str())
        })
        .count();
    hits as f64 / words.len() as f64
}

pub fn has_high_impact_lexeme(text: &str) -> bool {
    tokens(text).iter().any(|w| HIGH_IMPACT_TERMS.contains(&w.as_str()))
}

/// Share of urgency markers, capped at 1.
pub fn urgency_score(text: &str) -> f64 {
    let words = tokens(text);
    if words.is_empty() {
        return 0.0;
    }
    let hits = words.iter().filter(|w| URGENCY_TERMS.contains(&w.as_str())).count();
    ((hits as f64) * 0.25).min(1.0)
}

pub fn has_vulnerability_marker(text: &str) -> bool {
    tokens(text).iter().any(|w| VULNERABILITY_TERMS.contains(&w.as_str()))
}

/// Infer a rough valence in `[-1, 1]` from keyword polarity.
///
/// A 2-word lookback window flips the contribution of negated terms so that
/// "not angry" does not read as negative.
pub fn infer_valence(text: &str) -> f64 {
    let words = tokens(text);
    let mut score: f64 = 0.0;

    for (i, word) in words.iter().enumerate() {
        let negated = (i > 0 && NEGATION_TOKENS.contains(&words[i - 1].as_str()))
            || (i > 1 && NEGATION_TOKENS.contains(&words[i - 2].as_str()));

        if POSITIVE_TERMS.contains(&word.as_str()) {
            score += if negated { -0.10 } else { 0.15 };
        } else if NEGATIVE_TERMS.contains(&word.as_str()) {
            score += if negated { 0.10 } else { -0.15 };
        }
    }

    score.clamp(-1.0, 1.0)
}
