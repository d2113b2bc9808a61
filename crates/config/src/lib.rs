use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Hard spend ceiling in USD.  `None` means unlimited.
    pub max_usd: Option<f64>,
    /// Price used for pre-call cost estimation, USD per 1 000 tokens.
    pub usd_per_1k_tokens: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_usd: None,
            usd_per_1k_tokens: 0.002,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    pub requests_per_second: f64,
    pub request_burst: u32,
    pub request_timeout_seconds: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 1.0,
            request_burst: 5,
            request_timeout_seconds: 60,
        }
    }
}

/// How the batch builder orders emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PriorityMode {
    /// Highest emotional salience first.
    #[default]
    Quality,
    /// Chronological order.
    Throughput,
    /// Cheapest estimated batches first.
    Cost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_min: usize,
    pub batch_max: usize,
    pub token_budget_per_request: usize,
    pub context_gap_minutes: i64,
    pub priority_mode: PriorityMode,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_min: 20,
            batch_max: 200,
            token_budget_per_request: 8000,
            context_gap_minutes: 30,
            priority_mode: PriorityMode::Quality,
        }
    }
}

/// The three numbers that route a memory to auto-approve, review, or
/// auto-reject.  Invariant: `auto_reject < review_lower <= auto_approve`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub auto_approve: f64,
    pub auto_reject: f64,
    pub review_lower: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            auto_approve: 0.75,
            auto_reject: 0.30,
            review_lower: 0.50,
        }
    }
}

impl ThresholdConfig {
    pub fn is_valid(&self) -> bool {
        self.auto_reject < self.review_lower && self.review_lower <= self.auto_approve
    }

    pub fn validate(&self) -> Result<()> {
        if !self.is_valid() {
            bail!(
                "threshold ordering violated: auto_reject ({}) < review_lower ({}) <= auto_approve ({}) must hold",
                self.auto_reject,
                self.review_lower,
                self.auto_approve,
            );
        }
        Ok(())
    }
}

/// Weights for the four significance components.  Must sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SignificanceWeights {
    pub emotional_salience: f64,
    pub relationship_impact: f64,
    pub contextual_importance: f64,
    pub temporal_relevance: f64,
}

impl Default for SignificanceWeights {
    fn default() -> Self {
        Self {
            emotional_salience: 0.30,
            relationship_impact: 0.30,
            contextual_importance: 0.20,
            temporal_relevance: 0.20,
        }
    }
}

impl SignificanceWeights {
    pub fn sum(&self) -> f64 {
        self.emotional_salience
            + self.relationship_impact
            + self.contextual_importance
            + self.temporal_relevance
    }

    pub fn validate(&self) -> Result<()> {
        if (self.sum() - 1.0).abs() > 1e-6 {
            bail!("significance weights must sum to 1, got {}", self.sum());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    pub duplicate_at: f64,
    pub near_duplicate_at: f64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            duplicate_at: 0.85,
            near_duplicate_at: 0.70,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub rate_limit_max_attempts: u32,
    pub rate_limit_base_ms: u64,
    pub rate_limit_cap_ms: u64,
    pub transport_max_attempts: u32,
    pub transport_base_ms: u64,
    pub transport_cap_ms: u64,
    pub parse_max_attempts: u32,
    /// Fractional jitter applied to every backoff sleep (0.20 = ±20%).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            rate_limit_max_attempts: 6,
            rate_limit_base_ms: 1000,
            rate_limit_cap_ms: 60_000,
            transport_max_attempts: 4,
            transport_base_ms: 1000,
            transport_cap_ms: 30_000,
            parse_max_attempts: 2,
            jitter_fraction: 0.20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible chat-completions endpoint.
    pub base_url: String,
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "llama3.1:8b".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub budget: BudgetConfig,
    pub rate: RateConfig,
    pub batch: BatchConfig,
    pub thresholds: ThresholdConfig,
    pub significance: SignificanceWeights,
    pub similarity: SimilarityConfig,
    pub retry: RetryConfig,
    pub llm: LlmConfig,
    /// Worker pool size.  `0` resolves to `min(num_cpu, 8)` at start.
    pub worker_count: usize,
}

impl EngineConfig {
    /// Resolve the effective worker pool size.
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count > 0 {
            return self.worker_count;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cpus.min(8)
    }

    /// Load from a TOML file, falling back to defaults when the file is
    /// absent.  Environment variables override file values afterwards.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading config at {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("parsing config at {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.thresholds.validate()?;
        config.significance.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(self)?;
        fs::write(path, raw)
            .with_context(|| format!("writing config to {}", path.display()))?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(raw) = env::var("KEEPSAKE_MAX_USD") {
            if let Ok(v) = raw.parse::<f64>() {
                self.budget.max_usd = Some(v);
            }
        }
        if let Ok(raw) = env::var("KEEPSAKE_WORKERS") {
            if let Ok(v) = raw.parse::<usize>() {
                self.worker_count = v;
            }
        }
        if let Ok(url) = env::var("KEEPSAKE_LLM_BASE_URL") {
            if !url.trim().is_empty() {
                self.llm.base_url = url;
            }
        }
    }
}
