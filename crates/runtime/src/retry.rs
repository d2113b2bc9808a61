//! Retry strategy selection.
//!
//! The controller is a pure decision table: given a classified error and how
//! many recovery attempts have already been spent on it, it answers with the
//! next move.  The orchestrator drives the loop; nothing here sleeps.

use std::time::Duration;

use keepsake_config::RetryConfig;
use rand::Rng;

use crate::error::EngineError;

/// Next move after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep, then re-issue the same request.
    RetryAfter(Duration),
    /// Re-request immediately with the tightened prompt suffix.
    TightenPrompt,
    /// Split the batch in two on a conversational boundary and resubmit.
    SplitBatch,
    /// Out of attempts, or the error class never retries.
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryController {
    config: RetryConfig,
}

impl RetryController {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Decide the next move.  `attempt` counts prior recovery attempts for
    /// this error class on this batch, starting at 0 for the first failure.
    pub fn decide(&self, error: &EngineError, attempt: u32) -> RetryDecision {
        match error {
            EngineError::RateLimited { retry_after } => {
                if attempt >= self.config.rate_limit_max_attempts {
                    return RetryDecision::GiveUp;
                }
                // Provider-supplied retry-after wins over computed backoff.
                let delay = retry_after.unwrap_or_else(|| {
                    self.backoff(
                        self.config.rate_limit_base_ms,
                        self.config.rate_limit_cap_ms,
                        attempt,
                    )
                });
                RetryDecision::RetryAfter(delay)
            }
            EngineError::Transport(_) => {
                if attempt >= self.config.transport_max_attempts {
                    return RetryDecision::GiveUp;
                }
                RetryDecision::RetryAfter(self.backoff(
                    self.config.transport_base_ms,
                    self.config.transport_cap_ms,
                    attempt,
                ))
            }
            EngineError::Parse { .. } => {
                if attempt >= self.config.parse_max_attempts {
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::TightenPrompt
                }
            }
            EngineError::Oversize { .. } => {
                if attempt >= 1 {
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::SplitBatch
                }
            }
            _ => RetryDecision::GiveUp,
        }
    }

    /// Exponential backoff with jitter: `base * 2^attempt`, capped, then
    /// spread by ±`jitter_fraction`.
    fn backoff(&self, base_ms: u64, cap_ms: u64, attempt: u32) -> Duration {
        let exp = base_ms.saturating_mul(1u64 << attempt.min(20)).min(cap_ms);
        let jitter = self.config.jitter_fraction.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return Duration::from_millis(exp);
        }
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        Duration::from_millis((exp as f64 * factor) as u64)
    }
}
