//! Engine error taxonomy.
//!
//! One enum covers every failure the pipeline classifies.  `scope` tells the
//! orchestrator how far a failure reaches: request-scoped errors retry,
//! batch-scoped errors fail one batch, pipeline-scoped errors stop intake
//! while in-flight work drains.

use std::time::Duration;

use keepsake_llm::TransportError;
use keepsake_memory::StoreError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseFailKind {
    /// No valid JSON object could be extracted.
    ParseFail,
    /// JSON extracted but a required field is missing or unusable.
    SchemaFail,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cost budget exceeded: reserving {needed:.4} USD with {remaining:.4} USD remaining")]
    BudgetExceeded { needed: f64, remaining: f64 },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transport failure: {0}")]
    Transport(TransportError),

    #[error("response parse failure ({kind:?}): {detail}")]
    Parse { kind: ParseFailKind, detail: String },

    #[error("batch of {estimated} estimated tokens exceeds the {budget}-token request budget")]
    Oversize { estimated: usize, budget: usize },

    #[error("memory validation failed: {0}")]
    Validation(String),

    #[error("concurrent upsert conflict for content hash")]
    DedupConflict,

    #[error("cancelled")]
    Cancelled,

    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    Request,
    Batch,
    Memory,
    Pipeline,
}

impl EngineError {
    /// Fold a transport error into the engine taxonomy.  Auth and rate-limit
    /// conditions get their own variants because their handling differs.
    pub fn from_transport(error: TransportError) -> Self {
        match error {
            TransportError::Auth(detail) => EngineError::Auth(detail),
            TransportError::RateLimited { retry_after } => EngineError::RateLimited { retry_after },
            other => EngineError::Transport(other),
        }
    }

    pub fn scope(&self) -> ErrorScope {
        match self {
            EngineError::BudgetExceeded { .. } | EngineError::Auth(_) | EngineError::Cancelled => {
                ErrorScope::Pipeline
            }
            EngineError::RateLimited { .. } | EngineError::Transport(_) => ErrorScope::Request,
            EngineError::Parse { .. } | EngineError::Oversize { .. } => ErrorScope::Batch,
            EngineError::Validation(_) | EngineError::DedupConflict => ErrorScope::Memory,
            EngineError::Store(_) => ErrorScope::Batch,
        }
    }

    /// Fatal errors stop intake of new work.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::BudgetExceeded { .. } | EngineError::Auth(_) | EngineError::Cancelled
        )
    }

    /// Stable label recorded in batch outcomes.
    pub fn class(&self) -> &'static str {
        match self {
            EngineError::BudgetExceeded { .. } => "BudgetExceeded",
            EngineError::Auth(_) => "AuthError",
            EngineError::RateLimited { .. } => "RateLimited",
            EngineError::Transport(TransportError::Timeout(_)) => "Timeout",
            EngineError::Transport(TransportError::Server { .. }) => "ServerError",
            EngineError::Transport(_) => "TransportError",
            EngineError::Parse {
                kind: ParseFailKind::ParseFail,
                ..
            } => "ParseFail",
            EngineError::Parse {
                kind: ParseFailKind::SchemaFail,
                ..
            } => "SchemaFail",
            EngineError::Oversize { .. } => "Oversize",
            EngineError::Validation(_) => "ValidationError",
            EngineError::DedupConflict => "DedupConflict",
            EngineError::Cancelled => "Cancelled",
            EngineError::Store(_) => "StoreError",
        }
    }
}
