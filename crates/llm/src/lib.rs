//! LLM client boundary.
//!
//! This crate is a pure transport adapter: it turns a prompt into a
//! [`RawResponse`] or a classified [`TransportError`].  No retry, pacing,
//! or business logic lives here; the runtime crate owns all of that.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

// ─── request/response contract ───────────────────────────────────────────────

/// Per-call parameters.  The timeout applies to the single HTTP request.
#[derive(Debug, Clone)]
pub struct CallParams {
    pub model: String,
    pub timeout: Duration,
    pub max_tokens: Option<u32>,
}

impl CallParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            timeout: Duration::from_secs(60),
            max_tokens: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }
}

/// Raw model output plus accounting data.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// Transport-level failure, classified at the boundary.  Handling policy
/// (retry, backoff, fatality) is decided by the caller.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error (status {status})")]
    Server { status: u16, body: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network failure: {0}")]
    Network(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("{0}")]
    Other(String),
}

/// The single operation the engine consumes.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call(&self, prompt: &str, params: &CallParams) -> Result<RawResponse, TransportError>;
}

// ─── HTTP implementation ─────────────────────────────────────────────────────

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn call(&self, prompt: &str, params: &CallParams) -> Result<RawResponse, TransportError> {
        let endpoint = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let mut payload = json!({
            "model": params.model,
            "messages": [
                {"role": "user", "content": prompt}
            ]
        });
        if let Some(max_tokens) = params.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }

        let mut request = self
            .client
            .post(&endpoint)
            .timeout(params.timeout)
            .json(&payload);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                TransportError::Timeout(params.timeout)
            } else {
                TransportError::Network(err.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;

        if let Some(err) = classify_status(status, retry_after, &body) {
            tracing::debug!(status, error = %err, "request rejected by provider");
            return Err(err);
        }

        parse_completion_body(&body, &params.model)
    }
}

/// Map a non-success HTTP status to its error class.  `None` means success.
fn classify_status(
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
) -> Option<TransportError> {
    match status {
        200..=299 => None,
        401 | 403 => Some(TransportError::Auth(truncate(body, 200))),
        429 => Some(TransportError::RateLimited { retry_after }),
        500..=599 => Some(TransportError::Server {
            status,
            body: truncate(body, 200),
        }),
        _ => Some(TransportError::Other(format!(
            "unexpected status {status}: {}",
            truncate(body, 200)
        ))),
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Walk an OpenAI-style completion body into a [`RawResponse`].
fn parse_completion_body(body: &str, requested_model: &str) -> Result<RawResponse, TransportError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|err| TransportError::Malformed(format!("response is not JSON: {err}")))?;

    let content = value
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .ok_or_else(|| TransportError::Malformed("missing choices[0].message.content".into()))?
        .to_string();

    let usage = value.get("usage");
    let tokens_in = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let tokens_out = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    let model = value
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or(requested_model)
        .to_string();

    Ok(RawResponse {
        content,
        usage: TokenUsage {
            tokens_in,
            tokens_out,
        },
        model,
    })
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

// ─── tolerant JSON extraction ────────────────────────────────────────────────

/// Extract the outermost JSON object from an LLM reply.
///
/// Strategy 1 looks for a fenced ```json code block.  Strategy 2 scans from
/// the first `{` with a bracket-balance walk that respects string literals
/// and escapes, so trailing prose after the object does not break extraction.
/// Returns `None` when no balanced object exists.
pub fn extract_json_object(response: &str) -> Option<&str> {
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(fence_end) = after_fence.find("```") {
            let inner = after_fence[..fence_end].trim();
            if let Some(object) = balanced_object(inner) {
                return Some(object);
            }
        }
    }
    balanced_object(response)
}

/// Find the first balanced `{...}` span in `text`.
fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

// ─── Tests ───────────────────────────────────────────────────────────────────
