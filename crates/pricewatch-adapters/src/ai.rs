//! AI-assisted disambiguation between ranked candidate listings.
//!
//! Every attempt, including retries after throttling, goes through the shared
//! [`SlidingWindowLimiter`]. Any failure other than exhausted throttling
//! retries yields "no selection" immediately.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pricewatch_storage::{parse_retry_after, BackoffPolicy, SlidingWindowLimiter};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = "You match retail products between two stores. \
You receive one product description and a numbered list of candidate listings. \
Reply with only a JSON object \
{\"index\": <int>, \"confidence\": <float 0..1>, \"reason\": <string>}. \
Use index -1 when no candidate is plausibly the same product (same brand, line, size and variant).";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub temperature: f32,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion service is throttling requests")]
    RateLimited { retry_after: Option<Duration> },
    #[error("completion failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Returns the assistant message content of the first choice.
    async fn complete(&self, request: &ChatRequest) -> Result<String, CompletionError>;
}

/// OpenAI-compatible `/chat/completions` client.
#[derive(Debug, Clone)]
pub struct HttpCompletionClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl HttpCompletionClient {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("building completion client: {e}"))?;
        Ok(Self {
            client,
            api_url: api_url.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, request: &ChatRequest) -> Result<String, CompletionError> {
        let resp = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| CompletionError::Failed(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, Utc::now()));
            return Err(CompletionError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(CompletionError::Failed(format!("http status {status}")));
        }

        let body: ChatResponse = resp
            .json()
            .await
            .map_err(|e| CompletionError::Failed(format!("invalid completion body: {e}")))?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CompletionError::Failed("completion had no content".to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub model: String,
    pub top_k: usize,
    pub min_confidence: f64,
    pub backoff: BackoffPolicy,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            top_k: 5,
            min_confidence: 0.6,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AiSelection {
    pub index: usize,
    pub confidence: f64,
}

#[derive(Debug, Deserialize)]
struct AiReply {
    index: i64,
    confidence: f64,
    #[serde(default)]
    reason: Option<String>,
}

pub struct AiDisambiguator {
    client: Arc<dyn CompletionClient>,
    limiter: Arc<SlidingWindowLimiter>,
    config: AiConfig,
}

impl AiDisambiguator {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        limiter: Arc<SlidingWindowLimiter>,
        config: AiConfig,
    ) -> Self {
        Self {
            client,
            limiter,
            config,
        }
    }

    pub fn top_k(&self) -> usize {
        self.config.top_k.max(1)
    }

    /// Ask the service which of `candidates` is the product. `None` means no
    /// acceptable selection for any reason.
    pub async fn select(&self, description: &str, candidates: &[String]) -> Option<AiSelection> {
        if candidates.is_empty() {
            return None;
        }
        let request = self.build_request(description, candidates);
        let content = self.complete_with_retry(&request).await?;
        let selection = parse_selection(&content, candidates.len(), self.config.min_confidence);
        debug!(?selection, candidates = candidates.len(), "ai disambiguation answered");
        selection
    }

    fn build_request(&self, description: &str, candidates: &[String]) -> ChatRequest {
        let listed = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{i}. {c}"))
            .collect::<Vec<_>>()
            .join("\n");
        ChatRequest {
            model: self.config.model.clone(),
            temperature: 0.0,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: format!("Product: {description}\n\nCandidates:\n{listed}"),
                },
            ],
        }
    }

    async fn complete_with_retry(&self, request: &ChatRequest) -> Option<String> {
        let backoff = self.config.backoff;
        let mut attempt = 0usize;
        loop {
            self.limiter.acquire().await;
            match self.client.complete(request).await {
                Ok(content) => return Some(content),
                Err(CompletionError::RateLimited { retry_after }) => {
                    if attempt >= backoff.max_retries {
                        warn!(attempts = attempt + 1, "ai service still throttling; giving up");
                        return None;
                    }
                    let delay = retry_after.unwrap_or_else(|| backoff.delay_for_attempt(attempt));
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "ai service throttled");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(error = %err, "ai disambiguation unavailable");
                    return None;
                }
            }
        }
    }
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

fn parse_selection(content: &str, candidates: usize, min_confidence: f64) -> Option<AiSelection> {
    let reply: AiReply = serde_json::from_str(strip_code_fence(content)).ok()?;
    if reply.index < 0 {
        debug!(reason = reply.reason.as_deref().unwrap_or(""), "ai found no plausible candidate");
        return None;
    }
    let index = usize::try_from(reply.index).ok().filter(|i| *i < candidates)?;
    // An incomparable (NaN) confidence or threshold rejects.
    match reply.confidence.partial_cmp(&min_confidence) {
        Some(Ordering::Greater | Ordering::Equal) => {}
        Some(Ordering::Less) | None => return None,
    }
    Some(AiSelection {
        index,
        confidence: reply.confidence,
    })
}
