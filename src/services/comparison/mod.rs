//! Semantic comparison strategies behind one trait.

mod embedding;
mod llm_judge;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;

use crate::core::config::{ComparisonStrategy, Settings};
use crate::services::model_answer_index::EmbeddingSlot;

pub use embedding::EmbeddingProvider;
pub use llm_judge::LlmJudgeProvider;

/// Semantic alignment in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Similarity(f64);

impl Similarity {
    /// Clamps into range; NaN becomes zero.
    pub fn new(value: f64) -> Self {
        if value.is_nan() {
            return Self(0.0);
        }
        Self(value.clamp(0.0, 1.0))
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

/// Per-call hints. `reference_embedding` lets embedding strategies reuse a
/// reference vector across a batch; other strategies ignore it.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompareOptions<'a> {
    pub criterion: Option<&'a str>,
    pub reference_embedding: Option<&'a EmbeddingSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("comparison provider timed out")]
    Timeout,
    #[error("comparison provider rate limited the request")]
    RateLimited,
    #[error("comparison provider returned a malformed response: {0}")]
    MalformedResponse(String),
    #[error("comparison provider unavailable: {0}")]
    Upstream(String),
}

#[async_trait]
pub trait ComparisonProvider: Send + Sync {
    /// Similarity of `candidate` to `reference`. A single attempt: retries
    /// belong to the caller.
    async fn compare(
        &self,
        reference: &str,
        candidate: &str,
        options: &CompareOptions<'_>,
    ) -> Result<Similarity, ProviderError>;

    fn name(&self) -> &'static str;
}

pub fn from_settings(settings: &Settings) -> anyhow::Result<Arc<dyn ComparisonProvider>> {
    let client = http_client(Duration::from_secs(settings.ai().ai_request_timeout))?;
    let provider: Arc<dyn ComparisonProvider> = match settings.ai().strategy {
        ComparisonStrategy::Embedding => Arc::new(EmbeddingProvider::new(client, settings.ai())),
        ComparisonStrategy::LlmJudge => Arc::new(LlmJudgeProvider::new(client, settings.ai())),
    };
    Ok(provider)
}

pub(crate) fn http_client(timeout: Duration) -> anyhow::Result<Client> {
    use anyhow::Context;

    Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}

pub(crate) fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderError::Timeout,
        _ => ProviderError::Upstream(format!("status {status}: {}", truncate(body, 256))),
    }
}

pub(crate) fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else if err.is_decode() {
        ProviderError::MalformedResponse(err.to_string())
    } else {
        ProviderError::Upstream(err.to_string())
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}
