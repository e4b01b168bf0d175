use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::core::config::AiSettings;

use super::{
    classify_status, classify_transport, CompareOptions, ComparisonProvider, ProviderError,
    Similarity,
};

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// Cosine similarity of OpenAI-compatible embeddings.
#[derive(Debug, Clone)]
pub struct EmbeddingProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl EmbeddingProvider {
    pub(crate) fn new(client: Client, ai: &AiSettings) -> Self {
        Self {
            client,
            api_key: ai.openai_api_key.clone(),
            base_url: ai.openai_base_url.trim_end_matches('/').to_string(),
            model: ai.embedding_model.clone(),
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let url = format!("{}/embeddings", self.base_url);
        let payload = json!({ "model": self.model, "input": text });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body: EmbeddingResponse = response.json().await.map_err(classify_transport)?;
        let embedding = body
            .data
            .into_iter()
            .next()
            .map(|datum| datum.embedding)
            .ok_or_else(|| ProviderError::MalformedResponse("no embedding returned".to_string()))?;

        if embedding.is_empty() {
            return Err(ProviderError::MalformedResponse("empty embedding".to_string()));
        }
        Ok(embedding)
    }
}

#[async_trait]
impl ComparisonProvider for EmbeddingProvider {
    async fn compare(
        &self,
        reference: &str,
        candidate: &str,
        options: &CompareOptions<'_>,
    ) -> Result<Similarity, ProviderError> {
        let reference_vector = match options.reference_embedding {
            Some(slot) => slot
                .get_or_try_init(|| async { self.embed(reference).await.map(Arc::new) })
                .await?
                .clone(),
            None => Arc::new(self.embed(reference).await?),
        };
        let candidate_vector = self.embed(candidate).await?;

        cosine_similarity(&reference_vector, &candidate_vector).map(Similarity::new)
    }

    fn name(&self) -> &'static str {
        "embedding"
    }
}

/// Negative cosine means unrelated for grading purposes and clamps to zero
/// in [`Similarity::new`].
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64, ProviderError> {
    if a.len() != b.len() {
        return Err(ProviderError::MalformedResponse(format!(
            "embedding dimensions differ: {} vs {}",
            a.len(),
            b.len()
        )));
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0_f64, 0.0_f64, 0.0_f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}
