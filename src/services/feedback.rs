use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::core::config::AiSettings;
use crate::services::comparison::{classify_status, classify_transport, ProviderError};

const FEEDBACK_SYSTEM_PROMPT: &str =
    "You are an educational assistant providing constructive feedback on student answers.";

/// Longest excerpt of either answer quoted in the prompt, in characters.
const EXCERPT_CHARS: usize = 1000;

pub struct FeedbackRequest<'a> {
    pub model_text: &'a str,
    pub student_text: &'a str,
    pub similarity: f64,
    pub keyword_coverage: f64,
}

/// Writes prose feedback for a graded answer. Marks are never affected:
/// callers keep the computed summary sentence when this fails.
#[async_trait]
pub trait FeedbackWriter: Send + Sync {
    async fn write(&self, request: &FeedbackRequest<'_>) -> Result<String, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct LlmFeedbackWriter {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl LlmFeedbackWriter {
    pub(crate) fn new(client: Client, ai: &AiSettings) -> Self {
        Self {
            client,
            api_key: ai.openai_api_key.clone(),
            base_url: ai.openai_base_url.trim_end_matches('/').to_string(),
            model: ai.ai_model.clone(),
        }
    }
}

#[async_trait]
impl FeedbackWriter for LlmFeedbackWriter {
    async fn write(&self, request: &FeedbackRequest<'_>) -> Result<String, ProviderError> {
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": FEEDBACK_SYSTEM_PROMPT},
                {"role": "user", "content": feedback_prompt(request)}
            ],
            "max_completion_tokens": 500,
            "temperature": 0.7
        });

        let url = format!("{}/chat/completions", self.base_url);
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

        let body: Value = response.json().await.map_err(classify_transport)?;
        body.get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|value| value.as_str())
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| ProviderError::MalformedResponse("missing feedback text".to_string()))
    }
}

fn feedback_prompt(request: &FeedbackRequest<'_>) -> String {
    format!(
        "Compare the student answer with the model answer. Provide constructive feedback \
         highlighting strengths and areas for improvement.\n\n\
         Model Answer:\n{}\n\n\
         Student Answer:\n{}\n\n\
         Metrics:\n- Semantic Similarity: {:.0}%\n- Keyword Coverage: {:.0}%\n\n\
         Provide feedback in 3-4 sentences covering what the student did well, which key \
         concepts were missed, and where to improve.",
        excerpt(request.model_text),
        excerpt(request.student_text),
        request.similarity * 100.0,
        request.keyword_coverage * 100.0,
    )
}

fn excerpt(text: &str) -> &str {
    match text.char_indices().nth(EXCERPT_CHARS) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}
