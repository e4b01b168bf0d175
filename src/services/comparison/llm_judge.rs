use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::config::AiSettings;

use super::{
    classify_status, classify_transport, CompareOptions, ComparisonProvider, ProviderError,
    Similarity,
};

const JUDGE_SYSTEM_PROMPT: &str = r#"You are an experienced examiner comparing a student's answer with a model answer.
Judge how completely and accurately the student's answer conveys the meaning of the model answer.
Ignore spelling, grammar and formatting. Do not reward length.

Reply with strict JSON only:
{"similarity": <number between 0 and 1>}
"#;

#[derive(Debug, Deserialize)]
struct JudgeVerdict {
    similarity: f64,
}

/// Asks a chat model to rate semantic alignment directly.
#[derive(Debug, Clone)]
pub struct LlmJudgeProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
}

impl LlmJudgeProvider {
    pub(crate) fn new(client: Client, ai: &AiSettings) -> Self {
        Self {
            client,
            api_key: ai.openai_api_key.clone(),
            base_url: ai.openai_base_url.trim_end_matches('/').to_string(),
            model: ai.ai_model.clone(),
            max_tokens: ai.ai_max_tokens,
            temperature: ai.ai_temperature,
        }
    }
}

#[async_trait]
impl ComparisonProvider for LlmJudgeProvider {
    async fn compare(
        &self,
        reference: &str,
        candidate: &str,
        options: &CompareOptions<'_>,
    ) -> Result<Similarity, ProviderError> {
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": JUDGE_SYSTEM_PROMPT},
                {"role": "user", "content": judge_prompt(reference, candidate, options.criterion)}
            ],
            "max_completion_tokens": self.max_tokens,
            "temperature": self.temperature,
            "response_format": {"type": "json_object"}
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
        parse_verdict(&body).map(Similarity::new)
    }

    fn name(&self) -> &'static str {
        "llm"
    }
}

fn judge_prompt(reference: &str, candidate: &str, criterion: Option<&str>) -> String {
    let focus = match criterion {
        Some(criterion) => format!("Judge only this rubric item: {criterion}\n\n"),
        None => String::new(),
    };
    format!("{focus}Model answer:\n{reference}\n\nStudent answer:\n{candidate}\n")
}

fn parse_verdict(body: &Value) -> Result<f64, ProviderError> {
    let content = body
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|value| value.as_str())
        .ok_or_else(|| ProviderError::MalformedResponse("missing message content".to_string()))?;

    let verdict: JudgeVerdict = serde_json::from_str(content)
        .map_err(|err| ProviderError::MalformedResponse(format!("invalid verdict JSON: {err}")))?;

    if !verdict.similarity.is_finite() || !(0.0..=1.0).contains(&verdict.similarity) {
        return Err(ProviderError::MalformedResponse(format!(
            "similarity {} is outside [0, 1]",
            verdict.similarity
        )));
    }
    Ok(verdict.similarity)
}
