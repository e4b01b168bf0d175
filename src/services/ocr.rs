//! Vision transcription for scanned sheets whose PDF carries no text layer.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde_json::{json, Value};

use crate::core::config::AiSettings;
use crate::services::comparison::{classify_status, classify_transport, ProviderError};
use crate::services::extraction::{
    content_hash, extract_blocking, normalize_text, DocumentExtractor, ExtractError,
    ExtractedDocument, PageImage,
};

const OCR_PROMPT: &str = "Extract all text from this answer sheet image. Preserve structure and \
formatting. Return only the extracted text without any additional commentary.";

/// Transcribes one page image. A single attempt: retries belong to the caller.
#[async_trait]
pub trait PageReader: Send + Sync {
    async fn read_page(&self, page: &PageImage, number: usize) -> Result<String, ProviderError>;
}

/// Scanned-page fallback wired into extraction.
#[derive(Clone)]
pub struct Ocr {
    reader: Arc<dyn PageReader>,
    max_pages: usize,
}

impl Ocr {
    pub fn new(reader: Arc<dyn PageReader>, max_pages: usize) -> Self {
        Self { reader, max_pages: max_pages.max(1) }
    }

    async fn transcribe(&self, pages: &[PageImage]) -> Result<String, ExtractError> {
        if pages.len() > self.max_pages {
            return Err(ExtractError::Unsupported(format!(
                "{} scanned pages, the limit is {}",
                pages.len(),
                self.max_pages
            )));
        }

        let mut texts = Vec::with_capacity(pages.len());
        for (index, page) in pages.iter().enumerate() {
            let text = self.reader.read_page(page, index + 1).await.map_err(ExtractError::Ocr)?;
            texts.push(text);
        }
        Ok(normalize_text(&texts.join("\n\n")))
    }
}

/// Extracts the text layer and, when the document has none, transcribes its
/// scanned page images instead.
pub async fn extract_document(
    extractor: Arc<dyn DocumentExtractor>,
    ocr: Option<&Ocr>,
    bytes: Vec<u8>,
    mime: Option<String>,
) -> Result<ExtractedDocument, ExtractError> {
    let retained = ocr.map(|_| bytes.clone());

    match extract_blocking(extractor.clone(), bytes, mime).await {
        Err(ExtractError::Unreadable) => {}
        other => return other,
    }
    let (Some(ocr), Some(bytes)) = (ocr, retained) else {
        return Err(ExtractError::Unreadable);
    };

    let content_hash = content_hash(&bytes);
    let pages = tokio::task::spawn_blocking(move || extractor.page_images(&bytes))
        .await
        .unwrap_or_else(|err| Err(ExtractError::Corrupt(format!("page scan failed: {err}"))))?;
    if pages.is_empty() {
        return Err(ExtractError::Unreadable);
    }

    tracing::info!(pages = pages.len(), "No text layer; transcribing scanned pages");
    let text = ocr.transcribe(&pages).await?;
    Ok(ExtractedDocument { text, content_hash })
}

/// OpenAI-compatible vision model reading one page per request.
#[derive(Debug, Clone)]
pub struct VisionPageReader {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl VisionPageReader {
    pub(crate) fn new(client: Client, ai: &AiSettings) -> Self {
        Self {
            client,
            api_key: ai.openai_api_key.clone(),
            base_url: ai.openai_base_url.trim_end_matches('/').to_string(),
            model: ai.ocr_model.clone(),
        }
    }

    fn payload(&self, page: &PageImage) -> Value {
        json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": OCR_PROMPT},
                    {"type": "image_url", "image_url": {"url": data_url(page)}}
                ]
            }],
            "max_completion_tokens": 4096
        })
    }
}

#[async_trait]
impl PageReader for VisionPageReader {
    async fn read_page(&self, page: &PageImage, number: usize) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.payload(page))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body: Value = response.json().await.map_err(classify_transport)?;
        let text = message_content(&body)?;
        tracing::debug!(page = number, chars = text.len(), "Page transcribed");
        Ok(text)
    }
}

fn data_url(page: &PageImage) -> String {
    format!("data:{};base64,{}", page.mime, STANDARD.encode(&page.bytes))
}

fn message_content(body: &Value) -> Result<String, ProviderError> {
    body.get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|value| value.as_str())
        .map(str::to_string)
        .ok_or_else(|| ProviderError::MalformedResponse("missing message content".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::types::FailureKind;
    use crate::test_support::{PlainTextExtractor, ScriptedPageReader};

    fn ocr_with(reader: Arc<ScriptedPageReader>) -> Ocr {
        Ocr::new(reader, 4)
    }

    fn extractor() -> Arc<dyn DocumentExtractor> {
        Arc::new(PlainTextExtractor)
    }

    #[tokio::test]
    async fn text_layer_is_used_without_transcription() {
        let reader = ScriptedPageReader::echo();
        let ocr = ocr_with(reader.clone());
        let extracted =
            extract_document(extractor(), Some(&ocr), b"typed".to_vec(), None).await.unwrap();

        assert_eq!(extracted.text, "typed");
        assert_eq!(reader.calls(), 0);
    }

    #[tokio::test]
    async fn scanned_pages_are_transcribed_in_order() {
        let reader = ScriptedPageReader::echo();
        let bytes = b"%SCANNED first page|second page".to_vec();

        let ocr = ocr_with(reader.clone());
        let extracted =
            extract_document(extractor(), Some(&ocr), bytes.clone(), None).await.unwrap();

        assert_eq!(extracted.text, "first page\n\nsecond page");
        assert_eq!(extracted.content_hash, content_hash(&bytes));
        assert_eq!(reader.calls(), 2);
    }

    #[tokio::test]
    async fn without_ocr_a_scanned_sheet_is_unreadable() {
        let err = extract_document(extractor(), None, b"%SCANNED page".to_vec(), None)
            .await
            .unwrap_err();
        assert_eq!(err, ExtractError::Unreadable);
    }

    #[tokio::test]
    async fn reader_failures_keep_their_transient_kind() {
        let reader = ScriptedPageReader::failing(ProviderError::RateLimited, 1);
        let ocr = ocr_with(reader);
        let err = extract_document(extractor(), Some(&ocr), b"%SCANNED page".to_vec(), None)
            .await
            .unwrap_err();

        assert_eq!(err.failure_kind(), FailureKind::RateLimited);
        assert!(err.failure_kind().is_transient());
    }

    #[tokio::test]
    async fn page_limit_is_enforced() {
        let reader = ScriptedPageReader::echo();
        let ocr = ocr_with(reader.clone());
        let bytes = b"%SCANNED a|b|c|d|e".to_vec();
        let err = extract_document(extractor(), Some(&ocr), bytes, None).await.unwrap_err();

        assert!(matches!(err, ExtractError::Unsupported(_)));
        assert_eq!(reader.calls(), 0);
    }

    #[test]
    fn page_travels_as_a_data_url() {
        let page = PageImage { mime: "image/jpeg", bytes: vec![0xff, 0xd8, 0xff] };
        assert_eq!(data_url(&page), "data:image/jpeg;base64,/9j/");
    }

    #[test]
    fn missing_content_is_malformed() {
        let err = message_content(&json!({"choices": []})).unwrap_err();
        assert!(matches!(err, ProviderError::MalformedResponse(_)));

        let text = message_content(&json!({"choices": [{"message": {"content": "42"}}]})).unwrap();
        assert_eq!(text, "42");
    }
}
