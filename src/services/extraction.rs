use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::db::types::FailureKind;
use crate::services::comparison::ProviderError;

const PDF_MAGIC: &[u8] = b"%PDF-";
const PDF_MIME_TYPES: &[&str] = &["application/pdf", "application/x-pdf"];
const OPAQUE_MIME_TYPES: &[&str] = &["application/octet-stream", "binary/octet-stream"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub text: String,
    /// Hex SHA-256 of the input bytes.
    pub content_hash: String,
}

/// An embedded page image, ready to send to a vision model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub mime: &'static str,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("document has no extractable text layer")]
    Unreadable,
    #[error("unsupported document: {0}")]
    Unsupported(String),
    #[error("document is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("document is corrupt: {0}")]
    Corrupt(String),
    #[error("page transcription failed: {0}")]
    Ocr(ProviderError),
}

impl ExtractError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Unreadable => FailureKind::Unreadable,
            Self::Unsupported(_) => FailureKind::Unsupported,
            Self::TooLarge { .. } => FailureKind::TooLarge,
            Self::Corrupt(_) => FailureKind::Corrupt,
            Self::Ocr(ProviderError::Timeout) => FailureKind::Timeout,
            Self::Ocr(ProviderError::RateLimited) => FailureKind::RateLimited,
            Self::Ocr(ProviderError::MalformedResponse(_)) => FailureKind::MalformedResponse,
            Self::Ocr(ProviderError::Upstream(_)) => FailureKind::ProviderUnavailable,
        }
    }
}

/// Turns uploaded bytes into plain text. Implementations are pure and
/// synchronous; callers run them on the blocking pool.
pub trait DocumentExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8], mime: Option<&str>)
        -> Result<ExtractedDocument, ExtractError>;

    /// Scanned page images, in document order, for documents that
    /// `extract` found unreadable.
    fn page_images(&self, _bytes: &[u8]) -> Result<Vec<PageImage>, ExtractError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone)]
pub struct PdfExtractor {
    max_bytes: usize,
}

impl PdfExtractor {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl DocumentExtractor for PdfExtractor {
    fn extract(
        &self,
        bytes: &[u8],
        mime: Option<&str>,
    ) -> Result<ExtractedDocument, ExtractError> {
        if bytes.len() > self.max_bytes {
            return Err(ExtractError::TooLarge { size: bytes.len(), limit: self.max_bytes });
        }
        check_pdf(bytes, mime)?;

        let raw = catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text_from_mem(bytes)))
            .map_err(|panic| ExtractError::Corrupt(panic_message(panic.as_ref())))?
            .map_err(|err| ExtractError::Corrupt(err.to_string()))?;

        let text = normalize_text(&raw);
        if text.is_empty() {
            return Err(ExtractError::Unreadable);
        }

        Ok(ExtractedDocument { text, content_hash: content_hash(bytes) })
    }

    fn page_images(&self, bytes: &[u8]) -> Result<Vec<PageImage>, ExtractError> {
        if bytes.len() > self.max_bytes {
            return Err(ExtractError::TooLarge { size: bytes.len(), limit: self.max_bytes });
        }

        let document = catch_unwind(AssertUnwindSafe(|| lopdf::Document::load_mem(bytes)))
            .map_err(|panic| ExtractError::Corrupt(panic_message(panic.as_ref())))?
            .map_err(|err| ExtractError::Corrupt(err.to_string()))?;

        let pages = document
            .objects
            .values()
            .filter_map(|object| match object {
                lopdf::Object::Stream(stream) => scanned_image(stream),
                _ => None,
            })
            .collect();
        Ok(pages)
    }
}

/// JPEG image XObjects are what scanners embed; their stream content is the
/// image file itself.
fn scanned_image(stream: &lopdf::Stream) -> Option<PageImage> {
    let subtype = stream.dict.get(b"Subtype").ok()?;
    if !matches!(subtype, lopdf::Object::Name(name) if name.as_slice() == b"Image") {
        return None;
    }

    let filter = match stream.dict.get(b"Filter").ok()? {
        lopdf::Object::Name(name) => name.as_slice(),
        lopdf::Object::Array(filters) => match filters.as_slice() {
            [lopdf::Object::Name(name)] => name.as_slice(),
            _ => return None,
        },
        _ => return None,
    };

    (filter == b"DCTDecode")
        .then(|| PageImage { mime: "image/jpeg", bytes: stream.content.clone() })
}

/// Runs `extractor` on the blocking pool so a slow or panicking parse
/// cannot stall other submissions.
pub async fn extract_blocking(
    extractor: Arc<dyn DocumentExtractor>,
    bytes: Vec<u8>,
    mime: Option<String>,
) -> Result<ExtractedDocument, ExtractError> {
    tokio::task::spawn_blocking(move || extractor.extract(&bytes, mime.as_deref()))
        .await
        .unwrap_or_else(|err| Err(ExtractError::Corrupt(format!("extraction task failed: {err}"))))
}

fn check_pdf(bytes: &[u8], mime: Option<&str>) -> Result<(), ExtractError> {
    if let Some(mime) = mime {
        let essence = mime.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
        let accepted = PDF_MIME_TYPES.contains(&essence.as_str())
            || OPAQUE_MIME_TYPES.contains(&essence.as_str());
        if !accepted {
            return Err(ExtractError::Unsupported(format!("content type {essence}")));
        }
    }

    if !bytes.starts_with(PDF_MAGIC) {
        return Err(ExtractError::Unsupported("missing %PDF- header".to_string()));
    }
    Ok(())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("parser panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("parser panicked: {message}")
    } else {
        "parser panicked".to_string()
    }
}

/// Trims trailing whitespace per line and collapses runs of blank lines into
/// one. Leading and trailing blank lines are dropped.
pub fn normalize_text(raw: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut previous_blank = true;

    for line in raw.lines() {
        let line = line.trim_end();
        let blank = line.trim().is_empty();
        if blank && previous_blank {
            continue;
        }
        lines.push(if blank { "" } else { line });
        previous_blank = blank;
    }

    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }

    lines.join("\n")
}

pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
