//! Parsed, immutable view of a model answer used for scoring.
//!
//! A reference is built once per batch and shared behind an `Arc` by every
//! submission in that batch. Embeddings of the reference texts are filled in
//! lazily by the first comparison that needs them.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::OnceCell;

use crate::db::models::{Criterion, ModelAnswer};

/// Lazily computed embedding of one reference text.
pub type EmbeddingSlot = OnceCell<Arc<Vec<f32>>>;

const MIN_KEYWORD_LEN: usize = 3;

const STOPWORDS: &[&str] = &[
    "about", "above", "after", "again", "against", "all", "also", "and", "any", "are", "because",
    "been", "before", "being", "below", "between", "both", "but", "can", "could", "did", "does",
    "doing", "down", "during", "each", "few", "for", "from", "further", "had", "has", "have",
    "having", "her", "here", "hers", "him", "his", "how", "into", "its", "itself", "just", "more",
    "most", "not", "now", "off", "once", "only", "other", "our", "ours", "out", "over", "own",
    "same", "she", "should", "some", "such", "than", "that", "the", "their", "theirs", "them",
    "then", "there", "these", "they", "this", "those", "through", "too", "under", "until", "very",
    "was", "were", "what", "when", "where", "which", "while", "who", "whom", "why", "will", "with",
    "would", "you", "your", "yours",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("invalid criteria: {0}")]
    InvalidCriteria(String),
    #[error("model answer has no text")]
    EmptyReference,
    #[error("total marks must be non-negative, got {0}")]
    InvalidTotalMarks(i32),
}

#[derive(Debug)]
pub struct ReferenceSegment {
    pub content: String,
    pub keywords: Vec<String>,
    pub embedding: EmbeddingSlot,
}

impl ReferenceSegment {
    fn new(content: String) -> Self {
        let keywords = extract_keywords(&content);
        Self { content, keywords, embedding: EmbeddingSlot::new() }
    }
}

#[derive(Debug)]
pub struct CriterionReference {
    pub criterion: Criterion,
    pub segment: ReferenceSegment,
}

#[derive(Debug)]
pub struct ModelAnswerReference {
    pub model_answer_id: String,
    pub total_marks: i32,
    pub overall: ReferenceSegment,
    /// `None` for holistic grading; otherwise in rubric order.
    pub criteria: Option<Vec<CriterionReference>>,
}

impl ModelAnswerReference {
    pub fn from_model_answer(answer: &ModelAnswer) -> Result<Arc<Self>, IndexError> {
        build(&answer.id, &answer.extracted_text, answer.total_marks, answer.criteria())
    }
}

pub fn build(
    model_answer_id: &str,
    text: &str,
    total_marks: i32,
    criteria: Option<&[Criterion]>,
) -> Result<Arc<ModelAnswerReference>, IndexError> {
    if total_marks < 0 {
        return Err(IndexError::InvalidTotalMarks(total_marks));
    }
    let text = text.trim();
    if text.is_empty() {
        return Err(IndexError::EmptyReference);
    }

    let criteria = match criteria {
        Some(criteria) if !criteria.is_empty() => {
            validate_criteria(criteria, total_marks)?;
            Some(
                criteria
                    .iter()
                    .map(|criterion| CriterionReference {
                        criterion: criterion.clone(),
                        segment: ReferenceSegment::new(format!(
                            "{}\n\n{}",
                            criterion.description.trim(),
                            text
                        )),
                    })
                    .collect(),
            )
        }
        _ => None,
    };

    Ok(Arc::new(ModelAnswerReference {
        model_answer_id: model_answer_id.to_string(),
        total_marks,
        overall: ReferenceSegment::new(text.to_string()),
        criteria,
    }))
}

/// Checks a rubric against the model answer's total. Violations are
/// rejected outright, never truncated.
pub fn validate_criteria(criteria: &[Criterion], total_marks: i32) -> Result<(), IndexError> {
    let mut seen = HashSet::new();
    let mut max_marks_sum: i64 = 0;

    for criterion in criteria {
        if criterion.id.trim().is_empty() {
            return Err(IndexError::InvalidCriteria("criterion id is blank".to_string()));
        }
        if !seen.insert(criterion.id.as_str()) {
            return Err(IndexError::InvalidCriteria(format!(
                "criterion {} appears more than once",
                criterion.id
            )));
        }
        if criterion.description.trim().is_empty() {
            return Err(IndexError::InvalidCriteria(format!(
                "criterion {} has a blank description",
                criterion.id
            )));
        }
        if !(criterion.weight > 0.0 && criterion.weight <= 1.0) {
            return Err(IndexError::InvalidCriteria(format!(
                "criterion {} weight {} is outside (0, 1]",
                criterion.id, criterion.weight
            )));
        }
        if criterion.max_marks < 0 {
            return Err(IndexError::InvalidCriteria(format!(
                "criterion {} has negative max marks",
                criterion.id
            )));
        }
        max_marks_sum += i64::from(criterion.max_marks);
    }

    if max_marks_sum > i64::from(total_marks) {
        return Err(IndexError::InvalidCriteria(format!(
            "criteria max marks sum to {max_marks_sum}, more than the total of {total_marks}"
        )));
    }
    Ok(())
}

/// Lowercased content words, deduplicated and sorted.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let keywords: BTreeSet<String> = text
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| word.chars().count() >= MIN_KEYWORD_LEN)
        .map(str::to_lowercase)
        .filter(|word| !word.chars().all(|ch| ch.is_numeric()))
        .filter(|word| !STOPWORDS.contains(&word.as_str()))
        .collect();
    keywords.into_iter().collect()
}

/// Share of `keywords` that also occur in `text`; zero when there are none.
pub fn keyword_coverage(keywords: &[String], text: &str) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let present: HashSet<String> = extract_keywords(text).into_iter().collect();
    let matched = keywords.iter().filter(|keyword| present.contains(*keyword)).count();
    matched as f64 / keywords.len() as f64
}
