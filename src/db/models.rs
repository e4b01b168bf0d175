use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::PrimitiveDateTime;

use crate::db::types::{FailureKind, SubmissionStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub id: String,
    pub description: String,
    pub weight: f64,
    pub max_marks: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ModelAnswer {
    pub id: String,
    pub owner_id: String,
    pub document_ref: String,
    pub extracted_text: String,
    pub total_marks: i32,
    /// `None` means the answer is graded holistically.
    pub criteria: Option<Json<Vec<Criterion>>>,
    pub keywords: Json<Vec<String>>,
    pub locked: bool,
    pub supersedes: Option<String>,
    pub version: i64,
    pub created_at: PrimitiveDateTime,
    pub updated_at: PrimitiveDateTime,
}

impl ModelAnswer {
    pub fn criteria(&self) -> Option<&[Criterion]> {
        self.criteria.as_ref().map(|criteria| criteria.0.as_slice())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubmissionBatch {
    pub id: String,
    pub model_answer_id: String,
    pub created_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionScore {
    pub criterion_id: String,
    pub similarity: f64,
    pub marks: i32,
    pub max_marks: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Submission {
    pub id: String,
    pub batch_id: String,
    pub position: i32,
    pub document_ref: String,
    pub document_hash: Option<String>,
    pub extracted_text: Option<String>,
    pub status: SubmissionStatus,
    pub score: Option<i32>,
    pub max_score: Option<i32>,
    pub criterion_scores: Option<Json<Vec<CriterionScore>>>,
    pub similarity: Option<f64>,
    pub keyword_coverage: Option<f64>,
    pub feedback: Option<String>,
    pub error_kind: Option<FailureKind>,
    pub error_detail: Option<String>,
    pub attempt_count: i32,
    pub next_attempt_at: Option<PrimitiveDateTime>,
    pub version: i64,
    pub created_at: PrimitiveDateTime,
    pub updated_at: PrimitiveDateTime,
}

impl Submission {
    /// Completed, or failed with no retry scheduled.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            SubmissionStatus::Completed => true,
            SubmissionStatus::Failed => self.next_attempt_at.is_none(),
            _ => false,
        }
    }

    pub fn retry_scheduled(&self) -> bool {
        self.status == SubmissionStatus::Failed && self.next_attempt_at.is_some()
    }

    /// Score as a percentage of the marks available; zero when none are.
    pub fn percentage(&self) -> Option<f64> {
        let (score, max_score) = (self.score?, self.max_score?);
        if max_score <= 0 {
            return Some(0.0);
        }
        Some(f64::from(score) * 100.0 / f64::from(max_score))
    }
}

/// Scored outcome written together with the `Completed` transition.
#[derive(Debug, Clone, PartialEq)]
pub struct GradeRecord {
    pub score: i32,
    pub max_score: i32,
    pub criterion_scores: Option<Vec<CriterionScore>>,
    pub similarity: Option<f64>,
    pub keyword_coverage: f64,
    pub feedback: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionError {
    pub kind: FailureKind,
    pub detail: String,
}

/// Full replacement of a submission's lifecycle columns. Text and hash are
/// only written when present; every other field is set as given, so a patch
/// without a grade clears any previous score.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionPatch {
    pub status: SubmissionStatus,
    pub document_hash: Option<String>,
    pub extracted_text: Option<String>,
    pub grade: Option<GradeRecord>,
    pub error: Option<SubmissionError>,
    pub attempt_count: i32,
    pub next_attempt_at: Option<PrimitiveDateTime>,
}

impl SubmissionPatch {
    /// Applies the patch to an in-memory copy, bumping the version.
    pub fn apply(&self, submission: &mut Submission, now: PrimitiveDateTime) {
        submission.status = self.status;
        if let Some(hash) = &self.document_hash {
            submission.document_hash = Some(hash.clone());
        }
        if let Some(text) = &self.extracted_text {
            submission.extracted_text = Some(text.clone());
        }
        match &self.grade {
            Some(grade) => {
                submission.score = Some(grade.score);
                submission.max_score = Some(grade.max_score);
                submission.criterion_scores = grade.criterion_scores.clone().map(Json);
                submission.similarity = grade.similarity;
                submission.keyword_coverage = Some(grade.keyword_coverage);
                submission.feedback = Some(grade.feedback.clone());
            }
            None => {
                submission.score = None;
                submission.max_score = None;
                submission.criterion_scores = None;
                submission.similarity = None;
                submission.keyword_coverage = None;
                submission.feedback = None;
            }
        }
        submission.error_kind = self.error.as_ref().map(|error| error.kind);
        submission.error_detail = self.error.as_ref().map(|error| error.detail.clone());
        submission.attempt_count = self.attempt_count;
        submission.next_attempt_at = self.next_attempt_at;
        submission.version += 1;
        submission.updated_at = now;
    }
}
