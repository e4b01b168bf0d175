//! Submission state transitions and the batch status derived from them.
//!
//! Every transition is expressed as a full [`SubmissionPatch`] so that one
//! conditional store update both moves the status and records its payload.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use time::PrimitiveDateTime;

use crate::db::models::{GradeRecord, Submission, SubmissionError, SubmissionPatch};
use crate::db::types::{BatchStatus, FailureKind, SubmissionStatus};
use crate::services::scoring::ScoreResult;

/// Pending or Failed moves to Extracting with a fresh attempt; a stale
/// Extracting record resumes in place without spending one.
pub(crate) fn begin_attempt(submission: &Submission) -> SubmissionPatch {
    let attempt_count = match submission.status {
        SubmissionStatus::Extracting => submission.attempt_count.max(1),
        _ => submission.attempt_count + 1,
    };
    SubmissionPatch {
        status: SubmissionStatus::Extracting,
        document_hash: None,
        extracted_text: None,
        grade: None,
        error: None,
        attempt_count,
        next_attempt_at: None,
    }
}

pub(crate) fn extracted(submission: &Submission, text: String, hash: String) -> SubmissionPatch {
    SubmissionPatch {
        status: SubmissionStatus::Scoring,
        document_hash: Some(hash),
        extracted_text: Some(text),
        grade: None,
        error: None,
        attempt_count: submission.attempt_count,
        next_attempt_at: None,
    }
}

pub(crate) fn completed(submission: &Submission, result: &ScoreResult) -> SubmissionPatch {
    SubmissionPatch {
        status: SubmissionStatus::Completed,
        document_hash: None,
        extracted_text: None,
        grade: Some(GradeRecord {
            score: result.marks,
            max_score: result.total_marks,
            criterion_scores: result.criterion_scores.clone(),
            similarity: Some(result.similarity),
            keyword_coverage: result.keyword_coverage,
            feedback: result.feedback.clone(),
        }),
        error: None,
        attempt_count: submission.attempt_count,
        next_attempt_at: None,
    }
}

/// `retry_at` is only honoured for transient kinds.
pub(crate) fn failed(
    submission: &Submission,
    kind: FailureKind,
    detail: impl Into<String>,
    retry_at: Option<PrimitiveDateTime>,
) -> SubmissionPatch {
    SubmissionPatch {
        status: SubmissionStatus::Failed,
        document_hash: None,
        extracted_text: None,
        grade: None,
        error: Some(SubmissionError { kind, detail: detail.into() }),
        attempt_count: submission.attempt_count,
        next_attempt_at: retry_at.filter(|_| kind.is_transient()),
    }
}

pub(crate) fn cancelled(submission: &Submission) -> SubmissionPatch {
    failed(submission, FailureKind::Cancelled, "Grading was cancelled by the model answer owner", None)
}

/// Whether moving from `from` to `to` keeps the status sequence monotonic.
pub(crate) fn is_allowed(from: SubmissionStatus, to: SubmissionStatus) -> bool {
    use SubmissionStatus::*;

    matches!(
        (from, to),
        (Pending, Extracting)
            | (Pending, Failed)
            | (Extracting, Extracting)
            | (Extracting, Scoring)
            | (Extracting, Failed)
            | (Scoring, Completed)
            | (Scoring, Failed)
            | (Failed, Extracting)
            | (Failed, Failed)
    )
}

/// Aggregate status of a batch, derived on every read and never stored.
pub(crate) fn derive_batch_status(submissions: &[Submission]) -> BatchStatus {
    if submissions.iter().any(|submission| !submission.is_terminal()) {
        return BatchStatus::Pending;
    }

    let completed = submissions
        .iter()
        .filter(|submission| submission.status == SubmissionStatus::Completed)
        .count();

    if completed == submissions.len() {
        BatchStatus::Completed
    } else if completed == 0 {
        BatchStatus::Failed
    } else {
        BatchStatus::PartiallyFailed
    }
}

/// Completed submissions at or above this percentage pass.
const PASS_PERCENTAGE: f64 = 50.0;

/// Score statistics over a batch's completed submissions. Failed work is
/// counted but never averaged in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    /// Failures with no retry left.
    pub failed: usize,
    pub in_progress: usize,
    pub mean_score: Option<f64>,
    pub min_score: Option<i32>,
    pub max_score: Option<i32>,
    pub mean_percentage: Option<f64>,
    /// Percent of completed submissions that passed.
    pub pass_rate: Option<f64>,
}

pub(crate) fn summarize(submissions: &[Submission]) -> BatchSummary {
    let graded: Vec<(i32, f64)> = submissions
        .iter()
        .filter(|submission| submission.status == SubmissionStatus::Completed)
        .filter_map(|submission| Some((submission.score?, submission.percentage()?)))
        .collect();
    let failed = submissions
        .iter()
        .filter(|submission| {
            submission.status == SubmissionStatus::Failed && submission.is_terminal()
        })
        .count();
    let completed = graded.len();

    let mut summary = BatchSummary {
        total: submissions.len(),
        completed,
        failed,
        in_progress: submissions.len() - completed - failed,
        mean_score: None,
        min_score: None,
        max_score: None,
        mean_percentage: None,
        pass_rate: None,
    };
    if graded.is_empty() {
        return summary;
    }

    let count = completed as f64;
    let passed = graded.iter().filter(|(_, percentage)| *percentage >= PASS_PERCENTAGE).count();
    summary.mean_score =
        Some(round2(graded.iter().map(|(score, _)| f64::from(*score)).sum::<f64>() / count));
    summary.min_score = graded.iter().map(|(score, _)| *score).min();
    summary.max_score = graded.iter().map(|(score, _)| *score).max();
    summary.mean_percentage =
        Some(round2(graded.iter().map(|(_, percentage)| percentage).sum::<f64>() / count));
    summary.pass_rate = Some(round2(passed as f64 * 100.0 / count));
    summary
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`
/// plus up to a quarter of `base` of jitter, never above `max`.
pub(crate) fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1 << exponent).min(max);

    let jitter_cap = (base.as_millis() / 4) as u64;
    let jitter = if jitter_cap == 0 { 0 } else { rand::thread_rng().gen_range(0..=jitter_cap) };

    delay.saturating_add(Duration::from_millis(jitter)).min(max)
}
