use sqlx::types::Json;
use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::{Submission, SubmissionPatch};
use crate::db::types::SubmissionStatus;

use super::COLUMNS;

pub(crate) async fn create(
    pool: &PgPool,
    id: &str,
    batch_id: &str,
    document_ref: &str,
    now: PrimitiveDateTime,
) -> Result<Submission, sqlx::Error> {
    sqlx::query_as::<_, Submission>(&format!(
        "INSERT INTO submissions (id, batch_id, position, document_ref, status, attempt_count,
                                  version, created_at, updated_at)
         SELECT $1, $2, COALESCE(MAX(position) + 1, 0), $3, $4, 0, 0, $5, $5
         FROM submissions
         WHERE batch_id = $2
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(batch_id)
    .bind(document_ref)
    .bind(SubmissionStatus::Pending)
    .bind(now)
    .fetch_one(pool)
    .await
}

/// Compare-and-set on `version`; `None` means the row moved on or vanished.
pub(crate) async fn update_versioned(
    pool: &PgPool,
    id: &str,
    patch: &SubmissionPatch,
    expected_version: i64,
    now: PrimitiveDateTime,
) -> Result<Option<Submission>, sqlx::Error> {
    let grade = patch.grade.as_ref();

    sqlx::query_as::<_, Submission>(&format!(
        "UPDATE submissions
         SET status = $1,
             document_hash = COALESCE($2, document_hash),
             extracted_text = COALESCE($3, extracted_text),
             score = $4,
             max_score = $5,
             criterion_scores = $6,
             similarity = $7,
             keyword_coverage = $8,
             feedback = $9,
             error_kind = $10,
             error_detail = $11,
             attempt_count = $12,
             next_attempt_at = $13,
             version = version + 1,
             updated_at = $14
         WHERE id = $15 AND version = $16
         RETURNING {COLUMNS}"
    ))
    .bind(patch.status)
    .bind(patch.document_hash.as_deref())
    .bind(patch.extracted_text.as_deref())
    .bind(grade.map(|grade| grade.score))
    .bind(grade.map(|grade| grade.max_score))
    .bind(grade.and_then(|grade| grade.criterion_scores.clone()).map(Json))
    .bind(grade.and_then(|grade| grade.similarity))
    .bind(grade.map(|grade| grade.keyword_coverage))
    .bind(grade.map(|grade| grade.feedback.clone()))
    .bind(patch.error.as_ref().map(|error| error.kind))
    .bind(patch.error.as_ref().map(|error| error.detail.clone()))
    .bind(patch.attempt_count)
    .bind(patch.next_attempt_at)
    .bind(now)
    .bind(id)
    .bind(expected_version)
    .fetch_optional(pool)
    .await
}
