use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::Submission;
use crate::db::types::SubmissionStatus;

use super::COLUMNS;

pub(crate) async fn find_by_id(pool: &PgPool, id: &str) -> Result<Option<Submission>, sqlx::Error> {
    sqlx::query_as::<_, Submission>(&format!(
        "SELECT {COLUMNS}
         FROM submissions
         WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn exists(pool: &PgPool, id: &str) -> Result<bool, sqlx::Error> {
    let found: Option<i32> = sqlx::query_scalar("SELECT 1 FROM submissions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}

pub(crate) async fn list_by_batch(
    pool: &PgPool,
    batch_id: &str,
) -> Result<Vec<Submission>, sqlx::Error> {
    sqlx::query_as::<_, Submission>(&format!(
        "SELECT {COLUMNS}
         FROM submissions
         WHERE batch_id = $1
         ORDER BY position"
    ))
    .bind(batch_id)
    .fetch_all(pool)
    .await
}

pub(crate) async fn list_resumable(
    pool: &PgPool,
    now: PrimitiveDateTime,
    stale_before: PrimitiveDateTime,
    limit: i64,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT id
         FROM submissions
         WHERE status = $1
            OR (status = $2 AND next_attempt_at IS NOT NULL AND next_attempt_at <= $3)
            OR (status IN ($4, $5) AND updated_at < $6)
         ORDER BY COALESCE(next_attempt_at, created_at)
         LIMIT $7",
    )
    .bind(SubmissionStatus::Pending)
    .bind(SubmissionStatus::Failed)
    .bind(now)
    .bind(SubmissionStatus::Extracting)
    .bind(SubmissionStatus::Scoring)
    .bind(stale_before)
    .bind(limit)
    .fetch_all(pool)
    .await
}
