use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use time::PrimitiveDateTime;

use crate::db::models::ModelAnswer;

const MODEL_ANSWER_COLUMNS: &str = "id, owner_id, document_ref, extracted_text, total_marks, \
     criteria, keywords, locked, supersedes, version, created_at, updated_at";

pub(crate) async fn create(pool: &PgPool, answer: &ModelAnswer) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO model_answers (
            id, owner_id, document_ref, extracted_text, total_marks, criteria, keywords,
            locked, supersedes, version, created_at, updated_at
         ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)",
    )
    .bind(&answer.id)
    .bind(&answer.owner_id)
    .bind(&answer.document_ref)
    .bind(&answer.extracted_text)
    .bind(answer.total_marks)
    .bind(answer.criteria.as_ref().map(|criteria| Json(&criteria.0)))
    .bind(Json(&answer.keywords.0))
    .bind(answer.locked)
    .bind(answer.supersedes.as_deref())
    .bind(answer.version)
    .bind(answer.created_at)
    .bind(answer.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn find_by_id(
    pool: &PgPool,
    id: &str,
) -> Result<Option<ModelAnswer>, sqlx::Error> {
    sqlx::query_as::<_, ModelAnswer>(&format!(
        "SELECT {MODEL_ANSWER_COLUMNS} FROM model_answers WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Only unlocked rows at `expected_version` are rewritten.
pub(crate) async fn update_unlocked(
    pool: &PgPool,
    answer: &ModelAnswer,
    expected_version: i64,
    now: PrimitiveDateTime,
) -> Result<Option<ModelAnswer>, sqlx::Error> {
    sqlx::query_as::<_, ModelAnswer>(&format!(
        "UPDATE model_answers SET
            document_ref = $1,
            extracted_text = $2,
            total_marks = $3,
            criteria = $4,
            keywords = $5,
            version = version + 1,
            updated_at = $6
         WHERE id = $7 AND version = $8 AND NOT locked
         RETURNING {MODEL_ANSWER_COLUMNS}"
    ))
    .bind(&answer.document_ref)
    .bind(&answer.extracted_text)
    .bind(answer.total_marks)
    .bind(answer.criteria.as_ref().map(|criteria| Json(&criteria.0)))
    .bind(Json(&answer.keywords.0))
    .bind(now)
    .bind(&answer.id)
    .bind(expected_version)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn lock(
    pool: &PgPool,
    id: &str,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE model_answers SET
            locked = TRUE,
            version = CASE WHEN locked THEN version ELSE version + 1 END,
            updated_at = CASE WHEN locked THEN updated_at ELSE $1 END
         WHERE id = $2",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn delete(
    tx: &mut Transaction<'_, Postgres>,
    id: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM model_answers WHERE id = $1")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected() > 0)
}
