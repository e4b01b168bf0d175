use sqlx::{PgPool, Postgres, Transaction};

use crate::db::models::SubmissionBatch;

const BATCH_COLUMNS: &str = "id, model_answer_id, created_at";

pub(crate) async fn create(pool: &PgPool, batch: &SubmissionBatch) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO submission_batches (id, model_answer_id, created_at)
         VALUES ($1,$2,$3)",
    )
    .bind(&batch.id)
    .bind(&batch.model_answer_id)
    .bind(batch.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn find_by_id(
    pool: &PgPool,
    id: &str,
) -> Result<Option<SubmissionBatch>, sqlx::Error> {
    sqlx::query_as::<_, SubmissionBatch>(&format!(
        "SELECT {BATCH_COLUMNS} FROM submission_batches WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn list_ids_by_model_answer(
    pool: &PgPool,
    model_answer_id: &str,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT id FROM submission_batches WHERE model_answer_id = $1 ORDER BY created_at, id",
    )
    .bind(model_answer_id)
    .fetch_all(pool)
    .await
}

/// Submissions go with their batch through `ON DELETE CASCADE`.
pub(crate) async fn delete_by_model_answer(
    tx: &mut Transaction<'_, Postgres>,
    model_answer_id: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM submission_batches WHERE model_answer_id = $1")
        .bind(model_answer_id)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn count_by_model_answer(
    tx: &mut Transaction<'_, Postgres>,
    model_answer_id: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM submission_batches WHERE model_answer_id = $1",
    )
    .bind(model_answer_id)
    .fetch_one(&mut **tx)
    .await
}
