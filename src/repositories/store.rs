use async_trait::async_trait;
use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::core::time::primitive_now_utc;
use crate::db::models::{ModelAnswer, Submission, SubmissionBatch, SubmissionPatch};
use crate::repositories::{batches, model_answers, submissions, ResultStore, StoreError};

/// Postgres-backed [`ResultStore`].
#[derive(Clone)]
pub struct PgResultStore {
    pool: PgPool,
}

impl PgResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn create_model_answer(&self, answer: &ModelAnswer) -> Result<(), StoreError> {
        model_answers::create(&self.pool, answer).await?;
        Ok(())
    }

    async fn find_model_answer(&self, id: &str) -> Result<Option<ModelAnswer>, StoreError> {
        Ok(model_answers::find_by_id(&self.pool, id).await?)
    }

    async fn update_model_answer(
        &self,
        answer: &ModelAnswer,
        expected_version: i64,
    ) -> Result<ModelAnswer, StoreError> {
        let updated =
            model_answers::update_unlocked(&self.pool, answer, expected_version, primitive_now_utc())
                .await?;
        if let Some(updated) = updated {
            return Ok(updated);
        }

        match model_answers::find_by_id(&self.pool, &answer.id).await? {
            None => Err(StoreError::NotFound { entity: "model answer", id: answer.id.clone() }),
            Some(current) if current.locked => {
                Err(StoreError::Locked { entity: "model answer", id: answer.id.clone() })
            }
            Some(_) => Err(StoreError::Conflict {
                entity: "model answer",
                id: answer.id.clone(),
                expected: expected_version,
            }),
        }
    }

    async fn lock_model_answer(&self, id: &str) -> Result<(), StoreError> {
        if model_answers::lock(&self.pool, id, primitive_now_utc()).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound { entity: "model answer", id: id.to_string() })
        }
    }

    async fn delete_model_answer(&self, id: &str, cascade: bool) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let referencing = batches::count_by_model_answer(&mut tx, id).await?;
        if referencing > 0 {
            if !cascade {
                tx.rollback().await?;
                return Err(StoreError::Referenced { entity: "model answer", id: id.to_string() });
            }
            batches::delete_by_model_answer(&mut tx, id).await?;
        }

        let deleted = model_answers::delete(&mut tx, id).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn list_batch_ids(&self, model_answer_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(batches::list_ids_by_model_answer(&self.pool, model_answer_id).await?)
    }

    async fn create_batch(&self, batch: &SubmissionBatch) -> Result<(), StoreError> {
        batches::create(&self.pool, batch).await?;
        Ok(())
    }

    async fn find_batch(&self, id: &str) -> Result<Option<SubmissionBatch>, StoreError> {
        Ok(batches::find_by_id(&self.pool, id).await?)
    }

    async fn create_submission(
        &self,
        batch_id: &str,
        document_ref: &str,
    ) -> Result<Submission, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let submission =
            submissions::create(&self.pool, &id, batch_id, document_ref, primitive_now_utc())
                .await?;
        Ok(submission)
    }

    async fn update_submission(
        &self,
        id: &str,
        patch: &SubmissionPatch,
        expected_version: i64,
    ) -> Result<Submission, StoreError> {
        let updated = submissions::update_versioned(
            &self.pool,
            id,
            patch,
            expected_version,
            primitive_now_utc(),
        )
        .await?;

        match updated {
            Some(submission) => Ok(submission),
            None if submissions::exists(&self.pool, id).await? => Err(StoreError::Conflict {
                entity: "submission",
                id: id.to_string(),
                expected: expected_version,
            }),
            None => Err(StoreError::NotFound { entity: "submission", id: id.to_string() }),
        }
    }

    async fn find_submission(&self, id: &str) -> Result<Option<Submission>, StoreError> {
        Ok(submissions::find_by_id(&self.pool, id).await?)
    }

    async fn list_batch_submissions(&self, batch_id: &str) -> Result<Vec<Submission>, StoreError> {
        Ok(submissions::list_by_batch(&self.pool, batch_id).await?)
    }

    async fn list_resumable(
        &self,
        now: PrimitiveDateTime,
        stale_before: PrimitiveDateTime,
        limit: i64,
    ) -> Result<Vec<String>, StoreError> {
        Ok(submissions::list_resumable(&self.pool, now, stale_before, limit).await?)
    }
}
