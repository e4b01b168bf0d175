//! Result store: the persistence seam of the grading pipeline.
//!
//! The pipeline only needs create / update / read-by-id semantics with
//! optimistic concurrency on submissions; everything else here supports the
//! model-answer lifecycle around it.

pub mod batches;
pub(crate) mod health;
pub mod model_answers;
#[cfg(test)]
pub(crate) mod memory;
mod store;
pub mod submissions;

use async_trait::async_trait;
use thiserror::Error;
use time::PrimitiveDateTime;

use crate::db::models::{ModelAnswer, Submission, SubmissionBatch, SubmissionPatch};

pub use store::PgResultStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} was modified concurrently (expected version {expected})")]
    Conflict { entity: &'static str, id: String, expected: i64 },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{entity} {id} is locked")]
    Locked { entity: &'static str, id: String },
    #[error("{entity} {id} is still referenced")]
    Referenced { entity: &'static str, id: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn create_model_answer(&self, answer: &ModelAnswer) -> Result<(), StoreError>;

    async fn find_model_answer(&self, id: &str) -> Result<Option<ModelAnswer>, StoreError>;

    /// Rewrites the gradable fields of an unlocked model answer.
    async fn update_model_answer(
        &self,
        answer: &ModelAnswer,
        expected_version: i64,
    ) -> Result<ModelAnswer, StoreError>;

    async fn lock_model_answer(&self, id: &str) -> Result<(), StoreError>;

    /// Without `cascade` the delete fails with `Referenced` while batches
    /// still point at the model answer.
    async fn delete_model_answer(&self, id: &str, cascade: bool) -> Result<bool, StoreError>;

    async fn list_batch_ids(&self, model_answer_id: &str) -> Result<Vec<String>, StoreError>;

    async fn create_batch(&self, batch: &SubmissionBatch) -> Result<(), StoreError>;

    async fn find_batch(&self, id: &str) -> Result<Option<SubmissionBatch>, StoreError>;

    async fn create_submission(
        &self,
        batch_id: &str,
        document_ref: &str,
    ) -> Result<Submission, StoreError>;

    async fn update_submission(
        &self,
        id: &str,
        patch: &SubmissionPatch,
        expected_version: i64,
    ) -> Result<Submission, StoreError>;

    async fn find_submission(&self, id: &str) -> Result<Option<Submission>, StoreError>;

    async fn list_batch_submissions(&self, batch_id: &str) -> Result<Vec<Submission>, StoreError>;

    /// Ids of submissions a worker should pick up: pending ones, failed ones
    /// whose retry is due, and in-progress ones untouched since `stale_before`.
    async fn list_resumable(
        &self,
        now: PrimitiveDateTime,
        stale_before: PrimitiveDateTime,
        limit: i64,
    ) -> Result<Vec<String>, StoreError>;
}
