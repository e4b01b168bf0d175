use std::collections::HashMap;

use async_trait::async_trait;
use time::PrimitiveDateTime;
use tokio::sync::Mutex;

use crate::core::time::primitive_now_utc;
use crate::db::models::{ModelAnswer, Submission, SubmissionBatch, SubmissionPatch};
use crate::db::types::SubmissionStatus;
use crate::repositories::{ResultStore, StoreError};

#[derive(Default)]
struct Tables {
    model_answers: HashMap<String, ModelAnswer>,
    batches: HashMap<String, SubmissionBatch>,
    submissions: HashMap<String, Submission>,
}

/// In-memory [`ResultStore`] with the same version semantics as Postgres.
#[derive(Default)]
pub(crate) struct MemoryResultStore {
    tables: Mutex<Tables>,
}

impl MemoryResultStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Overwrites a submission row as-is, bypassing the version check.
    pub(crate) async fn put_submission(&self, submission: Submission) {
        let mut tables = self.tables.lock().await;
        tables.submissions.insert(submission.id.clone(), submission);
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn create_model_answer(&self, answer: &ModelAnswer) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.model_answers.insert(answer.id.clone(), answer.clone());
        Ok(())
    }

    async fn find_model_answer(&self, id: &str) -> Result<Option<ModelAnswer>, StoreError> {
        Ok(self.tables.lock().await.model_answers.get(id).cloned())
    }

    async fn update_model_answer(
        &self,
        answer: &ModelAnswer,
        expected_version: i64,
    ) -> Result<ModelAnswer, StoreError> {
        let mut tables = self.tables.lock().await;
        let current = tables.model_answers.get_mut(&answer.id).ok_or_else(|| {
            StoreError::NotFound { entity: "model answer", id: answer.id.clone() }
        })?;

        if current.locked {
            return Err(StoreError::Locked { entity: "model answer", id: answer.id.clone() });
        }
        if current.version != expected_version {
            return Err(StoreError::Conflict {
                entity: "model answer",
                id: answer.id.clone(),
                expected: expected_version,
            });
        }

        current.document_ref = answer.document_ref.clone();
        current.extracted_text = answer.extracted_text.clone();
        current.total_marks = answer.total_marks;
        current.criteria = answer.criteria.clone();
        current.keywords = answer.keywords.clone();
        current.version += 1;
        current.updated_at = primitive_now_utc();
        Ok(current.clone())
    }

    async fn lock_model_answer(&self, id: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let current = tables
            .model_answers
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { entity: "model answer", id: id.to_string() })?;
        if !current.locked {
            current.locked = true;
            current.version += 1;
            current.updated_at = primitive_now_utc();
        }
        Ok(())
    }

    async fn delete_model_answer(&self, id: &str, cascade: bool) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let batch_ids: Vec<String> = tables
            .batches
            .values()
            .filter(|batch| batch.model_answer_id == id)
            .map(|batch| batch.id.clone())
            .collect();

        if !batch_ids.is_empty() {
            if !cascade {
                return Err(StoreError::Referenced { entity: "model answer", id: id.to_string() });
            }
            tables.submissions.retain(|_, submission| !batch_ids.contains(&submission.batch_id));
            tables.batches.retain(|batch_id, _| !batch_ids.contains(batch_id));
        }

        for answer in tables.model_answers.values_mut() {
            if answer.supersedes.as_deref() == Some(id) {
                answer.supersedes = None;
            }
        }
        Ok(tables.model_answers.remove(id).is_some())
    }

    async fn list_batch_ids(&self, model_answer_id: &str) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.lock().await;
        let mut batches: Vec<&SubmissionBatch> = tables
            .batches
            .values()
            .filter(|batch| batch.model_answer_id == model_answer_id)
            .collect();
        batches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(batches.into_iter().map(|batch| batch.id.clone()).collect())
    }

    async fn create_batch(&self, batch: &SubmissionBatch) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.model_answers.contains_key(&batch.model_answer_id) {
            return Err(StoreError::NotFound {
                entity: "model answer",
                id: batch.model_answer_id.clone(),
            });
        }
        tables.batches.insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn find_batch(&self, id: &str) -> Result<Option<SubmissionBatch>, StoreError> {
        Ok(self.tables.lock().await.batches.get(id).cloned())
    }

    async fn create_submission(
        &self,
        batch_id: &str,
        document_ref: &str,
    ) -> Result<Submission, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.batches.contains_key(batch_id) {
            return Err(StoreError::NotFound { entity: "batch", id: batch_id.to_string() });
        }

        let position = tables
            .submissions
            .values()
            .filter(|submission| submission.batch_id == batch_id)
            .map(|submission| submission.position + 1)
            .max()
            .unwrap_or(0);
        let now = primitive_now_utc();
        let submission = Submission {
            id: uuid::Uuid::new_v4().to_string(),
            batch_id: batch_id.to_string(),
            position,
            document_ref: document_ref.to_string(),
            document_hash: None,
            extracted_text: None,
            status: SubmissionStatus::Pending,
            score: None,
            max_score: None,
            criterion_scores: None,
            similarity: None,
            keyword_coverage: None,
            feedback: None,
            error_kind: None,
            error_detail: None,
            attempt_count: 0,
            next_attempt_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        tables.submissions.insert(submission.id.clone(), submission.clone());
        Ok(submission)
    }

    async fn update_submission(
        &self,
        id: &str,
        patch: &SubmissionPatch,
        expected_version: i64,
    ) -> Result<Submission, StoreError> {
        let mut tables = self.tables.lock().await;
        let current = tables
            .submissions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { entity: "submission", id: id.to_string() })?;

        if current.version != expected_version {
            return Err(StoreError::Conflict {
                entity: "submission",
                id: id.to_string(),
                expected: expected_version,
            });
        }

        patch.apply(current, primitive_now_utc());
        Ok(current.clone())
    }

    async fn find_submission(&self, id: &str) -> Result<Option<Submission>, StoreError> {
        Ok(self.tables.lock().await.submissions.get(id).cloned())
    }

    async fn list_batch_submissions(&self, batch_id: &str) -> Result<Vec<Submission>, StoreError> {
        let tables = self.tables.lock().await;
        let mut submissions: Vec<Submission> = tables
            .submissions
            .values()
            .filter(|submission| submission.batch_id == batch_id)
            .cloned()
            .collect();
        submissions.sort_by_key(|submission| submission.position);
        Ok(submissions)
    }

    async fn list_resumable(
        &self,
        now: PrimitiveDateTime,
        stale_before: PrimitiveDateTime,
        limit: i64,
    ) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.lock().await;
        let mut due: Vec<&Submission> = tables
            .submissions
            .values()
            .filter(|submission| match submission.status {
                SubmissionStatus::Pending => true,
                SubmissionStatus::Failed => {
                    submission.next_attempt_at.is_some_and(|retry_at| retry_at <= now)
                }
                SubmissionStatus::Extracting | SubmissionStatus::Scoring => {
                    submission.updated_at < stale_before
                }
                SubmissionStatus::Completed => false,
            })
            .collect();
        due.sort_by_key(|submission| submission.next_attempt_at.unwrap_or(submission.created_at));
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|submission| submission.id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::add_std;
    use crate::db::models::{GradeRecord, SubmissionError};
    use crate::db::types::FailureKind;
    use sqlx::types::Json;
    use std::time::Duration;

    async fn seeded() -> (MemoryResultStore, SubmissionBatch) {
        let store = MemoryResultStore::new();
        let now = primitive_now_utc();
        let answer = ModelAnswer {
            id: "ma-1".to_string(),
            owner_id: "instructor-1".to_string(),
            document_ref: "model.pdf".to_string(),
            extracted_text: "photosynthesis converts light".to_string(),
            total_marks: 10,
            criteria: None,
            keywords: Json(vec!["photosynthesis".to_string()]),
            locked: false,
            supersedes: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        store.create_model_answer(&answer).await.unwrap();
        let batch = SubmissionBatch {
            id: "batch-1".to_string(),
            model_answer_id: "ma-1".to_string(),
            created_at: now,
        };
        store.create_batch(&batch).await.unwrap();
        (store, batch)
    }

    fn completed_patch(score: i32) -> SubmissionPatch {
        SubmissionPatch {
            status: SubmissionStatus::Completed,
            document_hash: Some("abc".to_string()),
            extracted_text: Some("text".to_string()),
            grade: Some(GradeRecord {
                score,
                max_score: 10,
                criterion_scores: None,
                similarity: Some(0.8),
                keyword_coverage: 1.0,
                feedback: "ok".to_string(),
            }),
            error: None,
            attempt_count: 1,
            next_attempt_at: None,
        }
    }

    #[tokio::test]
    async fn positions_follow_insertion_order() {
        let (store, batch) = seeded().await;
        let first = store.create_submission(&batch.id, "a.pdf").await.unwrap();
        let second = store.create_submission(&batch.id, "b.pdf").await.unwrap();

        assert_eq!(first.position, 0);
        assert_eq!(second.position, 1);

        let listed = store.list_batch_submissions(&batch.id).await.unwrap();
        let refs: Vec<_> = listed.iter().map(|s| s.document_ref.as_str()).collect();
        assert_eq!(refs, vec!["a.pdf", "b.pdf"]);
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let (store, batch) = seeded().await;
        let created = store.create_submission(&batch.id, "a.pdf").await.unwrap();

        let updated = store.update_submission(&created.id, &completed_patch(7), 0).await.unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(updated.score, Some(7));

        let err = store.update_submission(&created.id, &completed_patch(3), 0).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 0, .. }));

        let stored = store.find_submission(&created.id).await.unwrap().unwrap();
        assert_eq!(stored.score, Some(7));
    }

    #[tokio::test]
    async fn delete_respects_batch_references() {
        let (store, batch) = seeded().await;
        store.create_submission(&batch.id, "a.pdf").await.unwrap();

        let err = store.delete_model_answer("ma-1", false).await.unwrap_err();
        assert!(matches!(err, StoreError::Referenced { .. }));

        assert!(store.delete_model_answer("ma-1", true).await.unwrap());
        assert!(store.find_batch(&batch.id).await.unwrap().is_none());
        assert!(store.list_batch_submissions(&batch.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn locked_model_answer_cannot_be_rewritten() {
        let (store, _) = seeded().await;
        store.lock_model_answer("ma-1").await.unwrap();

        let mut answer = store.find_model_answer("ma-1").await.unwrap().unwrap();
        let version = answer.version;
        answer.total_marks = 20;
        let err = store.update_model_answer(&answer, version).await.unwrap_err();
        assert!(matches!(err, StoreError::Locked { .. }));
    }

    #[tokio::test]
    async fn resumable_covers_pending_due_retries_and_stale_work() {
        let (store, batch) = seeded().await;
        let pending = store.create_submission(&batch.id, "pending.pdf").await.unwrap();
        let retry = store.create_submission(&batch.id, "retry.pdf").await.unwrap();
        let done = store.create_submission(&batch.id, "done.pdf").await.unwrap();

        let now = primitive_now_utc();
        let failed = SubmissionPatch {
            status: SubmissionStatus::Failed,
            document_hash: None,
            extracted_text: None,
            grade: None,
            error: Some(SubmissionError {
                kind: FailureKind::Timeout,
                detail: "timed out".to_string(),
            }),
            attempt_count: 1,
            next_attempt_at: Some(now),
        };
        store.update_submission(&retry.id, &failed, 0).await.unwrap();
        store.update_submission(&done.id, &completed_patch(5), 0).await.unwrap();

        let later = add_std(now, Duration::from_secs(1));
        let resumable = store.list_resumable(later, now, 10).await.unwrap();

        assert!(resumable.contains(&pending.id));
        assert!(resumable.contains(&retry.id));
        assert!(!resumable.contains(&done.id));
    }
}
