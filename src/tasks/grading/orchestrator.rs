use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use crate::core::config::GradingSettings;
use crate::core::redis::{submission_lease_key, RedisHandle};
use crate::core::time::{add_std, format_primitive, primitive_now_utc, sub_std, until};
use crate::db::models::{Submission, SubmissionBatch, SubmissionPatch};
use crate::db::types::{BatchStatus, FailureKind, SubmissionStatus};
use crate::repositories::{ResultStore, StoreError};
use crate::services::comparison::ComparisonProvider;
use crate::services::extraction::DocumentExtractor;
use crate::services::feedback::{FeedbackRequest, FeedbackWriter};
use crate::services::model_answer_index::{IndexError, ModelAnswerReference};
use crate::services::ocr::{extract_document, Ocr};
use crate::services::scoring::{ScoreResult, ScoringEngine, ScoringPolicy};
use crate::services::storage::{DocumentSource, FetchError};

use super::inflight::{wait_for_leader, Entry, InflightRegistry};
use super::lifecycle::{self, BatchSummary};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("a batch needs at least one submission")]
    EmptyBatch,
    #[error("batch has {count} submissions, the limit is {limit}")]
    TooManySubmissions { count: usize, limit: usize },
    #[error("only the owner of the model answer may do this")]
    NotOwner,
    #[error("model answer cannot be graded against: {0}")]
    Index(#[from] IndexError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("orchestrator is shutting down")]
    Closed,
}

/// Collaborators the orchestrator drives.
pub struct OrchestratorDeps {
    pub store: Arc<dyn ResultStore>,
    pub documents: Arc<dyn DocumentSource>,
    pub extractor: Arc<dyn DocumentExtractor>,
    pub provider: Arc<dyn ComparisonProvider>,
    /// Transcribes scanned sheets; without it they fail as unreadable.
    pub ocr: Option<Ocr>,
    /// Writes prose feedback; without it the computed summary is kept.
    pub feedback: Option<Arc<dyn FeedbackWriter>>,
    pub redis: RedisHandle,
}

/// What every submission in one batch grades against. Lives as long as some
/// worker of the batch holds it.
pub struct BatchContext {
    pub batch_id: String,
    pub owner_id: String,
    pub reference: Arc<ModelAnswerReference>,
}

/// Background grading tasks started by one call. Dropping this detaches the
/// tasks; they keep running.
#[derive(Debug)]
pub struct Dispatched {
    ids: Vec<String>,
    handles: Vec<JoinHandle<()>>,
}

impl Dispatched {
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "Grading task join failed");
            }
        }
    }
}

#[derive(Debug)]
pub struct SubmittedBatch {
    pub batch: SubmissionBatch,
    pub work: Dispatched,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStatusView {
    pub batch_id: String,
    pub model_answer_id: String,
    pub status: BatchStatus,
    pub summary: BatchSummary,
    pub submissions: Vec<Submission>,
}

#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The submission was moved to Failed/Cancelled.
    Applied(Submission),
    /// A worker holds the submission and will cancel it at its next step.
    Requested,
    AlreadyTerminal(Submission),
}

enum Progress {
    /// Our write landed; plan the next step from this row.
    Continue(Submission),
    /// Someone else moved the row; stop driving it.
    Yield(Submission),
}

enum Claimed {
    Ran(Progress),
    /// The row changed while queued; plan again from it.
    Moved(Submission),
}

struct Lease {
    key: String,
    token: String,
}

impl Lease {
    async fn release(self, redis: &RedisHandle) {
        if let Err(err) = redis.release_lease(&self.key, &self.token).await {
            tracing::warn!(lease = %self.key, error = %err, "Failed to release grading lease");
        }
    }
}

enum Plan {
    Run,
    WaitUntil(time::PrimitiveDateTime),
    Done,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn ResultStore>,
    documents: Arc<dyn DocumentSource>,
    extractor: Arc<dyn DocumentExtractor>,
    ocr: Option<Ocr>,
    feedback: Option<Arc<dyn FeedbackWriter>>,
    engine: ScoringEngine,
    grading: GradingSettings,
    permits: Semaphore,
    inflight: InflightRegistry,
    cancellations: Mutex<HashSet<String>>,
    cancel_signal: watch::Sender<u64>,
    contexts: Mutex<HashMap<String, Weak<BatchContext>>>,
    redis: RedisHandle,
    instance_id: String,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps, grading: GradingSettings) -> Self {
        let engine = ScoringEngine::new(deps.provider, ScoringPolicy::from_grading(&grading));
        let (cancel_signal, _) = watch::channel(0);

        Self {
            inner: Arc::new(Inner {
                store: deps.store,
                documents: deps.documents,
                extractor: deps.extractor,
                ocr: deps.ocr,
                feedback: deps.feedback,
                engine,
                permits: Semaphore::new(grading.parallelism.max(1)),
                grading,
                inflight: InflightRegistry::default(),
                cancellations: Mutex::new(HashSet::new()),
                cancel_signal,
                contexts: Mutex::new(HashMap::new()),
                redis: deps.redis,
                instance_id: uuid::Uuid::new_v4().to_string(),
            }),
        }
    }

    /// Creates a batch against `model_answer_id` and starts grading every
    /// document in it. Locks the model answer.
    pub async fn submit_batch(
        &self,
        model_answer_id: &str,
        document_refs: Vec<String>,
    ) -> Result<SubmittedBatch, OrchestratorError> {
        if document_refs.is_empty() {
            return Err(OrchestratorError::EmptyBatch);
        }
        let limit = self.inner.grading.max_bulk_upload;
        if document_refs.len() > limit {
            return Err(OrchestratorError::TooManySubmissions { count: document_refs.len(), limit });
        }

        let store = &self.inner.store;
        let answer = store.find_model_answer(model_answer_id).await?.ok_or_else(|| {
            OrchestratorError::NotFound { entity: "model answer", id: model_answer_id.to_string() }
        })?;
        let reference = ModelAnswerReference::from_model_answer(&answer)?;

        store.lock_model_answer(&answer.id).await?;

        let batch = SubmissionBatch {
            id: uuid::Uuid::new_v4().to_string(),
            model_answer_id: answer.id.clone(),
            created_at: primitive_now_utc(),
        };
        store.create_batch(&batch).await?;

        let mut ids = Vec::with_capacity(document_refs.len());
        for document_ref in &document_refs {
            let submission = store.create_submission(&batch.id, document_ref).await?;
            ids.push(submission.id);
        }

        let context = Arc::new(BatchContext {
            batch_id: batch.id.clone(),
            owner_id: answer.owner_id.clone(),
            reference,
        });
        self.remember_context(&context);

        tracing::info!(
            batch_id = %batch.id,
            model_answer_id = %answer.id,
            submissions = ids.len(),
            "Batch submitted"
        );

        let work = self.dispatch(Some(context), ids);
        Ok(SubmittedBatch { batch, work })
    }

    /// Scores (or re-scores) one submission and returns its row afterwards.
    /// Concurrent calls for the same id share one attempt.
    pub async fn score_submission(&self, id: &str) -> Result<Submission, OrchestratorError> {
        self.score_with(None, id).await
    }

    pub async fn submission(&self, id: &str) -> Result<Submission, OrchestratorError> {
        self.load_submission(id).await
    }

    pub async fn batch_status(
        &self,
        batch_id: &str,
    ) -> Result<BatchStatusView, OrchestratorError> {
        let batch = self.inner.store.find_batch(batch_id).await?.ok_or_else(|| {
            OrchestratorError::NotFound { entity: "batch", id: batch_id.to_string() }
        })?;
        let submissions = self.inner.store.list_batch_submissions(batch_id).await?;

        Ok(BatchStatusView {
            batch_id: batch.id,
            model_answer_id: batch.model_answer_id,
            status: lifecycle::derive_batch_status(&submissions),
            summary: lifecycle::summarize(&submissions),
            submissions,
        })
    }

    pub async fn cancel_submission(
        &self,
        id: &str,
        requester_id: &str,
    ) -> Result<CancelOutcome, OrchestratorError> {
        let submission = self.load_submission(id).await?;
        let context = self.context_for(&submission.batch_id).await?;
        if context.owner_id != requester_id {
            return Err(OrchestratorError::NotOwner);
        }
        self.request_cancel(submission).await
    }

    pub async fn cancel_batch(
        &self,
        batch_id: &str,
        requester_id: &str,
    ) -> Result<Vec<CancelOutcome>, OrchestratorError> {
        let context = self.context_for(batch_id).await?;
        if context.owner_id != requester_id {
            return Err(OrchestratorError::NotOwner);
        }

        let submissions = self.inner.store.list_batch_submissions(batch_id).await?;
        let mut outcomes = Vec::with_capacity(submissions.len());
        for submission in submissions {
            outcomes.push(self.request_cancel(submission).await?);
        }

        tracing::info!(batch_id, requester_id, "Batch cancellation requested");
        Ok(outcomes)
    }

    /// Picks up pending submissions, due retries and attempts abandoned by
    /// a dead worker, and starts grading them.
    pub async fn resume_pending(&self, limit: i64) -> Result<Dispatched, OrchestratorError> {
        let now = primitive_now_utc();
        let stale_before = sub_std(now, self.inner.grading.stale_after);
        let ids: Vec<String> = self
            .inner
            .store
            .list_resumable(now, stale_before, limit)
            .await?
            .into_iter()
            .filter(|id| !self.inner.inflight.contains(id))
            .collect();

        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "Resuming submissions");
        }
        Ok(self.dispatch(None, ids))
    }

    fn dispatch(&self, context: Option<Arc<BatchContext>>, ids: Vec<String>) -> Dispatched {
        let handles = ids
            .iter()
            .map(|id| {
                let orchestrator = self.clone();
                let context = context.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    if let Err(err) = orchestrator.score_with(context, &id).await {
                        tracing::error!(submission_id = %id, error = %err, "Grading task failed");
                    }
                })
            })
            .collect();
        Dispatched { ids, handles }
    }

    async fn score_with(
        &self,
        context: Option<Arc<BatchContext>>,
        id: &str,
    ) -> Result<Submission, OrchestratorError> {
        let guard = match self.inner.inflight.enter(id) {
            Entry::Leader(guard) => guard,
            Entry::Follower(receiver) => {
                tracing::debug!(submission_id = id, "Joining in-flight grading attempt");
                wait_for_leader(receiver).await;
                return self.load_submission(id).await;
            }
        };

        let result = self.drive(context, id).await;
        self.clear_cancellation(id);
        drop(guard);

        result
    }

    /// Plans and runs attempts until the submission is settled. A
    /// parallelism permit and the Redis lease are held only while an
    /// attempt runs, never while waiting out a retry.
    async fn drive(
        &self,
        context: Option<Arc<BatchContext>>,
        id: &str,
    ) -> Result<Submission, OrchestratorError> {
        let mut submission = self.load_submission(id).await?;
        let context = match context {
            Some(context) => context,
            None => self.context_for(&submission.batch_id).await?,
        };

        let mut first = true;
        loop {
            if self.cancel_requested(id) {
                return self.apply_cancel(submission).await;
            }

            match self.plan(&submission, first) {
                Plan::Done => return Ok(submission),
                Plan::WaitUntil(retry_at) => {
                    self.wait_for_retry(id, retry_at).await;
                    submission = self.load_submission(id).await?;
                    continue;
                }
                Plan::Run => {}
            }
            first = false;

            let permit = self.inner.permits.acquire().await.map_err(|_| OrchestratorError::Closed)?;
            let Some(lease) = self.acquire_lease(id).await else {
                return self.load_submission(id).await;
            };

            let outcome = self.claimed_attempt(&context, submission).await;

            lease.release(&self.inner.redis).await;
            drop(permit);

            submission = match outcome? {
                Claimed::Ran(Progress::Continue(submission)) | Claimed::Moved(submission) => {
                    submission
                }
                Claimed::Ran(Progress::Yield(submission)) => return Ok(submission),
            };
        }
    }

    /// Runs one attempt once the slot is ours. The row is re-read first
    /// because it may have moved while this worker queued for a permit.
    async fn claimed_attempt(
        &self,
        context: &BatchContext,
        planned: Submission,
    ) -> Result<Claimed, OrchestratorError> {
        let current = self.load_submission(&planned.id).await?;
        if self.cancel_requested(&current.id) {
            return self.apply_cancel(current).await.map(|row| Claimed::Ran(Progress::Yield(row)));
        }
        if current.version != planned.version {
            return Ok(Claimed::Moved(current));
        }
        self.attempt(context, current).await.map(Claimed::Ran)
    }

    async fn acquire_lease(&self, id: &str) -> Option<Lease> {
        let lease = Lease {
            key: submission_lease_key(id),
            token: format!("{}:{}", self.inner.instance_id, uuid::Uuid::new_v4()),
        };
        match self
            .inner
            .redis
            .try_acquire_lease(&lease.key, &lease.token, self.inner.grading.lease_ttl)
            .await
        {
            Ok(true) => Some(lease),
            Ok(false) => {
                tracing::info!(submission_id = id, "Submission is being graded elsewhere");
                None
            }
            Err(err) => {
                tracing::warn!(
                    submission_id = id,
                    error = %err,
                    "Failed to acquire grading lease; relying on version checks"
                );
                Some(lease)
            }
        }
    }

    fn plan(&self, submission: &Submission, first: bool) -> Plan {
        let max_attempts = self.max_attempts();
        match submission.status {
            SubmissionStatus::Completed => Plan::Done,
            SubmissionStatus::Failed => match submission.next_attempt_at {
                Some(_) if submission.attempt_count >= max_attempts => Plan::Done,
                Some(retry_at) if retry_at > primitive_now_utc() => Plan::WaitUntil(retry_at),
                Some(_) => Plan::Run,
                None if first
                    && submission.error_kind != Some(FailureKind::Cancelled)
                    && submission.attempt_count < max_attempts =>
                {
                    Plan::Run
                }
                None => Plan::Done,
            },
            SubmissionStatus::Pending | SubmissionStatus::Extracting | SubmissionStatus::Scoring => {
                Plan::Run
            }
        }
    }

    /// One extraction and scoring pass. Every status change is a single
    /// conditional write.
    async fn attempt(
        &self,
        context: &BatchContext,
        submission: Submission,
    ) -> Result<Progress, OrchestratorError> {
        let started = Instant::now();
        let resuming_scoring =
            submission.status == SubmissionStatus::Scoring && submission.extracted_text.is_some();

        let submission = if resuming_scoring {
            submission
        } else {
            let patch = lifecycle::begin_attempt(&submission);
            let submission = match self.transition(submission, patch).await? {
                Progress::Continue(submission) => submission,
                yielded => return Ok(yielded),
            };

            tracing::info!(
                submission_id = %submission.id,
                batch_id = %submission.batch_id,
                attempt = submission.attempt_count,
                "Extracting submission"
            );

            let document = match self.inner.documents.fetch_document(&submission.document_ref).await
            {
                Ok(document) => document,
                Err(FetchError::NotFound(document_ref)) => {
                    let detail = format!("Document {document_ref} does not exist");
                    return self.fail(submission, FailureKind::Unreadable, detail).await;
                }
                Err(FetchError::Unavailable(detail)) => {
                    return self.fail(submission, FailureKind::DocumentUnavailable, detail).await;
                }
            };

            let extracted = match extract_document(
                self.inner.extractor.clone(),
                self.inner.ocr.as_ref(),
                document.bytes,
                document.content_type,
            )
            .await
            {
                Ok(extracted) => extracted,
                Err(err) => {
                    let kind = err.failure_kind();
                    metrics::counter!("extraction_failures_total", "kind" => kind.as_str())
                        .increment(1);
                    return self.fail(submission, kind, err.to_string()).await;
                }
            };

            if self.cancel_requested(&submission.id) {
                return self.apply_cancel(submission).await.map(Progress::Yield);
            }

            let patch = lifecycle::extracted(&submission, extracted.text, extracted.content_hash);
            match self.transition(submission, patch).await? {
                Progress::Continue(submission) => submission,
                yielded => return Ok(yielded),
            }
        };

        tracing::info!(
            submission_id = %submission.id,
            batch_id = %submission.batch_id,
            attempt = submission.attempt_count,
            "Scoring submission"
        );

        let text = submission.extracted_text.clone().unwrap_or_default();
        let outcome = self.inner.engine.score(&text, &context.reference).await;

        if self.cancel_requested(&submission.id) {
            return self.apply_cancel(submission).await.map(Progress::Yield);
        }

        match outcome {
            Ok(result) => {
                let result = self.with_feedback(&text, &context.reference, result).await;
                let patch = lifecycle::completed(&submission, &result);
                let progress = self.transition(submission, patch).await?;
                if let Progress::Continue(done) = &progress {
                    metrics::counter!("grading_jobs_total", "status" => "completed").increment(1);
                    metrics::histogram!("grading_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    tracing::info!(
                        submission_id = %done.id,
                        batch_id = %done.batch_id,
                        attempt = done.attempt_count,
                        score = result.marks,
                        max_score = result.total_marks,
                        "Submission graded"
                    );
                }
                Ok(progress)
            }
            Err(err) => self.fail(submission, err.failure_kind(), err.to_string()).await,
        }
    }

    /// Replaces the summary sentence with written feedback when a writer is
    /// configured. Any failure keeps the summary; it never fails the attempt.
    async fn with_feedback(
        &self,
        text: &str,
        reference: &ModelAnswerReference,
        mut result: ScoreResult,
    ) -> ScoreResult {
        let Some(writer) = &self.inner.feedback else {
            return result;
        };
        if text.trim().is_empty() {
            return result;
        }

        let request = FeedbackRequest {
            model_text: &reference.overall.content,
            student_text: text,
            similarity: result.similarity,
            keyword_coverage: result.keyword_coverage,
        };
        match tokio::time::timeout(self.inner.grading.compare_timeout, writer.write(&request)).await
        {
            Ok(Ok(feedback)) => result.feedback = feedback,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "Feedback generation failed; keeping summary")
            }
            Err(_) => tracing::warn!("Feedback generation timed out; keeping summary"),
        }
        result
    }

    /// Records a failure, scheduling a retry when the kind is transient and
    /// attempts remain.
    async fn fail(
        &self,
        submission: Submission,
        kind: FailureKind,
        detail: String,
    ) -> Result<Progress, OrchestratorError> {
        let retry_at = if kind.is_transient() && submission.attempt_count < self.max_attempts() {
            let attempt = u32::try_from(submission.attempt_count).unwrap_or(u32::MAX);
            let delay = lifecycle::backoff_delay(
                attempt,
                self.inner.grading.backoff_base,
                self.inner.grading.backoff_max,
            );
            Some(add_std(primitive_now_utc(), delay))
        } else {
            None
        };

        if let Some(retry_at) = retry_at {
            metrics::counter!("submission_retries_total").increment(1);
            tracing::warn!(
                submission_id = %submission.id,
                batch_id = %submission.batch_id,
                attempt = submission.attempt_count,
                kind = kind.as_str(),
                retry_at = %format_primitive(retry_at),
                error = %detail,
                "Grading attempt failed; retry scheduled"
            );
        } else {
            metrics::counter!("grading_jobs_total", "status" => "failed").increment(1);
            tracing::error!(
                submission_id = %submission.id,
                batch_id = %submission.batch_id,
                attempt = submission.attempt_count,
                kind = kind.as_str(),
                error = %detail,
                "Submission failed"
            );
        }

        let patch = lifecycle::failed(&submission, kind, detail, retry_at);
        self.transition(submission, patch).await
    }

    /// Writes `patch` conditionally on the row's version. A conflict is
    /// retried against a fresh read while the row still has the status we
    /// expected; any other change means another writer owns it now.
    async fn transition(
        &self,
        current: Submission,
        patch: SubmissionPatch,
    ) -> Result<Progress, OrchestratorError> {
        let mut current = current;
        let retries = self.inner.grading.conflict_retries;

        for _ in 0..=retries {
            if !lifecycle::is_allowed(current.status, patch.status) {
                return Ok(Progress::Yield(current));
            }

            match self.inner.store.update_submission(&current.id, &patch, current.version).await {
                Ok(updated) => {
                    tracing::debug!(
                        submission_id = %updated.id,
                        from = current.status.as_str(),
                        to = updated.status.as_str(),
                        "Submission status changed"
                    );
                    return Ok(Progress::Continue(updated));
                }
                Err(StoreError::Conflict { .. }) => {
                    metrics::counter!("store_conflicts_total").increment(1);
                    let fresh = self.load_submission(&current.id).await?;
                    if fresh.status != current.status || fresh.is_terminal() {
                        return Ok(Progress::Yield(fresh));
                    }
                    current = fresh;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(StoreError::Conflict {
            entity: "submission",
            id: current.id.clone(),
            expected: current.version,
        }
        .into())
    }

    async fn request_cancel(&self, submission: Submission) -> Result<CancelOutcome, OrchestratorError> {
        let id = submission.id.clone();
        let mut current = submission;

        for _ in 0..=self.inner.grading.conflict_retries {
            if current.is_terminal() {
                return Ok(CancelOutcome::AlreadyTerminal(current));
            }

            self.mark_cancelled(&id);
            if self.inner.inflight.contains(&id) {
                tracing::info!(submission_id = %id, "Cancellation handed to running worker");
                return Ok(CancelOutcome::Requested);
            }

            match self
                .inner
                .store
                .update_submission(&id, &lifecycle::cancelled(&current), current.version)
                .await
            {
                Ok(updated) => {
                    self.clear_cancellation(&id);
                    metrics::counter!("grading_jobs_total", "status" => "cancelled").increment(1);
                    tracing::info!(submission_id = %id, "Submission cancelled");
                    return Ok(CancelOutcome::Applied(updated));
                }
                Err(StoreError::Conflict { .. }) => {
                    metrics::counter!("store_conflicts_total").increment(1);
                    current = self.load_submission(&id).await?;
                }
                Err(err) => {
                    self.clear_cancellation(&id);
                    return Err(err.into());
                }
            }
        }

        Err(StoreError::Conflict { entity: "submission", id, expected: current.version }.into())
    }

    async fn apply_cancel(&self, submission: Submission) -> Result<Submission, OrchestratorError> {
        let patch = lifecycle::cancelled(&submission);
        let result = match self.transition(submission, patch).await? {
            Progress::Continue(submission) => {
                metrics::counter!("grading_jobs_total", "status" => "cancelled").increment(1);
                tracing::info!(
                    submission_id = %submission.id,
                    batch_id = %submission.batch_id,
                    "Submission cancelled; in-flight result discarded"
                );
                submission
            }
            Progress::Yield(submission) => submission,
        };
        self.clear_cancellation(&result.id);
        Ok(result)
    }

    async fn wait_for_retry(&self, id: &str, retry_at: time::PrimitiveDateTime) {
        let delay = until(retry_at, primitive_now_utc());
        let mut signal = self.inner.cancel_signal.subscribe();

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = async {
                while !self.cancel_requested(id) {
                    if signal.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            } => {}
        }
    }

    async fn context_for(&self, batch_id: &str) -> Result<Arc<BatchContext>, OrchestratorError> {
        if let Some(context) = self.cached_context(batch_id) {
            return Ok(context);
        }

        let store = &self.inner.store;
        let batch = store.find_batch(batch_id).await?.ok_or_else(|| OrchestratorError::NotFound {
            entity: "batch",
            id: batch_id.to_string(),
        })?;
        let answer = store.find_model_answer(&batch.model_answer_id).await?.ok_or_else(|| {
            OrchestratorError::NotFound { entity: "model answer", id: batch.model_answer_id.clone() }
        })?;

        let context = Arc::new(BatchContext {
            batch_id: batch.id,
            owner_id: answer.owner_id.clone(),
            reference: ModelAnswerReference::from_model_answer(&answer)?,
        });

        let mut contexts = self.inner.contexts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = contexts.get(batch_id).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        contexts.retain(|_, weak| weak.strong_count() > 0);
        contexts.insert(batch_id.to_string(), Arc::downgrade(&context));
        Ok(context)
    }

    fn cached_context(&self, batch_id: &str) -> Option<Arc<BatchContext>> {
        self.inner
            .contexts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(batch_id)
            .and_then(Weak::upgrade)
    }

    fn remember_context(&self, context: &Arc<BatchContext>) {
        let mut contexts = self.inner.contexts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        contexts.retain(|_, weak| weak.strong_count() > 0);
        contexts.insert(context.batch_id.clone(), Arc::downgrade(context));
    }

    async fn load_submission(&self, id: &str) -> Result<Submission, OrchestratorError> {
        self.inner.store.find_submission(id).await?.ok_or_else(|| OrchestratorError::NotFound {
            entity: "submission",
            id: id.to_string(),
        })
    }

    fn max_attempts(&self) -> i32 {
        i32::try_from(self.inner.grading.max_attempts).unwrap_or(i32::MAX)
    }

    fn cancel_requested(&self, id: &str) -> bool {
        self.inner.cancellations.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).contains(id)
    }

    fn mark_cancelled(&self, id: &str) {
        self.inner
            .cancellations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.to_string());
        self.inner.cancel_signal.send_modify(|generation| *generation += 1);
    }

    fn clear_cancellation(&self, id: &str) {
        self.inner.cancellations.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).remove(id);
    }
}
