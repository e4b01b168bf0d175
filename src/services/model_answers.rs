use std::sync::Arc;

use sqlx::types::Json;
use thiserror::Error;

use crate::core::config::DeletePolicy;
use crate::core::time::primitive_now_utc;
use crate::db::models::{Criterion, ModelAnswer};
use crate::repositories::{ResultStore, StoreError};
use crate::services::extraction::{extract_blocking, DocumentExtractor, ExtractError};
use crate::services::model_answer_index::{build, IndexError};
use crate::services::storage::{DocumentSource, FetchError};
use crate::tasks::grading::{Orchestrator, OrchestratorError};

#[derive(Debug, Clone)]
pub struct NewModelAnswer {
    pub owner_id: String,
    pub document_ref: String,
    pub total_marks: i32,
    pub criteria: Option<Vec<Criterion>>,
}

/// Replacement grading inputs. Without a new document the existing text is
/// kept.
#[derive(Debug, Clone)]
pub struct ModelAnswerRevision {
    pub document_ref: Option<String>,
    pub total_marks: i32,
    pub criteria: Option<Vec<Criterion>>,
}

#[derive(Debug, Error)]
pub enum ModelAnswerError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("model answer {id} is used by {batches} batch(es)")]
    InUse { id: String, batches: usize },
    #[error("model answer {0} not found")]
    NotFound(String),
    #[error("only the owner may change model answer {0}")]
    NotOwner(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Model answer lifecycle: register, revise and delete.
#[derive(Clone)]
pub struct ModelAnswerService {
    store: Arc<dyn ResultStore>,
    documents: Arc<dyn DocumentSource>,
    extractor: Arc<dyn DocumentExtractor>,
    orchestrator: Orchestrator,
    delete_policy: DeletePolicy,
}

impl ModelAnswerService {
    pub fn new(
        store: Arc<dyn ResultStore>,
        documents: Arc<dyn DocumentSource>,
        extractor: Arc<dyn DocumentExtractor>,
        orchestrator: Orchestrator,
        delete_policy: DeletePolicy,
    ) -> Self {
        Self { store, documents, extractor, orchestrator, delete_policy }
    }

    /// Fetches and extracts the document, validates the rubric against it
    /// and persists the result.
    pub async fn register(&self, new: NewModelAnswer) -> Result<ModelAnswer, ModelAnswerError> {
        let text = self.read_document(&new.document_ref).await?;
        let answer = self.assemble(
            uuid::Uuid::new_v4().to_string(),
            new.owner_id,
            new.document_ref,
            &text,
            new.total_marks,
            new.criteria,
        )?;

        self.store.create_model_answer(&answer).await?;
        tracing::info!(
            model_answer_id = %answer.id,
            owner_id = %answer.owner_id,
            total_marks = answer.total_marks,
            criteria = answer.criteria().map_or(0, <[Criterion]>::len),
            "Model answer registered"
        );
        Ok(answer)
    }

    /// Rewrites an unlocked model answer in place. A locked one is left
    /// untouched and a new version superseding it is created instead.
    pub async fn revise(
        &self,
        id: &str,
        requester_id: &str,
        revision: ModelAnswerRevision,
    ) -> Result<ModelAnswer, ModelAnswerError> {
        let current = self.owned(id, requester_id).await?;

        let (document_ref, text) = match revision.document_ref {
            Some(document_ref) => {
                let text = self.read_document(&document_ref).await?;
                (document_ref, text)
            }
            None => (current.document_ref.clone(), current.extracted_text.clone()),
        };

        let mut candidate = self.assemble(
            current.id.clone(),
            current.owner_id.clone(),
            document_ref,
            &text,
            revision.total_marks,
            revision.criteria,
        )?;

        if !current.locked {
            match self.store.update_model_answer(&candidate, current.version).await {
                Ok(updated) => {
                    tracing::info!(model_answer_id = %updated.id, "Model answer revised in place");
                    return Ok(updated);
                }
                Err(StoreError::Locked { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }

        candidate.id = uuid::Uuid::new_v4().to_string();
        candidate.supersedes = Some(current.id.clone());
        self.store.create_model_answer(&candidate).await?;
        tracing::info!(
            model_answer_id = %candidate.id,
            supersedes = %current.id,
            "Locked model answer revised as a new version"
        );
        Ok(candidate)
    }

    /// Deletes a model answer. With batches attached this follows the
    /// configured policy: `reject` always refuses, `cascade` needs
    /// `confirm_cascade` and cancels outstanding grading first.
    pub async fn delete(
        &self,
        id: &str,
        requester_id: &str,
        confirm_cascade: bool,
    ) -> Result<(), ModelAnswerError> {
        let current = self.owned(id, requester_id).await?;
        let batch_ids = self.store.list_batch_ids(&current.id).await?;

        if !batch_ids.is_empty() {
            let cascade = self.delete_policy == DeletePolicy::Cascade && confirm_cascade;
            if !cascade {
                return Err(ModelAnswerError::InUse { id: current.id, batches: batch_ids.len() });
            }
            for batch_id in &batch_ids {
                self.orchestrator.cancel_batch(batch_id, requester_id).await?;
            }
        }

        match self.store.delete_model_answer(&current.id, !batch_ids.is_empty()).await {
            Ok(_) => {
                tracing::info!(
                    model_answer_id = %current.id,
                    batches = batch_ids.len(),
                    "Model answer deleted"
                );
                Ok(())
            }
            Err(StoreError::Referenced { .. }) => {
                let batches = self.store.list_batch_ids(&current.id).await?.len();
                Err(ModelAnswerError::InUse { id: current.id, batches })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn owned(&self, id: &str, requester_id: &str) -> Result<ModelAnswer, ModelAnswerError> {
        let answer = self
            .store
            .find_model_answer(id)
            .await?
            .ok_or_else(|| ModelAnswerError::NotFound(id.to_string()))?;
        if answer.owner_id != requester_id {
            return Err(ModelAnswerError::NotOwner(id.to_string()));
        }
        Ok(answer)
    }

    async fn read_document(&self, document_ref: &str) -> Result<String, ModelAnswerError> {
        let document = self.documents.fetch_document(document_ref).await?;
        let extracted =
            extract_blocking(self.extractor.clone(), document.bytes, document.content_type).await?;
        Ok(extracted.text)
    }

    fn assemble(
        &self,
        id: String,
        owner_id: String,
        document_ref: String,
        text: &str,
        total_marks: i32,
        criteria: Option<Vec<Criterion>>,
    ) -> Result<ModelAnswer, ModelAnswerError> {
        let criteria = criteria.filter(|criteria| !criteria.is_empty());
        let reference = build(&id, text, total_marks, criteria.as_deref())?;
        let now = primitive_now_utc();

        Ok(ModelAnswer {
            id,
            owner_id,
            document_ref,
            extracted_text: reference.overall.content.clone(),
            total_marks,
            criteria: criteria.map(Json),
            keywords: Json(reference.overall.keywords.clone()),
            locked: false,
            supersedes: None,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }
}
