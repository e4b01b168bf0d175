use std::sync::Arc;

use sqlx::PgPool;

use crate::core::{config::Settings, redis::RedisHandle};
use crate::services::model_answers::ModelAnswerService;
use crate::tasks::grading::Orchestrator;

/// Everything a running pipeline process shares between its surfaces.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    db: PgPool,
    redis: RedisHandle,
    orchestrator: Orchestrator,
    model_answers: ModelAnswerService,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        db: PgPool,
        redis: RedisHandle,
        orchestrator: Orchestrator,
        model_answers: ModelAnswerService,
    ) -> Self {
        Self { inner: Arc::new(InnerState { settings, db, redis, orchestrator, model_answers }) }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn db(&self) -> &PgPool {
        &self.inner.db
    }

    pub(crate) fn redis(&self) -> &RedisHandle {
        &self.inner.redis
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.inner.orchestrator
    }

    pub fn model_answers(&self) -> &ModelAnswerService {
        &self.inner.model_answers
    }
}
