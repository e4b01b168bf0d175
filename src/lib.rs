//! Answer evaluation pipeline: grades scanned answer sheets against an
//! instructor's model answer.
//!
//! [`connect`] wires the pipeline against Postgres, Redis, S3 and the
//! configured comparison provider; [`run`] is the service entrypoint that
//! also serves `/healthz` and `/metrics` and resumes interrupted grading.

pub(crate) mod api;
pub mod core;
pub mod db;
pub mod repositories;
pub mod services;
pub mod tasks;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::core::{
    config::Settings, redis::RedisHandle, shutdown::Shutdown, state::AppState, telemetry,
};
use crate::repositories::PgResultStore;
use crate::services::comparison;
use crate::services::extraction::{DocumentExtractor, PdfExtractor};
use crate::services::feedback::{FeedbackWriter, LlmFeedbackWriter};
use crate::services::model_answers::ModelAnswerService;
use crate::services::ocr::{Ocr, VisionPageReader};
use crate::services::storage::{DocumentSource, StorageService, UnconfiguredStorage};
use crate::tasks::grading::{Orchestrator, OrchestratorDeps};

/// Builds the pipeline: database pool with migrations applied, Redis leases,
/// document storage, extractor, comparison provider, orchestrator and the
/// model answer service.
pub async fn connect(settings: Settings) -> anyhow::Result<AppState> {
    let db_pool = db::init_pool(&settings).await.context("Failed to connect to Postgres")?;
    db::run_migrations(&db_pool).await.context("Failed to run database migrations")?;

    let redis = RedisHandle::new(settings.redis().redis_url());
    if let Err(err) = redis.connect().await {
        tracing::error!(error = %err, "Failed to connect to Redis; grading leases stay in-process");
    } else {
        tracing::info!("Redis connected successfully");
    }

    let documents: Arc<dyn DocumentSource> = match StorageService::from_settings(&settings)
        .await
        .context("Failed to configure S3 storage")?
    {
        Some(storage) => Arc::new(storage),
        None => {
            tracing::warn!("S3 storage is not configured; document fetches will fail");
            Arc::new(UnconfiguredStorage)
        }
    };
    let extractor: Arc<dyn DocumentExtractor> =
        Arc::new(PdfExtractor::new(settings.grading().max_document_bytes));
    let provider = comparison::from_settings(&settings)?;
    let ai_client = comparison::http_client(Duration::from_secs(settings.ai().ai_request_timeout))?;
    let ocr = if settings.ai().ocr_enabled && !settings.ai().openai_api_key.is_empty() {
        let reader = Arc::new(VisionPageReader::new(ai_client.clone(), settings.ai()));
        Some(Ocr::new(reader, settings.grading().ocr_max_pages))
    } else {
        tracing::warn!("Scanned-sheet transcription is off; sheets without text will fail");
        None
    };
    let feedback: Option<Arc<dyn FeedbackWriter>> = if settings.ai().feedback_enabled {
        Some(Arc::new(LlmFeedbackWriter::new(ai_client, settings.ai())))
    } else {
        None
    };
    let store = Arc::new(PgResultStore::new(db_pool.clone()));

    tracing::info!(
        strategy = provider.name(),
        ocr = ocr.is_some(),
        feedback = feedback.is_some(),
        parallelism = settings.grading().parallelism,
        max_attempts = settings.grading().max_attempts,
        "Grading pipeline configured"
    );

    let orchestrator = Orchestrator::new(
        OrchestratorDeps {
            store: store.clone(),
            documents: documents.clone(),
            extractor: extractor.clone(),
            provider,
            ocr,
            feedback,
            redis: redis.clone(),
        },
        settings.grading().clone(),
    );
    let model_answers = ModelAnswerService::new(
        store,
        documents,
        extractor,
        orchestrator.clone(),
        settings.grading().delete_policy,
    );

    Ok(AppState::new(settings, db_pool, redis, orchestrator, model_answers))
}

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let state = connect(settings).await?;

    let shutdown = Shutdown::new();
    let sweeper = tokio::spawn(tasks::scheduler::run(
        state.orchestrator().clone(),
        state.settings().grading().sweep_interval,
        shutdown.subscribe(),
    ));

    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        host = %state.settings().server_host(),
        port = state.settings().server_port(),
        environment = %state.settings().runtime().environment.as_str(),
        "markwise listening"
    );

    let result =
        axum::serve(listener, app).with_graceful_shutdown(core::shutdown::shutdown_signal()).await;

    shutdown.trigger();
    if let Err(err) = sweeper.await {
        tracing::error!(error = %err, "Grading sweeper join failed");
    }

    state.redis().disconnect().await;
    tracing::info!("Redis disconnected");

    result?;

    Ok(())
}
