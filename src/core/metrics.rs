use std::sync::OnceLock;

use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROM_HANDLE.set(handle);
    describe();
    Ok(())
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}

fn describe() {
    describe_counter!("grading_jobs_total", "Submission attempts by final outcome");
    describe_counter!("submission_retries_total", "Transient failures scheduled for retry");
    describe_counter!("extraction_failures_total", "Document extraction failures by kind");
    describe_counter!("comparison_calls_total", "Comparison provider calls by outcome");
    describe_counter!("store_conflicts_total", "Optimistic concurrency conflicts on submissions");
    describe_histogram!(
        "grading_duration_seconds",
        Unit::Seconds,
        "Wall time of one extraction and scoring attempt"
    );
    describe_histogram!(
        "comparison_duration_seconds",
        Unit::Seconds,
        "Latency of a single comparison provider call"
    );
}
