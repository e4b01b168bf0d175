use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::tasks::grading::Orchestrator;

/// Upper bound on submissions picked up by one sweep.
const SWEEP_BATCH: i64 = 200;

/// Periodically hands pending work, due retries and abandoned attempts back
/// to the orchestrator until `shutdown` fires. The first sweep runs
/// immediately so a restart resumes whatever the last process left behind.
pub(crate) async fn run(
    orchestrator: Orchestrator,
    sweep_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(sweep_interval.max(Duration::from_millis(100)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => sweep(&orchestrator).await,
        }
    }

    tracing::info!("Grading sweeper stopped");
}

async fn sweep(orchestrator: &Orchestrator) {
    match orchestrator.resume_pending(SWEEP_BATCH).await {
        Ok(work) => {
            if !work.ids().is_empty() {
                tracing::debug!(count = work.ids().len(), "Sweep dispatched submissions");
            }
        }
        Err(err) => tracing::error!(error = %err, "resume_pending failed"),
    }
}
