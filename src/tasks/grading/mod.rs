mod inflight;
mod lifecycle;
mod orchestrator;

pub use lifecycle::BatchSummary;
pub use orchestrator::{
    BatchStatusView, CancelOutcome, Dispatched, Orchestrator, OrchestratorDeps, OrchestratorError,
    SubmittedBatch,
};
