//! Refresh pipeline: the run itself, its scheduling and its runtime.

mod metrics;
mod orchestrator;
mod scheduler;
mod worker;

#[cfg(test)]
mod orchestrator_integration_tests;

pub use metrics::{RunMetrics, RunMetricsSnapshot};
pub use orchestrator::{progress_after, Orchestrator, RunPermit, RunSummary};
pub use scheduler::RefreshScheduler;
pub use worker::RefreshWorker;
