//! Periodic background refresh.
//!
//! The scheduler never stops on its own: a failed run is logged and the loop
//! goes back to sleep. Only the shutdown channel ends it.

use super::orchestrator::{Orchestrator, RunSummary};
use crate::config::RefreshConfig;
use crate::error::PipelineError;
use crate::source::ChunkSource;
use chrono::Utc;
use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;

/// Record a successful run and log it.
pub(crate) fn record_success<S: ChunkSource>(orchestrator: &Orchestrator<S>, summary: &RunSummary) {
    orchestrator.cache().set_last_refresh(Utc::now());
    tracing::info!("{}", summary);
}

/// Loop that re-runs the pipeline on an interval.
pub struct RefreshScheduler<S> {
    orchestrator: Orchestrator<S>,
    config: RefreshConfig,
}

impl<S: ChunkSource> RefreshScheduler<S> {
    pub fn new(orchestrator: Orchestrator<S>, config: RefreshConfig) -> Self {
        Self { orchestrator, config }
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_minutes.saturating_mul(60))
    }

    /// Sleep before the next run, never shorter than the interval.
    ///
    /// With back-off enabled the interval doubles per consecutive failure up
    /// to `max_backoff_minutes`. Jitter, when configured, is added on top.
    pub fn next_delay(&self, consecutive_failures: u32) -> Duration {
        let interval = self.interval();

        let delay = if self.config.failure_backoff && consecutive_failures > 0 {
            let factor = 2u32.saturating_pow(consecutive_failures.min(16));
            let cap = Duration::from_secs(self.config.max_backoff_minutes.saturating_mul(60)).max(interval);
            interval.saturating_mul(factor).min(cap)
        } else {
            interval
        };

        if self.config.jitter_secs == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=self.config.jitter_secs);
        delay + Duration::from_secs(jitter)
    }

    /// One scheduled run. Panics inside the run are caught and reported as
    /// [`PipelineError::Worker`].
    async fn run_once(&self) -> Result<RunSummary, PipelineError> {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move { orchestrator.load_and_snapshot().await })
            .await
            .map_err(|e| PipelineError::Worker(format!("refresh run panicked: {}", e)))?
    }

    /// Run until `shutdown` receives a message or its sender is dropped.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut failures = 0u32;
        let mut due = self.config.run_on_startup;

        tracing::info!(
            "Refresh scheduler started (every {} min, run on startup: {})",
            self.config.interval_minutes,
            self.config.run_on_startup
        );

        loop {
            if due {
                match self.run_once().await {
                    Ok(summary) => {
                        failures = 0;
                        record_success(&self.orchestrator, &summary);
                    }
                    Err(PipelineError::RunInProgress) => {
                        tracing::info!("Refresh already running, skipping scheduled run");
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        tracing::error!("Scheduled refresh failed ({} in a row): {}", failures, e);
                    }
                }
            }
            due = true;

            let delay = self.next_delay(failures);
            tracing::debug!("Next refresh in {:.0}s", delay.as_secs_f64());

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => {
                    tracing::info!("Refresh scheduler stopped");
                    break;
                }
            }
        }
    }
}
