//! One refresh run: stream, accumulate, snapshot, publish.

use super::metrics::{RunMetrics, RunMetricsSnapshot};
use crate::aggregate::{LastProductIndex, RunAccumulator};
use crate::cache::AnalyticsCache;
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::model::RunStatus;
use crate::snapshot::SnapshotWriter;
use crate::source::ChunkSource;
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::Instrument;

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub rows: u64,
    pub total_revenue: f64,
    /// Published snapshot, `None` when no snapshot file exists after the merge
    pub snapshot: Option<PathBuf>,
    pub metrics: RunMetricsSnapshot,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Run {}: {} rows, revenue {:.2}, snapshot {}",
            self.run_id,
            self.rows,
            self.total_revenue,
            self.snapshot
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string())
        )
    }
}

/// Heuristic progress after `chunks` chunks: rises monotonically towards 100
/// without reaching it. The total chunk count is unknown up front.
pub fn progress_after(chunks: u64) -> u8 {
    let estimate = (chunks as f64 * 100.0 / (chunks as f64 + 1.0)).round();
    estimate.min(99.0) as u8
}

fn new_run_id() -> String {
    format!(
        "{}-{:04x}",
        Utc::now().format("%Y%m%dT%H%M%S%3f"),
        rand::random::<u16>()
    )
}

/// Exclusive right to run a refresh on one orchestrator.
pub struct RunPermit {
    guard: Arc<Semaphore>,
    _permit: OwnedSemaphorePermit,
}

/// Puts the pre-run status back unless disarmed.
struct StatusRestore<'a> {
    cache: &'a AnalyticsCache,
    previous: RunStatus,
    armed: bool,
}

impl StatusRestore<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StatusRestore<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.set_status(self.previous);
        }
    }
}

/// Drives a [`ChunkSource`] through the accumulators and the snapshot writer
/// and publishes the results into the cache.
///
/// Cloning is cheap and every clone shares the same run guard, so at most one
/// run is active per orchestrator family.
pub struct Orchestrator<S> {
    source: Arc<S>,
    cache: AnalyticsCache,
    config: Arc<Config>,
    guard: Arc<Semaphore>,
}

impl<S> Clone for Orchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            cache: self.cache.clone(),
            config: self.config.clone(),
            guard: self.guard.clone(),
        }
    }
}

impl<S: ChunkSource> Orchestrator<S> {
    pub fn new(source: Arc<S>, cache: AnalyticsCache, config: Arc<Config>) -> Self {
        Self {
            source,
            cache,
            config,
            guard: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub fn cache(&self) -> &AnalyticsCache {
        &self.cache
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// True while a run holds the guard.
    pub fn is_running(&self) -> bool {
        self.guard.available_permits() == 0
    }

    /// Claim the run guard without starting a run.
    ///
    /// Fails with [`PipelineError::RunInProgress`] when another run holds it.
    /// The permit is released when dropped or when the run it is passed to ends.
    pub fn try_begin(&self) -> Result<RunPermit> {
        let permit = self
            .guard
            .clone()
            .try_acquire_owned()
            .map_err(|_| PipelineError::RunInProgress)?;
        Ok(RunPermit {
            guard: self.guard.clone(),
            _permit: permit,
        })
    }

    /// Run the whole pipeline once.
    ///
    /// Fails with [`PipelineError::RunInProgress`] without touching status or
    /// files when another run is active. On any other failure the status in
    /// effect before the run is restored, so a failed refresh never hides a
    /// previously loaded dataset.
    pub async fn load_and_snapshot(&self) -> Result<RunSummary> {
        let permit = self.try_begin()?;
        self.run_with(permit).await
    }

    /// Run the pipeline under a permit obtained from [`Self::try_begin`].
    ///
    /// The previous status is restored if the run fails, panics or is
    /// cancelled.
    pub async fn run_with(&self, permit: RunPermit) -> Result<RunSummary> {
        if !Arc::ptr_eq(&permit.guard, &self.guard) {
            return Err(PipelineError::Worker(
                "run permit was issued by another orchestrator".into(),
            ));
        }

        let run_id = new_run_id();
        let restore = StatusRestore {
            cache: &self.cache,
            previous: self.cache.status(),
            armed: true,
        };
        self.cache.set_status(RunStatus::running(0));

        let span = tracing::info_span!("refresh_run", run_id = %run_id);
        let result = self.run(&run_id).instrument(span).await;

        match &result {
            Ok(_) => restore.disarm(),
            Err(e) => {
                tracing::error!("Refresh run {} failed: {}", run_id, e);
                drop(restore);
            }
        }
        // Status is settled before another run can start
        drop(permit);
        result
    }

    fn seed_last_products(&self) -> LastProductIndex {
        if self.config.journey.carry_last_product_across_runs {
            self.cache
                .last_products()
                .map(|index| (*index).clone())
                .unwrap_or_default()
        } else {
            self.cache.clear_last_products();
            LastProductIndex::default()
        }
    }

    async fn run(&self, run_id: &str) -> Result<RunSummary> {
        let config = self.config.clone();
        config.validate()?;

        tracing::info!(
            "Refreshing from table {} (chunk size {})",
            config.source.table,
            config.source.chunk_size
        );

        let metrics = RunMetrics::new();
        let mut reader = self.source.open(config.source.chunk_size).await?;

        let seed = self.seed_last_products();
        tracing::debug!("Seeded journey stitching with {} customers", seed.len());

        let mut accumulator = RunAccumulator::new(seed);
        let mut writer = SnapshotWriter::begin(config.snapshot.path.clone(), run_id)?;
        let mut chunks = 0u64;

        while let Some(chunk) = reader.next_chunk().await {
            let chunk = chunk?;
            chunks += 1;
            accumulator.absorb(&chunk);
            metrics.add_chunk(chunk.len() as u64);

            let started = Instant::now();
            let bytes_before = writer.bytes_written();
            let (returned, written) = tokio::task::spawn_blocking(move || {
                let written = writer.write_part(&chunk);
                (writer, written)
            })
            .await
            .map_err(|e| PipelineError::Worker(format!("part writer panicked: {}", e)))?;
            writer = returned;
            written?;

            metrics.add_snapshot_io_time(started.elapsed());
            metrics.add_part(writer.bytes_written() - bytes_before);

            let progress = progress_after(chunks);
            self.cache.set_status(RunStatus::running(progress));
            tracing::debug!("Chunk {} processed, progress {}%", chunks, progress);
        }

        let started = Instant::now();
        tokio::task::spawn_blocking(move || writer.merge())
            .await
            .map_err(|e| PipelineError::Worker(format!("snapshot merge panicked: {}", e)))??;
        metrics.add_snapshot_io_time(started.elapsed());

        let results = accumulator.finish();
        let overview = results.overview;
        self.cache
            .publish_results(results, config.cache.ttl(), config.cache.last_product_ttl());

        let snapshot = config
            .snapshot
            .path
            .exists()
            .then(|| config.snapshot.path.clone());
        if let Some(path) = &snapshot {
            self.cache.set_snapshot_path(path.clone());
        }
        self.cache.set_status(RunStatus::ready());

        let metrics = metrics.snapshot();
        tracing::info!("Refresh complete: {}", metrics);

        Ok(RunSummary {
            run_id: run_id.to_string(),
            rows: overview.total_orders,
            total_revenue: overview.total_revenue,
            snapshot,
            metrics,
        })
    }
}
