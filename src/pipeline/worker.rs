//! Dedicated runtime for refresh runs.
//!
//! Refresh runs read the source, aggregate and write parquet. They execute on
//! their own tokio runtime so request handling threads are never used for
//! that work.

use super::orchestrator::Orchestrator;
use super::scheduler::{record_success, RefreshScheduler};
use crate::build_runtime;
use crate::config::RefreshConfig;
use crate::error::{PipelineError, Result};
use crate::query::RefreshTrigger;
use crate::source::ChunkSource;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

/// Handle to the refresh runtime.
///
/// The runtime lives on its own thread and shuts down when the worker is
/// dropped.
pub struct RefreshWorker<S> {
    orchestrator: Orchestrator<S>,
    handle: Handle,
    _stop: oneshot::Sender<()>,
}

impl<S: ChunkSource> RefreshWorker<S> {
    /// Start the refresh runtime with `worker_threads` threads.
    pub fn start(orchestrator: Orchestrator<S>, worker_threads: usize) -> Result<Self> {
        let runtime = build_runtime(Some(worker_threads), "refresh-worker")
            .map_err(|e| PipelineError::Worker(format!("failed to build refresh runtime: {}", e)))?;
        let handle = runtime.handle().clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        std::thread::Builder::new()
            .name("refresh-runtime".to_string())
            .spawn(move || {
                // Resolves on an explicit stop or when the worker is dropped
                runtime.block_on(async {
                    let _ = stop_rx.await;
                });
                runtime.shutdown_background();
                tracing::debug!("Refresh runtime stopped");
            })
            .map_err(|e| PipelineError::Worker(format!("failed to spawn refresh thread: {}", e)))?;

        Ok(Self {
            orchestrator,
            handle,
            _stop: stop_tx,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator<S> {
        &self.orchestrator
    }

    pub fn is_running(&self) -> bool {
        self.orchestrator.is_running()
    }

    /// Queue a run on the refresh runtime and return immediately.
    ///
    /// The run guard is taken before returning, so `true` means the run will
    /// happen. Returns false without queueing when a run is already active.
    pub fn trigger(&self) -> bool {
        let permit = match self.orchestrator.try_begin() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::info!("Refresh requested while a run is active, ignoring");
                return false;
            }
        };

        let orchestrator = self.orchestrator.clone();
        self.handle.spawn(async move {
            match orchestrator.run_with(permit).await {
                Ok(summary) => record_success(&orchestrator, &summary),
                Err(e) => tracing::error!("Manual refresh failed: {}", e),
            }
        });
        true
    }

    /// Start the periodic scheduler on the refresh runtime.
    ///
    /// Sending on, or dropping, the returned channel stops the scheduler.
    pub fn spawn_scheduler(&self, config: RefreshConfig) -> mpsc::Sender<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let scheduler = RefreshScheduler::new(self.orchestrator.clone(), config);
        self.handle.spawn(scheduler.run(shutdown_rx));
        shutdown_tx
    }
}

impl<S: ChunkSource> RefreshTrigger for RefreshWorker<S> {
    fn trigger(&self) -> bool {
        RefreshWorker::trigger(self)
    }
}
