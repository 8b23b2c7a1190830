//! Customer Journey Analytics
//!
//! Streams a transaction table in fixed-size chunks, folds every chunk into
//! running aggregates and writes it to a columnar part file. At the end of a
//! run the parts are merged into one parquet snapshot and the aggregates are
//! published to a TTL cache that readers query without ever waiting on a run.
//!
//! # Architecture
//!
//! - **Source**: chunked reads from Postgres (or memory) with normalization
//! - **Aggregate**: totals, grouped revenue and the product journey graph
//! - **Snapshot**: part files, atomic merge and snapshot readers
//! - **Cache**: concurrent TTL cache holding the published results
//! - **Pipeline**: the refresh run, its scheduler and its dedicated runtime
//! - **Query / Server**: read-side operations and their HTTP adapter
//!
//! # Usage
//!
//! ```no_run
//! use journey_analytics::{AnalyticsCache, Config, Orchestrator, PostgresSource};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::default();
//!     config.apply_env_overrides()?;
//!     let config = Arc::new(config);
//!
//!     let source = Arc::new(PostgresSource::new(config.source.clone()));
//!     let orchestrator = Orchestrator::new(source, AnalyticsCache::new(), config);
//!     let summary = orchestrator.load_and_snapshot().await?;
//!     println!("{}", summary);
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod query;
pub mod server;
pub mod snapshot;
pub mod source;

pub use cache::{AnalyticsCache, TtlCache};
pub use config::Config;
pub use error::{ConfigError, PipelineError, QueryError};
pub use pipeline::{Orchestrator, RefreshScheduler, RefreshWorker, RunSummary};
pub use query::{AnalyticsService, Loadable};
pub use source::{ChunkSource, MemorySource, PostgresSource};

/// Build a multi-threaded Tokio runtime.
///
/// `worker_threads = None` uses one worker per core.
pub fn build_runtime(worker_threads: Option<usize>, thread_name: &str) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.thread_name(thread_name).enable_all();

    builder.build()
}
