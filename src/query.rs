//! Read-side operations over the cache and the snapshot.
//!
//! Nothing here blocks on a refresh run. Aggregate reads go to the cache,
//! per-customer and raw-row reads go to the merged snapshot.

use crate::cache::AnalyticsCache;
use crate::config::Config;
use crate::error::{PipelineError, QueryError};
use crate::model::{JourneyEdge, Overview, RevenueBreakdown, RunStatus};
use crate::snapshot;
use crate::source::{ChunkSource, Record};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// A cached aggregate as seen by readers.
#[derive(Debug, Clone, PartialEq)]
pub enum Loadable<T> {
    /// A run is in progress or nothing has been loaded yet
    Loading { progress: u8 },
    /// Data is ready but the aggregate has expired from the cache
    Empty,
    Ready(T),
}

impl<T> Loadable<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            Loadable::Ready(value) => Some(value),
            _ => None,
        }
    }
}

/// Purchase sequence of one customer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerJourney {
    pub email: String,
    pub count: usize,
    pub sequence: Vec<String>,
}

/// Answer to a manual refresh request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshTicket {
    pub scheduled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Something that can start a refresh in the background.
pub trait RefreshTrigger: Send + Sync {
    /// Queue a run without waiting for it. Returns false when nothing was queued.
    fn trigger(&self) -> bool;
}

/// Read-side facade used by the HTTP layer and the CLI.
pub struct AnalyticsService<S> {
    cache: AnalyticsCache,
    config: Arc<Config>,
    source: Arc<S>,
    refresher: Arc<dyn RefreshTrigger>,
}

impl<S> Clone for AnalyticsService<S> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            config: self.config.clone(),
            source: self.source.clone(),
            refresher: self.refresher.clone(),
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, QueryError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PipelineError::Worker(format!("snapshot read panicked: {}", e)))?
        .map_err(QueryError::from)
}

impl<S: ChunkSource> AnalyticsService<S> {
    pub fn new(
        cache: AnalyticsCache,
        config: Arc<Config>,
        source: Arc<S>,
        refresher: Arc<dyn RefreshTrigger>,
    ) -> Self {
        Self {
            cache,
            config,
            source,
            refresher,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.cache.status()
    }

    /// Largest page [`Self::raw_rows`] accepts.
    pub fn max_rows_limit(&self) -> usize {
        self.config.server.max_rows_limit
    }

    /// Completion time of the last successful refresh.
    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.cache.last_refresh()
    }

    /// Totals, or loading while a run has not completed.
    ///
    /// Never returns a previous run's overview while `ready` is false.
    pub fn overview(&self) -> Loadable<Overview> {
        let status = self.cache.status();
        if !status.ready {
            return Loadable::Loading {
                progress: status.progress,
            };
        }
        match self.cache.overview() {
            Some(overview) => Loadable::Ready(overview),
            None => Loadable::Empty,
        }
    }

    /// Revenue by category and by month. Expired lists read as empty.
    pub fn revenue_breakdown(&self) -> Loadable<RevenueBreakdown> {
        let status = self.cache.status();
        if !status.ready {
            return Loadable::Loading {
                progress: status.progress,
            };
        }
        Loadable::Ready(RevenueBreakdown {
            by_category: self
                .cache
                .revenue_by_category()
                .map(|t| t.as_ref().clone())
                .unwrap_or_default(),
            monthly: self
                .cache
                .monthly_revenue()
                .map(|t| t.as_ref().clone())
                .unwrap_or_default(),
        })
    }

    fn published_snapshot(&self) -> Option<PathBuf> {
        self.cache.snapshot_path().filter(|p| p.exists())
    }

    /// Products bought by `email` in payment order.
    ///
    /// `Unavailable` when no snapshot has been published, `NotFound` when
    /// the customer has no rows in it.
    pub async fn customer_journey(&self, email: &str) -> Result<CustomerJourney, QueryError> {
        let path = self
            .published_snapshot()
            .ok_or_else(|| QueryError::Unavailable("Data not loaded yet. Try again later.".into()))?;

        let email = email.trim().to_lowercase();
        let lookup = email.clone();
        let records = blocking(move || snapshot::customer_sequence(&path, &lookup)).await?;

        if records.is_empty() {
            return Err(QueryError::NotFound(format!("No purchases found for {}", email)));
        }

        let sequence: Vec<String> = records.into_iter().filter_map(|r| r.product).collect();
        Ok(CustomerJourney {
            email,
            count: sequence.len(),
            sequence,
        })
    }

    /// Aggregated product transitions.
    pub fn journey_edges(&self) -> Result<Vec<JourneyEdge>, QueryError> {
        match self.cache.journey_edges() {
            Some(edges) if !edges.is_empty() => Ok(edges.as_ref().clone()),
            _ => Err(QueryError::Unavailable("Journey data not available yet.".into())),
        }
    }

    /// A page of raw rows.
    ///
    /// Served from the snapshot when one exists, otherwise straight from the
    /// source, newest payment first.
    pub async fn raw_rows(&self, offset: usize, limit: usize) -> Result<Vec<Record>, QueryError> {
        let max = self.max_rows_limit();
        if limit > max {
            return Err(QueryError::InvalidRequest(format!("limit max {}", max)));
        }

        let snapshot_path = self.published_snapshot().or_else(|| {
            let configured = &self.config.snapshot.path;
            configured.exists().then(|| configured.clone())
        });

        match snapshot_path {
            Some(path) => blocking(move || snapshot::read_rows(&path, offset, limit)).await,
            None => {
                tracing::debug!("No snapshot, reading rows {}..+{} from source", offset, limit);
                Ok(self.source.fetch_page(offset, limit).await?)
            }
        }
    }

    /// Ask for a background refresh. Never waits for the run.
    pub fn trigger_refresh(&self) -> RefreshTicket {
        if self.refresher.trigger() {
            RefreshTicket {
                scheduled: true,
                reason: None,
            }
        } else {
            RefreshTicket {
                scheduled: false,
                reason: Some("a refresh is already running".into()),
            }
        }
    }
}
