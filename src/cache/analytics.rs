//! Typed view of the cache shared by the pipeline and every reader.

use super::ttl::{Clock, SystemClock, TtlCache};
use crate::aggregate::{AnalyticsResults, LastProductIndex};
use crate::model::{JourneyEdge, KeyTotal, Overview, RunStatus};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Keys of the analytics cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Status,
    Overview,
    RevenueByCategory,
    MonthlyRevenue,
    JourneyEdges,
    SnapshotPath,
    LastProductByEmail,
    LastRefresh,
}

/// Values stored in the analytics cache. Large payloads are shared, so reads are cheap clones.
#[derive(Debug, Clone)]
pub enum CachedValue {
    Status(RunStatus),
    Overview(Overview),
    Totals(Arc<Vec<KeyTotal>>),
    Edges(Arc<Vec<JourneyEdge>>),
    Path(PathBuf),
    LastProducts(Arc<LastProductIndex>),
    Timestamp(DateTime<Utc>),
}

/// Cache handle injected into the orchestrator and the read side.
#[derive(Clone)]
pub struct AnalyticsCache {
    inner: Arc<TtlCache<CacheKey, CachedValue, Arc<dyn Clock>>>,
}

impl Default for AnalyticsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalyticsCache {
    /// Create an empty cache on the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty cache driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(TtlCache::with_clock(clock)),
        }
    }

    /// Current run status; not ready when nothing has been published.
    pub fn status(&self) -> RunStatus {
        match self.inner.get(&CacheKey::Status) {
            Some(CachedValue::Status(status)) => status,
            _ => RunStatus::default(),
        }
    }

    /// Status is never expired.
    pub fn set_status(&self, status: RunStatus) {
        self.inner.set(CacheKey::Status, CachedValue::Status(status), None);
    }

    pub fn overview(&self) -> Option<Overview> {
        match self.inner.get(&CacheKey::Overview)? {
            CachedValue::Overview(overview) => Some(overview),
            _ => None,
        }
    }

    pub fn revenue_by_category(&self) -> Option<Arc<Vec<KeyTotal>>> {
        self.totals(CacheKey::RevenueByCategory)
    }

    pub fn monthly_revenue(&self) -> Option<Arc<Vec<KeyTotal>>> {
        self.totals(CacheKey::MonthlyRevenue)
    }

    fn totals(&self, key: CacheKey) -> Option<Arc<Vec<KeyTotal>>> {
        match self.inner.get(&key)? {
            CachedValue::Totals(totals) => Some(totals),
            _ => None,
        }
    }

    pub fn journey_edges(&self) -> Option<Arc<Vec<JourneyEdge>>> {
        match self.inner.get(&CacheKey::JourneyEdges)? {
            CachedValue::Edges(edges) => Some(edges),
            _ => None,
        }
    }

    /// Path of the last published snapshot.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        match self.inner.get(&CacheKey::SnapshotPath)? {
            CachedValue::Path(path) => Some(path),
            _ => None,
        }
    }

    pub fn set_snapshot_path(&self, path: PathBuf) {
        self.inner.set(CacheKey::SnapshotPath, CachedValue::Path(path), None);
    }

    /// Last product per customer carried over from the previous run.
    pub fn last_products(&self) -> Option<Arc<LastProductIndex>> {
        match self.inner.get(&CacheKey::LastProductByEmail)? {
            CachedValue::LastProducts(index) => Some(index),
            _ => None,
        }
    }

    pub fn clear_last_products(&self) {
        self.inner.delete(&CacheKey::LastProductByEmail);
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        match self.inner.get(&CacheKey::LastRefresh)? {
            CachedValue::Timestamp(at) => Some(at),
            _ => None,
        }
    }

    pub fn set_last_refresh(&self, at: DateTime<Utc>) {
        self.inner.set(CacheKey::LastRefresh, CachedValue::Timestamp(at), None);
    }

    /// Publish a completed run's aggregates. Status is left to the caller.
    pub fn publish_results(
        &self,
        results: AnalyticsResults,
        ttl: Option<Duration>,
        last_product_ttl: Option<Duration>,
    ) {
        let AnalyticsResults {
            overview,
            by_category,
            monthly,
            edges,
            last_products,
        } = results;

        self.inner.set(CacheKey::Overview, CachedValue::Overview(overview), ttl);
        self.inner.set(
            CacheKey::RevenueByCategory,
            CachedValue::Totals(Arc::new(by_category)),
            ttl,
        );
        self.inner.set(
            CacheKey::MonthlyRevenue,
            CachedValue::Totals(Arc::new(monthly)),
            ttl,
        );
        self.inner.set(CacheKey::JourneyEdges, CachedValue::Edges(Arc::new(edges)), ttl);
        self.inner.set(
            CacheKey::LastProductByEmail,
            CachedValue::LastProducts(Arc::new(last_products)),
            last_product_ttl,
        );
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;

    fn sample_results() -> AnalyticsResults {
        let mut last_products = LastProductIndex::default();
        last_products.record("a@x.com", "P2");
        AnalyticsResults {
            overview: Overview {
                total_revenue: 30.0,
                total_orders: 2,
            },
            by_category: vec![KeyTotal {
                key: "Books".into(),
                value: 30.0,
            }],
            monthly: vec![KeyTotal {
                key: "2024-01".into(),
                value: 30.0,
            }],
            edges: vec![JourneyEdge {
                source: "P1".into(),
                target: "P2".into(),
                value: 1,
            }],
            last_products,
        }
    }

    #[test]
    fn test_status_defaults_to_not_ready() {
        let cache = AnalyticsCache::new();
        assert_eq!(cache.status(), RunStatus { ready: false, progress: 0 });

        cache.set_status(RunStatus::ready());
        assert!(cache.status().ready);
    }

    #[test]
    fn test_published_aggregates_expire_but_status_persists() {
        let clock = ManualClock::new();
        let cache = AnalyticsCache::with_clock(clock.clone());

        cache.publish_results(
            sample_results(),
            Some(Duration::from_secs(300)),
            Some(Duration::from_secs(86_400)),
        );
        cache.set_status(RunStatus::ready());
        cache.set_snapshot_path(PathBuf::from("snap.parquet"));

        assert_eq!(cache.overview().unwrap().total_orders, 2);
        assert_eq!(cache.journey_edges().unwrap().len(), 1);

        clock.advance(Duration::from_secs(301));
        assert!(cache.overview().is_none());
        assert!(cache.revenue_by_category().is_none());
        assert!(cache.monthly_revenue().is_none());
        assert!(cache.journey_edges().is_none());

        // Long-lived entries survive the aggregate TTL
        assert_eq!(cache.last_products().unwrap().get("a@x.com"), Some("P2"));
        assert!(cache.status().ready);
        assert_eq!(cache.snapshot_path(), Some(PathBuf::from("snap.parquet")));

        clock.advance(Duration::from_secs(86_400));
        assert!(cache.last_products().is_none());
    }
}
