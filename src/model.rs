//! Shared analytics types published to the cache and returned to readers.

use serde::{Deserialize, Serialize};

/// Readiness of the analytics as seen by readers.
///
/// `ready == false` is the only synchronization signal readers get: aggregates
/// in the cache may be updated independently of this flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunStatus {
    pub ready: bool,
    /// Heuristic progress 0-100 (monotonic within a run, not a true fraction)
    pub progress: u8,
}

impl RunStatus {
    pub const fn running(progress: u8) -> Self {
        Self { ready: false, progress }
    }

    pub const fn ready() -> Self {
        Self { ready: true, progress: 100 }
    }
}

/// Scalar totals over the whole source.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Overview {
    pub total_revenue: f64,
    pub total_orders: u64,
}

/// One entry of a grouped revenue breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyTotal {
    pub key: String,
    pub value: f64,
}

/// Directed, weighted product-to-product transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyEdge {
    pub source: String,
    pub target: String,
    pub value: u64,
}

/// Revenue grouped by category and by month.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RevenueBreakdown {
    pub by_category: Vec<KeyTotal>,
    pub monthly: Vec<KeyTotal>,
}
