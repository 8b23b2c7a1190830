//! Process-wide state shared between the refresh pipeline and readers.

mod analytics;
mod ttl;

pub use analytics::{AnalyticsCache, CacheKey, CachedValue};
pub use ttl::{Clock, ManualClock, SystemClock, TtlCache};
