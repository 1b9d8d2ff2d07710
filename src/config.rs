//! Tunables for the offline layer.

use std::time::Duration;

/// Interval between automatic sync cycles while online.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default timeout for admin dashboard requests (30 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight health probe.
pub const DEFAULT_CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(15);

/// Synced transactions older than this are purged.
pub const DEFAULT_RETENTION_HOURS: i64 = 24;

/// Cap on local search results.
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

/// Price differences at or below this are not conflicts.
pub const PRICE_EPSILON: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub sync_interval: Duration,
    pub request_timeout: Duration,
    pub connectivity_timeout: Duration,
    pub probe_interval: Duration,
    pub retention: chrono::Duration,
    pub search_limit: usize,
    pub price_epsilon: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connectivity_timeout: DEFAULT_CONNECTIVITY_TIMEOUT,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            retention: chrono::Duration::hours(DEFAULT_RETENTION_HOURS),
            search_limit: DEFAULT_SEARCH_LIMIT,
            price_epsilon: PRICE_EPSILON,
        }
    }
}
