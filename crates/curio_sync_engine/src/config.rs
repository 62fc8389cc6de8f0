//! Configuration for the sync engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for sync operations.
///
/// Deserializes from partial JSON; missing fields keep their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Server URL, without a trailing slash.
    pub base_url: String,
    /// Quiet period a burst of changes must settle for before a cycle runs.
    pub debounce: Duration,
    /// Upper bound on how long a continuous burst can delay a cycle.
    pub max_wait: Duration,
    /// Number of log rows read per page while draining.
    pub page_size: usize,
    /// Run a cycle periodically even without new changes.
    pub poll_interval: Option<Duration>,
    /// Age after which a locally cached row is refreshed from the server.
    pub cache_ttl: Duration,
    /// How long a tab waits for another tab to answer a fetch.
    pub cross_tab_timeout: Duration,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            debounce: Duration::from_secs(2),
            max_wait: Duration::from_secs(10),
            page_size: 100,
            poll_interval: None,
            cache_ttl: Duration::from_secs(5 * 60),
            cross_tab_timeout: Duration::from_secs(30),
        }
    }

    /// Sets the debounce quiet period.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Sets the maximum debounce delay.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Sets the drain page size. Zero is treated as one.
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Sets the periodic sync interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Sets the cache freshness window.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Sets the cross-tab request timeout.
    pub fn with_cross_tab_timeout(mut self, timeout: Duration) -> Self {
        self.cross_tab_timeout = timeout;
        self
    }

    /// Endpoint the change log is posted to.
    pub fn sync_url(&self) -> String {
        format!("{}/api/sync/", self.base_url)
    }

    /// Endpoint of a resource collection.
    pub fn resource_url(&self, table: &str) -> String {
        format!("{}/api/{}/", self.base_url, table)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SyncConfig::new("https://studio.example.org/");
        assert_eq!(config.base_url, "https://studio.example.org");
        assert_eq!(config.debounce, Duration::from_secs(2));
        assert_eq!(config.page_size, 100);
        assert!(config.poll_interval.is_none());
        assert_eq!(config.sync_url(), "https://studio.example.org/api/sync/");
        assert_eq!(
            config.resource_url("contentnode"),
            "https://studio.example.org/api/contentnode/"
        );
    }

    #[test]
    fn builder_methods() {
        let config = SyncConfig::default()
            .with_debounce(Duration::from_millis(50))
            .with_max_wait(Duration::from_millis(200))
            .with_page_size(0)
            .with_poll_interval(Duration::from_secs(60));
        assert_eq!(config.debounce, Duration::from_millis(50));
        assert_eq!(config.max_wait, Duration::from_millis(200));
        assert_eq!(config.page_size, 1);
        assert_eq!(config.poll_interval, Some(Duration::from_secs(60)));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: SyncConfig =
            serde_json::from_value(serde_json::json!({"page_size": 25})).unwrap();
        assert_eq!(config.page_size, 25);
        assert_eq!(config.max_wait, Duration::from_secs(10));
    }
}
