//! Last-known-metrics blob
//!
//! The coordinator records the most recent metrics it received so a viewer
//! opened later can show them without waiting for the observer.

use std::sync::Arc;

use tracing::warn;

use crate::domain::{Clock, LastMetrics, PageMetrics, StateStore, SystemClock};
use crate::error::Result;

/// State key the last-known-metrics blob is persisted under.
pub const LAST_METRICS_KEY: &str = "lastMetrics";

/// Accessor for the last-known-metrics blob.
pub struct LastMetricsStore {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl LastMetricsStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn save(&self, metrics: &PageMetrics) -> Result<()> {
        let blob = LastMetrics {
            metrics: metrics.clone(),
            updated_at: self.clock.now(),
        };
        self.store
            .set(LAST_METRICS_KEY, serde_json::to_value(blob)?)
            .await
    }

    pub async fn load(&self) -> Result<Option<LastMetrics>> {
        let Some(blob) = self.store.get(LAST_METRICS_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_value(blob) {
            Ok(last) => Ok(Some(last)),
            Err(e) => {
                warn!("Ignoring undecodable last metrics: {}", e);
                Ok(None)
            }
        }
    }

    /// The stored metrics, only if they belong to `url`.
    pub async fn load_for(&self, url: &str) -> Result<Option<PageMetrics>> {
        Ok(self
            .load()
            .await?
            .map(|last| last.metrics)
            .filter(|metrics| metrics.url == url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryStateStore;

    #[tokio::test]
    async fn test_save_and_load_for_matching_url() {
        let store = LastMetricsStore::new(Arc::new(InMemoryStateStore::new()));
        assert!(store.load().await.unwrap().is_none());

        let metrics = PageMetrics::new("https://x.test", 3, 40, 2).with_title("X");
        store.save(&metrics).await.unwrap();

        assert_eq!(
            store.load_for("https://x.test").await.unwrap(),
            Some(metrics)
        );
        assert_eq!(store.load_for("https://y.test").await.unwrap(), None);
    }
}
