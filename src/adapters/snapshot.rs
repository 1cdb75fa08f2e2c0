//! Snapshot Metrics Source
//!
//! A `MetricsSource` whose document is whatever metrics were last loaded into
//! it. Stands in for the DOM extractor when pages are observed elsewhere and
//! their metrics arrive as records (stdin, tests).

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::{MetricsSource, PageMetrics};
use crate::error::{Error, Result};

/// Metrics source holding a pre-extracted snapshot.
#[derive(Debug, Default)]
pub struct SnapshotSource {
    current: RwLock<Option<PageMetrics>>,
}

impl SnapshotSource {
    /// A source with no document loaded yet.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loaded(metrics: PageMetrics) -> Self {
        Self {
            current: RwLock::new(Some(metrics)),
        }
    }

    /// Replace the current document.
    pub fn load(&self, metrics: PageMetrics) {
        *self.current.write() = Some(metrics);
    }

    /// Forget the current document (navigation started).
    pub fn unload(&self) {
        *self.current.write() = None;
    }
}

#[async_trait]
impl MetricsSource for SnapshotSource {
    async fn is_ready(&self) -> bool {
        self.current.read().is_some()
    }

    async fn collect(&self) -> Result<PageMetrics> {
        self.current
            .read()
            .clone()
            .ok_or_else(|| Error::Internal("No document loaded".to_string()))
    }
}
