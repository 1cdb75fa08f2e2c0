//! In-memory adapters
//!
//! Process-local implementations of the state store and remote visit service
//! ports. Used by tests and by dry runs of the binary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::domain::{
    ConfirmedVisit, PaginatedVisits, StateStore, VisitCreate, VisitMetrics, VisitService,
};
use crate::error::{Error, Result};

// =============================================================================
// State Store
// =============================================================================

/// State store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    blobs: DashMap<String, serde_json::Value>,
    writes: AtomicU64,
    read_only: AtomicBool,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set` calls served so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Every `set` fails while read-only.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Relaxed);
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.blobs.get(key).map(|blob| blob.value().clone()))
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        if self.read_only.load(Ordering::Relaxed) {
            return Err(Error::Storage(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("state store is read-only, cannot write {}", key),
            )));
        }
        self.blobs.insert(key.to_string(), value);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.blobs.remove(key);
        Ok(())
    }
}

// =============================================================================
// Visit Service
// =============================================================================

/// Scriptable stand-in for the remote visit service.
///
/// Accepted batches become confirmed visits with increasing ids, listed most
/// recent first like the real service does.
#[derive(Debug, Default)]
pub struct InMemoryVisitService {
    visits: RwLock<HashMap<String, Vec<ConfirmedVisit>>>,
    batches: RwLock<Vec<Vec<VisitCreate>>>,
    next_id: AtomicU64,
    failures_remaining: AtomicUsize,
    offline: RwLock<bool>,
    latency: RwLock<Duration>,
    submit_calls: AtomicUsize,
}

impl InMemoryVisitService {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ..Default::default()
        }
    }

    /// Seed confirmed history for a url. `visits` are given in service order.
    pub fn with_history(self, url: &str, visits: Vec<ConfirmedVisit>) -> Self {
        if let Some(max) = visits.iter().map(|v| v.id).max() {
            self.next_id.fetch_max(max as u64 + 1, Ordering::Relaxed);
        }
        self.visits.write().insert(url.to_string(), visits);
        self
    }

    /// Every call fails while offline.
    pub fn set_offline(&self, offline: bool) {
        *self.offline.write() = offline;
    }

    /// Fail the next `n` calls, then recover.
    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::Relaxed);
    }

    /// Delay every call by `latency` before answering.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Batches accepted so far, in submission order.
    pub fn batches(&self) -> Vec<Vec<VisitCreate>> {
        self.batches.read().clone()
    }

    /// Number of batch submissions attempted, failed ones included.
    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::Relaxed)
    }

    async fn gate(&self) -> Result<()> {
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let injected = self
            .failures_remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();

        if *self.offline.read() || injected {
            return Err(Error::RemoteRejected {
                status: 503,
                message: "Service unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VisitService for InMemoryVisitService {
    async fn submit_batch(&self, visits: &[VisitCreate]) -> Result<()> {
        self.submit_calls.fetch_add(1, Ordering::Relaxed);
        self.gate().await?;

        let mut store = self.visits.write();
        for visit in visits {
            let confirmed = ConfirmedVisit {
                id: self.next_id.fetch_add(1, Ordering::Relaxed) as i64,
                url: visit.url.clone(),
                title: visit.title.clone(),
                description: visit.description.clone(),
                datetime_visited: Utc::now(),
                link_count: visit.link_count,
                word_count: visit.word_count,
                image_count: visit.image_count,
            };
            store
                .entry(visit.url.clone())
                .or_default()
                .insert(0, confirmed);
        }
        self.batches.write().push(visits.to_vec());
        Ok(())
    }

    async fn get_history(&self, url: &str, page: u32, page_size: u32) -> Result<PaginatedVisits> {
        self.gate().await?;
        if page == 0 || page_size == 0 {
            return Err(Error::RemoteRejected {
                status: 422,
                message: "page and page_size must be positive".to_string(),
            });
        }

        let store = self.visits.read();
        let all = store.get(url).map(Vec::as_slice).unwrap_or_default();
        let start = ((page - 1) * page_size) as usize;
        let items: Vec<_> = all
            .iter()
            .skip(start)
            .take(page_size as usize)
            .cloned()
            .collect();

        Ok(PaginatedVisits {
            has_more: start + items.len() < all.len(),
            items,
            total: all.len() as u64,
            page,
            page_size,
        })
    }

    async fn get_metrics(&self, url: &str) -> Result<VisitMetrics> {
        self.gate().await?;
        let total_visits = self.visits.read().get(url).map_or(0, Vec::len) as u64;
        Ok(VisitMetrics { total_visits })
    }
}
