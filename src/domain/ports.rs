//! Domain Ports (Port/Adapter Pattern)
//!
//! This module defines the value objects shared by every context and the
//! abstractions (ports) that the core depends on. Infrastructure adapters in
//! [`crate::adapters`] implement these traits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  VisitService │ StateStore │ MetricsSource │ Clock  │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  HttpVisitService │ FileStateStore │ SnapshotSource │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Flat metrics record extracted from a loaded page by the observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetrics {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub link_count: u64,
    pub word_count: u64,
    pub image_count: u64,
}

impl PageMetrics {
    /// Metrics for a page with no title or description.
    pub fn new(url: impl Into<String>, link_count: u64, word_count: u64, image_count: u64) -> Self {
        Self {
            url: url.into(),
            title: None,
            description: None,
            link_count,
            word_count,
            image_count,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// A record as accepted by the remote batch-ingest endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitCreate {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub link_count: u64,
    pub word_count: u64,
    pub image_count: u64,
}

impl From<PageMetrics> for VisitCreate {
    fn from(metrics: PageMetrics) -> Self {
        Self {
            url: metrics.url,
            title: metrics.title,
            description: metrics.description,
            link_count: metrics.link_count,
            word_count: metrics.word_count,
            image_count: metrics.image_count,
        }
    }
}

/// One observed visit that is queued locally and not yet confirmed remotely.
///
/// `enqueued_at` is stamped once by [`crate::queue::DurableQueue::add`] and
/// never changes afterwards. It is persisted as epoch milliseconds under the
/// `timestamp` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRecord {
    #[serde(flatten)]
    pub visit: VisitCreate,
    #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
    pub enqueued_at: DateTime<Utc>,
}

impl PendingRecord {
    pub fn url(&self) -> &str {
        &self.visit.url
    }

    /// The remote submission form of this record (the local stamp is dropped).
    pub fn to_visit_create(&self) -> VisitCreate {
        self.visit.clone()
    }
}

/// A visit the remote service has durably stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedVisit {
    pub id: i64,
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(with = "lenient_datetime")]
    pub datetime_visited: DateTime<Utc>,
    pub link_count: u64,
    pub word_count: u64,
    pub image_count: u64,
}

/// One page of confirmed history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginatedVisits {
    pub items: Vec<ConfirmedVisit>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub has_more: bool,
}

impl PaginatedVisits {
    /// Cursor for the page after this one, if the service reported one.
    pub fn next_page(&self) -> Option<u32> {
        self.has_more.then_some(self.page + 1)
    }
}

/// Aggregate counts for one url.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitMetrics {
    pub total_visits: u64,
}

/// Last-known-metrics blob persisted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMetrics {
    pub metrics: PageMetrics,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

/// Accepts RFC 3339 timestamps as well as naive ones (read as UTC).
mod lenient_datetime {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Clock Port
// =============================================================================

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Move the clock forward (or backward, for a negative duration).
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.write();
        *now += by;
    }

    pub fn advance_ms(&self, ms: i64) {
        self.advance(chrono::Duration::milliseconds(ms));
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

// =============================================================================
// Remote Visit Service Port
// =============================================================================

/// Port for the remote visit service.
///
/// # Example
///
/// ```ignore
/// let page = service.get_history("https://example.com", 1, 10).await?;
/// for visit in page.items {
///     println!("{} {}", visit.id, visit.datetime_visited);
/// }
/// ```
#[async_trait]
pub trait VisitService: Send + Sync {
    /// Submit a batch of visits. Success means every record was accepted.
    async fn submit_batch(&self, visits: &[VisitCreate]) -> Result<()>;

    /// Fetch one page of confirmed history for a url (pages start at 1).
    async fn get_history(&self, url: &str, page: u32, page_size: u32) -> Result<PaginatedVisits>;

    /// Fetch aggregate counts for a url.
    async fn get_metrics(&self, url: &str) -> Result<VisitMetrics>;
}

// =============================================================================
// Local State Port
// =============================================================================

/// Port for the local persisted key/value blob store.
///
/// Blobs are opaque structured values. Reading an absent key yields `None`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Replace the blob stored under `key` in one atomic write.
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;
}

// =============================================================================
// Metrics Source Port
// =============================================================================

/// Port for the page metric extractor attached to one resource.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Whether the underlying document has finished loading.
    async fn is_ready(&self) -> bool;

    /// Extract the metrics record for the current document.
    async fn collect(&self) -> Result<PageMetrics>;
}

// =============================================================================
// Tests
// =============================================================================
