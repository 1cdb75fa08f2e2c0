//! History Merger
//!
//! Builds the fused history of one url: visits still waiting in the local
//! queue first, then the confirmed visits the remote service returns page by
//! page.
//!
//! ```text
//!   ┌──────────────────────────┐
//!   │ Pending  #-1  (oldest)   │  queue.get_by_url(url), queue order
//!   │ Pending  #-2             │
//!   ├──────────────────────────┤
//!   │ Confirmed #42            │  page 1, service order
//!   │ Confirmed #41            │
//!   │ ...                      │  page 2.. via load_more while has_more
//!   └──────────────────────────┘
//! ```
//!
//! A pending row that is still visible means that visit has not been synced
//! yet; no separate failure indicator is kept.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::domain::{ConfirmedVisit, PaginatedVisits, PendingRecord, VisitService};
use crate::error::{Error, Result};
use crate::queue::DurableQueue;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for history paging
#[derive(Debug, Clone)]
pub struct MergerConfig {
    /// Confirmed visits requested per page
    pub page_size: u32,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self { page_size: 10 }
    }
}

// =============================================================================
// Fused Rows
// =============================================================================

/// One row of the fused history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FusedRow {
    /// Queued locally; `position` is the index among this url's pending records
    Pending {
        position: usize,
        record: PendingRecord,
    },
    /// Stored by the remote service
    Confirmed(ConfirmedVisit),
}

impl FusedRow {
    /// Identity shown to the user. Pending rows get `-(position + 1)` so they
    /// can never collide with a service id.
    pub fn display_id(&self) -> i64 {
        match self {
            FusedRow::Pending { position, .. } => -(*position as i64 + 1),
            FusedRow::Confirmed(visit) => visit.id,
        }
    }

    /// When the visit happened, as far as this client knows.
    pub fn visited_at(&self) -> DateTime<Utc> {
        match self {
            FusedRow::Pending { record, .. } => record.enqueued_at,
            FusedRow::Confirmed(visit) => visit.datetime_visited,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            FusedRow::Pending { record, .. } => record.url(),
            FusedRow::Confirmed(visit) => &visit.url,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, FusedRow::Pending { .. })
    }

    /// Pending rows order before every confirmed row; within a group the
    /// second component is the source order.
    fn sort_key(&self, index: usize) -> (u8, usize) {
        match self {
            FusedRow::Pending { position, .. } => (0, *position),
            FusedRow::Confirmed(_) => (1, index),
        }
    }
}

/// The ordered view handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FusedHistoryView {
    pub url: String,
    pub rows: Vec<FusedRow>,
    /// Remote total plus locally pending visits
    pub total_visits: u64,
    pub pending: usize,
    /// More confirmed pages can be loaded
    pub has_more: bool,
}

impl FusedHistoryView {
    /// No pending and no confirmed visits. Distinct from "not loaded yet",
    /// which has no view at all.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn confirmed(&self) -> impl Iterator<Item = &ConfirmedVisit> {
        self.rows.iter().filter_map(|row| match row {
            FusedRow::Confirmed(visit) => Some(visit),
            FusedRow::Pending { .. } => None,
        })
    }
}

/// Fuse `pending` (queue order) with `confirmed` (service order).
pub fn fuse(
    url: &str,
    pending: Vec<PendingRecord>,
    confirmed: &[ConfirmedVisit],
    remote_total: u64,
    has_more: bool,
) -> FusedHistoryView {
    let pending_count = pending.len();

    let mut keyed: Vec<((u8, usize), FusedRow)> = pending
        .into_iter()
        .enumerate()
        .map(|(position, record)| FusedRow::Pending { position, record })
        .chain(confirmed.iter().cloned().map(FusedRow::Confirmed))
        .enumerate()
        .map(|(index, row)| (row.sort_key(index), row))
        .collect();
    keyed.sort_by_key(|(key, _)| *key);

    FusedHistoryView {
        url: url.to_string(),
        rows: keyed.into_iter().map(|(_, row)| row).collect(),
        total_visits: remote_total + pending_count as u64,
        pending: pending_count,
        has_more,
    }
}

// =============================================================================
// Confirmed History
// =============================================================================

/// Confirmed pages loaded so far for one url.
///
/// Kept by the caller between refreshes so that a failed refresh still shows
/// what was loaded before.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmedHistory {
    url: String,
    items: Vec<ConfirmedVisit>,
    last_page: u32,
    has_more: bool,
    remote_total: u64,
}

impl ConfirmedHistory {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn items(&self) -> &[ConfirmedVisit] {
        &self.items
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Pages loaded so far; zero before the first successful load.
    pub fn pages_loaded(&self) -> u32 {
        self.last_page
    }

    pub fn remote_total(&self) -> u64 {
        self.remote_total
    }

    fn replace_pages(&mut self, fresh: ConfirmedHistory) {
        self.items = fresh.items;
        self.last_page = fresh.last_page;
        self.has_more = fresh.has_more;
    }

    fn append(&mut self, page: PaginatedVisits) {
        // the head may have shifted since the previous page was fetched
        let seen: HashSet<i64> = self.items.iter().map(|v| v.id).collect();
        self.items
            .extend(page.items.into_iter().filter(|v| !seen.contains(&v.id)));
        self.last_page = page.page;
        self.has_more = page.has_more;
    }
}

/// Result of a refresh: the view is always produced, the remote error is
/// reported alongside it.
#[derive(Debug)]
pub struct Refresh {
    pub view: FusedHistoryView,
    pub remote_error: Option<Error>,
}

// =============================================================================
// History Merger
// =============================================================================

/// Composes the durable queue with remote history.
pub struct HistoryMerger {
    config: MergerConfig,
    queue: Arc<DurableQueue>,
    service: Arc<dyn VisitService>,
}

impl HistoryMerger {
    pub fn new(config: MergerConfig, queue: Arc<DurableQueue>, service: Arc<dyn VisitService>) -> Self {
        Self {
            config,
            queue,
            service,
        }
    }

    /// Reload every confirmed page loaded so far (at least the first) and the
    /// remote total, then fuse with the pending records.
    ///
    /// A remote failure keeps the pages loaded before; pending rows are shown
    /// either way. Only a local storage failure is returned as `Err`.
    #[instrument(skip(self, history), fields(url = %history.url))]
    pub async fn refresh(&self, history: &mut ConfirmedHistory) -> Result<Refresh> {
        let mut remote_error = None;

        match self.fetch_pages(&history.url, history.last_page.max(1)).await {
            Ok(fresh) => history.replace_pages(fresh),
            Err(e) => {
                warn!("Failed to load history for {}: {}", history.url, e);
                remote_error = Some(e);
            }
        }

        match self.service.get_metrics(&history.url).await {
            Ok(metrics) => history.remote_total = metrics.total_visits,
            Err(e) => {
                warn!("Failed to load visit metrics for {}: {}", history.url, e);
                remote_error.get_or_insert(e);
            }
        }

        let view = self.view(history).await?;
        Ok(Refresh { view, remote_error })
    }

    async fn fetch_pages(&self, url: &str, pages: u32) -> Result<ConfirmedHistory> {
        let mut fresh = ConfirmedHistory::new(url);
        for page in 1..=pages {
            let loaded = self
                .service
                .get_history(url, page, self.config.page_size)
                .await?;
            let more = loaded.has_more;
            fresh.append(loaded);
            if !more {
                break;
            }
        }
        Ok(fresh)
    }

    /// Fetch the next confirmed page if the last one reported more.
    /// Returns whether a page was loaded.
    #[instrument(skip(self, history), fields(url = %history.url))]
    pub async fn load_more(&self, history: &mut ConfirmedHistory) -> Result<bool> {
        if !history.has_more {
            return Ok(false);
        }

        let next = history.last_page + 1;
        let page = self
            .service
            .get_history(&history.url, next, self.config.page_size)
            .await?;
        debug!("Loaded history page {} ({} items)", next, page.items.len());

        history.append(page);
        Ok(true)
    }

    /// Fuse whatever is loaded in `history` with the current pending records.
    pub async fn view(&self, history: &ConfirmedHistory) -> Result<FusedHistoryView> {
        let pending = self.queue.get_by_url(&history.url).await?;
        Ok(fuse(
            &history.url,
            pending,
            &history.items,
            history.remote_total,
            history.has_more,
        ))
    }
}

impl std::fmt::Debug for HistoryMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryMerger")
            .field("page_size", &self.config.page_size)
            .finish()
    }
}
