//! Durable Visit Queue
//!
//! Append-only list of [`PendingRecord`]s kept in the local state store so it
//! survives restarts of the coordinator.
//!
//! # Ordering
//!
//! Insertion order, persisted order and drain order are the same. Entries
//! have no identity beyond their position: [`DurableQueue::clear`] with a
//! count removes that many entries from the front, whatever they are. New
//! records always go to the tail, so a drain that clears exactly the prefix
//! it submitted never loses records appended while it was in flight.

mod last_metrics;

pub use last_metrics::{LastMetricsStore, LAST_METRICS_KEY};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::domain::{Clock, PendingRecord, StateStore, SystemClock, VisitCreate};
use crate::error::Result;

/// State key the queue blob is persisted under.
pub const QUEUE_KEY: &str = "visitQueue";

/// Restart-tolerant FIFO of visits waiting for remote confirmation.
pub struct DurableQueue {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    /// Serializes read-modify-write cycles; holds the last stamp handed out.
    write_lock: Mutex<Option<DateTime<Utc>>>,
}

impl DurableQueue {
    pub fn new(store: Arc<dyn StateStore>) -> Arc<Self> {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            store,
            clock,
            write_lock: Mutex::new(None),
        })
    }

    /// Stamp `visit` with the current time and append it to the tail.
    #[instrument(skip(self, visit), fields(url = %visit.url))]
    pub async fn add(&self, visit: VisitCreate) -> Result<PendingRecord> {
        let mut last_stamp = self.write_lock.lock().await;

        // Never hand out a stamp earlier than the previous one.
        let now = self.clock.now();
        let enqueued_at = match *last_stamp {
            Some(last) if last > now => last,
            _ => now,
        };

        let record = PendingRecord { visit, enqueued_at };
        let mut queue = self.load().await?;
        queue.push(record.clone());
        self.persist(&queue).await?;
        *last_stamp = Some(enqueued_at);

        debug!("Queued visit, {} pending", queue.len());
        Ok(record)
    }

    /// Every pending record in insertion order. Absent state reads as empty.
    pub async fn get_all(&self) -> Result<Vec<PendingRecord>> {
        self.load().await
    }

    /// Pending records for exactly `url`, in insertion order.
    pub async fn get_by_url(&self, url: &str) -> Result<Vec<PendingRecord>> {
        let queue = self.load().await?;
        Ok(queue.into_iter().filter(|r| r.url() == url).collect())
    }

    /// Remove the first `count` records, or everything when `count` is `None`.
    ///
    /// Removal is by position. A count larger than the queue empties it.
    #[instrument(skip(self))]
    pub async fn clear(&self, count: Option<usize>) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        match count {
            None => {
                self.store.remove(QUEUE_KEY).await?;
                debug!("Cleared entire queue");
            }
            Some(count) => {
                let mut queue = self.load().await?;
                let cut = count.min(queue.len());
                queue.drain(..cut);
                self.persist(&queue).await?;
                debug!("Cleared {} queued visits, {} remain", cut, queue.len());
            }
        }
        Ok(())
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.load().await?.len())
    }

    async fn load(&self) -> Result<Vec<PendingRecord>> {
        let Some(blob) = self.store.get(QUEUE_KEY).await? else {
            return Ok(Vec::new());
        };

        match serde_json::from_value(blob) {
            Ok(queue) => Ok(queue),
            Err(e) => {
                warn!("Discarding undecodable visit queue: {}", e);
                Ok(Vec::new())
            }
        }
    }

    async fn persist(&self, queue: &[PendingRecord]) -> Result<()> {
        let blob = serde_json::to_value(queue)?;
        self.store.set(QUEUE_KEY, blob).await
    }
}

impl std::fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueue").field("key", &QUEUE_KEY).finish()
    }
}
