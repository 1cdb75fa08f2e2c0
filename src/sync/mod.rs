//! Sync Coordinator
//!
//! Drains the [`DurableQueue`] to the remote [`VisitService`] as one batch,
//! either on a timer or when asked.
//!
//! # Drain Algorithm
//!
//! ```text
//!   snapshot = queue.get_all()          ── empty? ─▶ Empty (no request)
//!        │
//!        ▼
//!   submit_batch(snapshot − stamps)     ── error? ─▶ queue untouched
//!        │
//!        ▼
//!   queue.clear(Some(snapshot.len()))   ─▶ Synced { count }
//! ```
//!
//! Only the submitted prefix is removed, so records appended while the
//! request was in flight stay queued for the next run. Failed runs are not
//! retried here; the next tick or manual trigger picks the records up again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{VisitCreate, VisitService};
use crate::error::Result;
use crate::queue::DurableQueue;
use crate::telemetry::Telemetry;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the sync timer
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Time between automatic flushes
    pub interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(10_000),
        }
    }
}

/// Result of a successful flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing was queued; no request was made
    Empty,
    /// `count` records were accepted and removed from the queue
    Synced { count: usize },
}

// =============================================================================
// Sync Coordinator
// =============================================================================

/// Moves queued visits to the remote service.
pub struct SyncCoordinator {
    config: SyncConfig,
    queue: Arc<DurableQueue>,
    service: Arc<dyn VisitService>,
    telemetry: Arc<Telemetry>,
    /// A tick and a manual trigger never drain at the same time.
    flush_lock: Mutex<()>,
}

impl SyncCoordinator {
    pub fn new(
        config: SyncConfig,
        queue: Arc<DurableQueue>,
        service: Arc<dyn VisitService>,
        telemetry: Arc<Telemetry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            queue,
            service,
            telemetry,
            flush_lock: Mutex::new(()),
        })
    }

    /// Submit everything queued right now as one batch.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<SyncOutcome> {
        let _guard = self.flush_lock.lock().await;

        let snapshot = self.queue.get_all().await?;
        if snapshot.is_empty() {
            debug!("Queue empty, nothing to sync");
            self.telemetry.set_queue_depth(0);
            return Ok(SyncOutcome::Empty);
        }

        let batch: Vec<VisitCreate> = snapshot.iter().map(|r| r.to_visit_create()).collect();
        let count = batch.len();
        debug!("Submitting {} queued visits", count);

        if let Err(e) = self.service.submit_batch(&batch).await {
            if e.is_transient() {
                warn!("Sync of {} visits failed, keeping them queued: {}", count, e);
            } else {
                error!("Remote rejected {} visits, keeping them queued: {}", count, e);
            }
            self.telemetry.record_sync("failed", 0);
            self.telemetry.set_queue_depth(count);
            return Err(e);
        }

        self.queue.clear(Some(count)).await?;
        let remaining = self.queue.count().await?;

        info!("Synced {} visits, {} still queued", count, remaining);
        self.telemetry.record_sync("synced", count);
        self.telemetry.set_queue_depth(remaining);

        Ok(SyncOutcome::Synced { count })
    }

    /// Flush every interval until `shutdown` fires. The first tick comes one
    /// full interval after start.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.interval;
        info!("Starting queue sync every {:?}", period);

        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Queue sync shutting down");
                    break;
                }
                _ = tick.tick() => {
                    // failures are logged inside flush and retried next tick
                    let _ = self.flush().await;
                }
            }
        }
    }
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("interval", &self.config.interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryStateStore, InMemoryVisitService};
    use crate::domain::PageMetrics;
    use crate::error::Error;
    use assert_matches::assert_matches;

    struct Harness {
        queue: Arc<DurableQueue>,
        service: Arc<InMemoryVisitService>,
        telemetry: Arc<Telemetry>,
        sync: Arc<SyncCoordinator>,
    }

    fn harness() -> Harness {
        let queue = DurableQueue::new(Arc::new(InMemoryStateStore::new()));
        let service = Arc::new(InMemoryVisitService::new());
        let telemetry = Telemetry::new().unwrap();
        let sync = SyncCoordinator::new(
            SyncConfig::default(),
            queue.clone(),
            service.clone(),
            telemetry.clone(),
        );
        Harness {
            queue,
            service,
            telemetry,
            sync,
        }
    }

    fn visit(url: &str) -> VisitCreate {
        PageMetrics::new(url, 10, 500, 5).into()
    }

    #[tokio::test]
    async fn test_empty_queue_makes_no_request() {
        let h = harness();

        assert_eq!(h.sync.flush().await.unwrap(), SyncOutcome::Empty);
        assert_eq!(h.service.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_success_drains_queue_as_one_batch() {
        let h = harness();
        h.queue.add(visit("https://a.test")).await.unwrap();
        h.queue.add(visit("https://b.test")).await.unwrap();

        assert_eq!(h.sync.flush().await.unwrap(), SyncOutcome::Synced { count: 2 });
        assert_eq!(h.queue.count().await.unwrap(), 0);

        let batches = h.service.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].url, "https://a.test");
        assert_eq!(batches[0][1].url, "https://b.test");
        assert_eq!(h.telemetry.sync_runs("synced"), 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_queue() {
        let h = harness();
        h.queue.add(visit("https://a.test")).await.unwrap();
        h.queue.add(visit("https://b.test")).await.unwrap();
        h.service.set_offline(true);

        let err = h.sync.flush().await.unwrap_err();
        assert_matches!(err, Error::RemoteRejected { status: 503, .. });
        assert_eq!(h.queue.count().await.unwrap(), 2);
        assert_eq!(h.telemetry.sync_runs("failed"), 1);
        assert_eq!(h.telemetry.queue_depth(), 2);

        // the same records go out once the service is back
        h.service.set_offline(false);
        assert_eq!(h.sync.flush().await.unwrap(), SyncOutcome::Synced { count: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_added_during_flush_survive() {
        let h = harness();
        h.queue.add(visit("https://a.test")).await.unwrap();
        h.service.set_latency(Duration::from_millis(200));

        let sync = h.sync.clone();
        let flush = tokio::spawn(async move { sync.flush().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.queue.add(visit("https://late.test")).await.unwrap();

        assert_eq!(flush.await.unwrap().unwrap(), SyncOutcome::Synced { count: 1 });

        let remaining = h.queue.get_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].url(), "https://late.test");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_after_one_interval() {
        let h = harness();
        h.queue.add(visit("https://a.test")).await.unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(h.sync.clone().run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(9_000)).await;
        assert_eq!(h.service.submit_calls(), 0);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(h.service.submit_calls(), 1);
        assert_eq!(h.queue.count().await.unwrap(), 0);

        shutdown.cancel();
        task.await.unwrap();
    }
}
