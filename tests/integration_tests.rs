//! Pagetrail Integration Tests
//!
//! End-to-end scenarios across the three contexts:
//! - Queue durability and ordering
//! - Manual and timed sync
//! - GET_METRICS retry against a late observer
//! - Fused history view

use std::sync::Arc;
use std::time::Duration;

use pagetrail::adapters::{InMemoryStateStore, InMemoryVisitService, SnapshotSource};
use pagetrail::coordinator::{Coordinator, CoordinatorConfig, CoordinatorParts, Ingested};
use pagetrail::domain::{ConfirmedVisit, Context, Message, PageMetrics, Reply, TabId, VisitCreate};
use pagetrail::history::{ConfirmedHistory, HistoryMerger, MergerConfig};
use pagetrail::limiter::{RateLimiter, RateLimiterConfig};
use pagetrail::observer::{Observer, ObserverConfig};
use pagetrail::queue::{DurableQueue, LastMetricsStore};
use pagetrail::router::{MessageRouter, RouterConfig};
use pagetrail::sync::{SyncConfig, SyncCoordinator};
use pagetrail::telemetry::Telemetry;
use pagetrail::viewer::ViewerSession;
use tokio_util::sync::CancellationToken;

const URL: &str = "https://x.test";

fn metrics(url: &str) -> PageMetrics {
    PageMetrics::new(url, 10, 500, 5)
}

/// Every component wired together over in-memory adapters.
struct System {
    store: Arc<InMemoryStateStore>,
    service: Arc<InMemoryVisitService>,
    queue: Arc<DurableQueue>,
    router: Arc<MessageRouter>,
    telemetry: Arc<Telemetry>,
    coordinator: Arc<Coordinator>,
}

impl System {
    fn new() -> Self {
        Self::with_service(InMemoryVisitService::new())
    }

    fn with_service(service: InMemoryVisitService) -> Self {
        let store = Arc::new(InMemoryStateStore::new());
        let service = Arc::new(service);
        let telemetry = Telemetry::new().unwrap();
        let queue = DurableQueue::new(store.clone());
        let router = MessageRouter::new(RouterConfig::default(), telemetry.clone());
        let sync = SyncCoordinator::new(
            SyncConfig::default(),
            queue.clone(),
            service.clone(),
            telemetry.clone(),
        );
        let coordinator = Coordinator::new(
            CoordinatorConfig::default(),
            CoordinatorParts {
                limiter: RateLimiter::new(RateLimiterConfig::default()),
                queue: queue.clone(),
                last_metrics: LastMetricsStore::new(store.clone()),
                sync,
                router: router.clone(),
                telemetry: telemetry.clone(),
            },
        );

        Self {
            store,
            service,
            queue,
            router,
            telemetry,
            coordinator,
        }
    }

    fn merger(&self) -> HistoryMerger {
        HistoryMerger::new(MergerConfig::default(), self.queue.clone(), self.service.clone())
    }

    fn observer(&self, tab: u32, source: Arc<SnapshotSource>) -> Arc<Observer> {
        Observer::new(TabId(tab), ObserverConfig::default(), source, self.router.clone())
    }
}

// =============================================================================
// Queue Scenarios
// =============================================================================

mod queue_tests {
    use super::*;
    use pagetrail::adapters::FileStateStore;

    #[tokio::test]
    async fn test_enqueue_and_filter() {
        let system = System::new();

        system.queue.add(metrics(URL).into()).await.unwrap();
        assert_eq!(system.queue.count().await.unwrap(), 1);

        system
            .queue
            .add(metrics("https://y.test").into())
            .await
            .unwrap();
        assert_eq!(system.queue.count().await.unwrap(), 2);

        let for_x = system.queue.get_by_url(URL).await.unwrap();
        assert_eq!(for_x.len(), 1);
        assert_eq!(for_x[0].visit, VisitCreate::from(metrics(URL)));
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = Arc::new(FileStateStore::open(dir.path()).await.unwrap());
            let queue = DurableQueue::new(store);
            queue.add(metrics(URL).into()).await.unwrap();
            queue.add(metrics("https://y.test").into()).await.unwrap();
        }

        let store = Arc::new(FileStateStore::open(dir.path()).await.unwrap());
        let queue = DurableQueue::new(store);
        let all = queue.get_all().await.unwrap();

        assert_eq!(all.len(), 2);
        assert_eq!(all[0].url(), URL);
        assert_eq!(all[1].url(), "https://y.test");
    }
}

// =============================================================================
// Sync Scenarios
// =============================================================================

mod sync_tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_sync_success_broadcasts_once() {
        let system = System::new();
        let (_sub, mut viewer) = system.router.subscribe(Context::Viewer);
        let _tasks = system.coordinator.start(CancellationToken::new());

        system.queue.add(metrics(URL).into()).await.unwrap();
        system
            .queue
            .add(metrics("https://y.test").into())
            .await
            .unwrap();

        let reply = tokio_test::assert_ok!(
            system
                .router
                .request(Context::Viewer, Context::Coordinator, Message::SyncQueue)
                .await
        );
        assert_eq!(reply, Reply::SyncAck { success: true });
        assert_eq!(system.queue.count().await.unwrap(), 0);
        assert_eq!(system.service.batches().len(), 1);

        assert_eq!(viewer.recv().await.unwrap().message, Message::QueueSynced);
        assert!(viewer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_manual_sync_failure_keeps_queue_and_stays_quiet() {
        let system = System::new();
        let (_sub, mut viewer) = system.router.subscribe(Context::Viewer);
        let _tasks = system.coordinator.start(CancellationToken::new());

        system.queue.add(metrics(URL).into()).await.unwrap();
        system
            .queue
            .add(metrics("https://y.test").into())
            .await
            .unwrap();
        system.service.set_offline(true);

        let reply = system
            .router
            .request(Context::Viewer, Context::Coordinator, Message::SyncQueue)
            .await
            .unwrap();

        assert_eq!(reply, Reply::SyncAck { success: false });
        assert_eq!(system.queue.count().await.unwrap(), 2);
        assert!(viewer.try_recv().is_none());
        assert_eq!(system.telemetry.sync_runs("failed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_drains_and_late_records_wait_for_next_tick() {
        let system = System::new();
        system.service.set_latency(Duration::from_millis(500));
        let shutdown = CancellationToken::new();
        let tasks = system.coordinator.start(shutdown.clone());

        system.queue.add(metrics(URL).into()).await.unwrap();

        // first tick at 10s; the submission is in flight until 10.5s
        tokio::time::sleep(Duration::from_millis(10_200)).await;
        system
            .queue
            .add(metrics("https://late.test").into())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let remaining = system.queue.get_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].url(), "https://late.test");

        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert_eq!(system.queue.count().await.unwrap(), 0);
        assert_eq!(system.service.batches().len(), 2);

        shutdown.cancel();
        tasks.join().await;
    }
}

// =============================================================================
// Protocol Scenarios
// =============================================================================

mod protocol_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_get_metrics_answered_on_third_attempt() {
        let system = System::new();
        let observer = system.observer(7, Arc::new(SnapshotSource::loaded(metrics(URL))));
        let shutdown = CancellationToken::new();

        // the observer attaches between the second and third attempt (0ms, 300ms, 900ms)
        let attach = {
            let observer = observer.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(700)).await;
                observer.attach(shutdown)
            })
        };

        let ingested = system.coordinator.on_tab_activated(TabId(7), URL).await;

        assert_eq!(ingested, Some(Ingested::Queued));
        assert_eq!(system.queue.get_by_url(URL).await.unwrap().len(), 1);

        shutdown.cancel();
        attach.await.unwrap().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tab_load_waits_for_settle_delay() {
        let system = System::new();
        let observer = system.observer(1, Arc::new(SnapshotSource::loaded(metrics(URL))));
        let _task = observer.attach(CancellationToken::new());
        let start = tokio::time::Instant::now();

        let ingested = system.coordinator.on_tab_loaded(TabId(1), URL).await;

        assert_eq!(ingested, Some(Ingested::Queued));
        assert!(start.elapsed() >= Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_duplicate_page_metrics_queued_once_forwarded_twice() {
        let system = System::new();
        let (_sub, mut viewer) = system.router.subscribe(Context::Viewer);
        let _tasks = system.coordinator.start(CancellationToken::new());
        let observer = system.observer(1, Arc::new(SnapshotSource::loaded(metrics(URL))));

        observer.emit_page_metrics().await.unwrap();
        observer.emit_page_metrics().await.unwrap();

        for _ in 0..2 {
            let envelope = viewer.recv().await.unwrap();
            assert_eq!(envelope.message, Message::MetricsUpdated(metrics(URL)));
        }
        assert_eq!(system.queue.count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restricted_urls_never_requested() {
        let system = System::new();
        let (_sub, mut observer_inbox) = system.router.subscribe(Context::Observer(TabId(1)));

        for url in ["chrome://extensions", "chrome-extension://id/page.html", "about:blank"] {
            assert!(system.coordinator.on_tab_activated(TabId(1), url).await.is_none());
            assert!(system.coordinator.on_tab_loaded(TabId(1), url).await.is_none());
        }
        assert!(observer_inbox.try_recv().is_none());
    }
}

// =============================================================================
// History Scenarios
// =============================================================================

mod history_tests {
    use super::*;
    use chrono::Utc;

    fn confirmed(id: i64) -> ConfirmedVisit {
        ConfirmedVisit {
            id,
            url: URL.to_string(),
            title: Some(format!("Visit {}", id)),
            description: None,
            datetime_visited: Utc::now(),
            link_count: 1,
            word_count: 100,
            image_count: 0,
        }
    }

    #[tokio::test]
    async fn test_fused_view_pending_first() {
        let system = System::with_service(
            InMemoryVisitService::new().with_history(URL, vec![confirmed(12), confirmed(11)]),
        );
        system.queue.add(metrics(URL).into()).await.unwrap();

        let mut history = ConfirmedHistory::new(URL);
        let refresh = system.merger().refresh(&mut history).await.unwrap();
        let view = refresh.view;

        assert_eq!(view.rows.len(), 3);
        assert!(view.rows[0].is_pending());
        assert_eq!(view.rows[0].display_id(), -1);
        assert_eq!(view.rows[1].display_id(), 12);
        assert_eq!(view.rows[2].display_id(), 11);
        assert_eq!(view.total_visits, 3);
    }

    #[tokio::test]
    async fn test_empty_history_is_empty_view() {
        let system = System::new();

        let mut history = ConfirmedHistory::new(URL);
        let refresh = system.merger().refresh(&mut history).await.unwrap();

        assert!(refresh.view.is_empty());
        assert!(refresh.remote_error.is_none());
    }

    #[tokio::test]
    async fn test_viewer_sees_pending_turn_confirmed() {
        let system = System::new();
        let (mut viewer, _inbox) = ViewerSession::open(
            system.router.clone(),
            system.merger(),
            LastMetricsStore::new(system.store.clone()),
        );

        system.coordinator.ingest(metrics(URL)).await.unwrap();
        viewer.start(Some(URL.to_string())).await.unwrap();
        let before = viewer.snapshot().history.clone().unwrap();
        assert_eq!(before.pending, 1);
        assert_eq!(viewer.snapshot().metrics, Some(metrics(URL)));

        system.coordinator.manual_sync().await.unwrap();
        viewer.handle_message(Message::QueueSynced).await.unwrap();

        let after = viewer.snapshot().history.clone().unwrap();
        assert_eq!(after.pending, 0);
        assert_eq!(after.confirmed().count(), 1);
        assert_eq!(after.total_visits, 1);
    }

    #[tokio::test]
    async fn test_viewer_teardown_triggers_final_sync() {
        let system = System::new();
        let shutdown = CancellationToken::new();
        let tasks = system.coordinator.start(shutdown.clone());
        let (viewer, _inbox) = ViewerSession::open(
            system.router.clone(),
            system.merger(),
            LastMetricsStore::new(system.store.clone()),
        );

        system.queue.add(metrics(URL).into()).await.unwrap();
        viewer.teardown();

        // buffered messages are still handled on shutdown
        shutdown.cancel();
        tasks.join().await;

        assert_eq!(system.queue.count().await.unwrap(), 0);
        assert_eq!(system.service.submit_calls(), 1);
    }
}
