//! Observer Service
//!
//! Runs next to one tab's document. Answers `GET_METRICS` from the
//! coordinator and can push `PAGE_METRICS` on its own when the page changes.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::domain::{Context, Message, MetricsSource, PageMetrics, Reply, TabId};
use crate::error::Result;
use crate::router::{Delivery, Envelope, Inbox, MessageRouter};

/// Configuration for an observer
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// Readiness checks before extracting anyway
    pub ready_attempts: u32,

    /// Pause between readiness checks
    pub ready_interval: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            ready_attempts: 5,
            ready_interval: Duration::from_millis(200),
        }
    }
}

/// Metrics extractor bound to one tab.
pub struct Observer {
    tab: TabId,
    config: ObserverConfig,
    source: Arc<dyn MetricsSource>,
    router: Arc<MessageRouter>,
}

impl Observer {
    pub fn new(
        tab: TabId,
        config: ObserverConfig,
        source: Arc<dyn MetricsSource>,
        router: Arc<MessageRouter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tab,
            config,
            source,
            router,
        })
    }

    pub fn context(&self) -> Context {
        Context::Observer(self.tab)
    }

    /// Poll the document until it is ready. Returns false if it never was.
    pub async fn wait_until_ready(&self) -> bool {
        for attempt in 1..=self.config.ready_attempts {
            if self.source.is_ready().await {
                return true;
            }
            if attempt < self.config.ready_attempts {
                tokio::time::sleep(self.config.ready_interval).await;
            }
        }
        false
    }

    /// Extract metrics once the document is ready (or the wait ran out).
    pub async fn collect(&self) -> Result<PageMetrics> {
        if !self.wait_until_ready().await {
            debug!("{} document not ready, extracting anyway", self.tab);
        }
        self.source.collect().await
    }

    /// Push the current metrics to the coordinator.
    #[instrument(skip(self), fields(tab = %self.tab))]
    pub async fn emit_page_metrics(&self) -> Result<Delivery> {
        let metrics = self.collect().await?;
        Ok(self.router.send(
            self.context(),
            Context::Coordinator,
            Message::PageMetrics(metrics),
        ))
    }

    async fn handle(&self, mut envelope: Envelope) {
        let responder = envelope.take_responder();

        match envelope.message {
            Message::GetMetrics => {
                let Some(responder) = responder else {
                    return;
                };
                match self.collect().await {
                    Ok(metrics) => {
                        responder.respond(Reply::Metrics(metrics));
                    }
                    // dropping the responder tells the requester to retry
                    Err(e) => warn!("{} could not extract metrics: {}", self.tab, e),
                }
            }
            other => debug!("{} ignoring {}", self.tab, other.kind()),
        }
    }

    /// Answer requests until `shutdown` fires.
    pub async fn serve(self: Arc<Self>, mut inbox: Inbox, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => self.handle(envelope).await,
                    None => break,
                },
            }
        }
    }

    /// Subscribe as this tab's observer and serve in the background. The
    /// subscription is released when the task ends.
    pub fn attach(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let (subscription, inbox) = self.router.subscribe(self.context());
        info!("Observer attached to {}", self.tab);

        let observer = self.clone();
        tokio::spawn(async move {
            observer.clone().serve(inbox, shutdown).await;
            observer.router.unsubscribe(subscription);
            debug!("Observer detached from {}", observer.tab);
        })
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer").field("tab", &self.tab).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SnapshotSource;
    use crate::router::{RetryOutcome, RetryPolicy, RouterConfig};
    use crate::telemetry::Telemetry;
    use tokio::time::Instant;

    fn router() -> Arc<MessageRouter> {
        MessageRouter::new(RouterConfig::default(), Telemetry::new().unwrap())
    }

    fn metrics() -> PageMetrics {
        PageMetrics::new("https://x.test", 10, 500, 5).with_title("X")
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_gives_up_after_five_checks() {
        let observer = Observer::new(
            TabId(1),
            ObserverConfig::default(),
            Arc::new(SnapshotSource::new()),
            router(),
        );
        let start = Instant::now();

        assert!(!observer.wait_until_ready().await);
        assert_eq!(start.elapsed(), Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_answers_get_metrics() {
        let router = router();
        let observer = Observer::new(
            TabId(2),
            ObserverConfig::default(),
            Arc::new(SnapshotSource::loaded(metrics())),
            router.clone(),
        );
        let shutdown = CancellationToken::new();
        let task = observer.attach(shutdown.clone());

        let reply = router
            .request(Context::Coordinator, Context::Observer(TabId(2)), Message::GetMetrics)
            .await
            .unwrap();
        assert_eq!(reply, Reply::Metrics(metrics()));

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(router.listener_count(Context::Observer(TabId(2))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_document_loading_late_is_picked_up_by_retry() {
        let router = router();
        let source = Arc::new(SnapshotSource::new());
        let observer = Observer::new(
            TabId(3),
            ObserverConfig {
                ready_attempts: 1,
                ..Default::default()
            },
            source.clone(),
            router.clone(),
        );
        let _task = observer.attach(CancellationToken::new());

        let loader = {
            let source = source.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                source.load(metrics());
            })
        };

        let outcome = router
            .request_with_retry(
                Context::Coordinator,
                Context::Observer(TabId(3)),
                Message::GetMetrics,
                &RetryPolicy::linear(Duration::from_millis(300)),
            )
            .await;
        loader.await.unwrap();

        assert_eq!(
            outcome,
            RetryOutcome::Ready {
                value: Reply::Metrics(metrics()),
                attempt: 2
            }
        );
    }

    #[tokio::test]
    async fn test_emit_page_metrics() {
        let router = router();
        let (_sub, mut coordinator) = router.subscribe(Context::Coordinator);
        let observer = Observer::new(
            TabId(1),
            ObserverConfig::default(),
            Arc::new(SnapshotSource::loaded(metrics())),
            router,
        );

        assert_eq!(observer.emit_page_metrics().await.unwrap(), Delivery::Delivered(1));

        let envelope = coordinator.recv().await.unwrap();
        assert_eq!(envelope.from, Context::Observer(TabId(1)));
        assert_eq!(envelope.message, Message::PageMetrics(metrics()));
    }
}
