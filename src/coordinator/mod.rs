//! Coordinator Service
//!
//! The long-lived context that owns the rate limiter, the durable queue and
//! the sync timer. It reacts to router messages and to tab lifecycle events.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Coordinator                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  PAGE_METRICS ──▶ lastMetrics ──▶ RateLimiter ──▶ DurableQueue  │
//! │                        │                                         │
//! │                        └──────────▶ METRICS_UPDATED ──▶ Viewer   │
//! │                                                                  │
//! │  SYNC_QUEUE ──▶ SyncCoordinator::flush ──▶ QUEUE_SYNCED + ack    │
//! │                                                                  │
//! │  tab activated / loaded ──▶ GET_METRICS (retry) ──▶ ingest       │
//! │                                                                  │
//! │  timers: sync every interval, limiter cleanup every interval     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{Context, Message, PageMetrics, Reply, TabId};
use crate::error::{Error, Result};
use crate::limiter::RateLimiter;
use crate::queue::{DurableQueue, LastMetricsStore};
use crate::router::{Envelope, Inbox, MessageRouter, RetryOutcome, RetryPolicy};
use crate::sync::{SyncCoordinator, SyncOutcome};
use crate::telemetry::Telemetry;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the coordinator service
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Url prefixes that are never observed
    pub restricted_prefixes: Vec<String>,

    /// Wait after a page finishes loading before asking for its metrics
    pub settle_delay: Duration,

    /// `GET_METRICS` retry when a tab becomes active
    pub activate_retry: RetryPolicy,

    /// `GET_METRICS` retry when a tab finishes loading
    pub load_retry: RetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            restricted_prefixes: vec![
                "chrome://".to_string(),
                "chrome-extension://".to_string(),
                "about:".to_string(),
            ],
            settle_delay: Duration::from_millis(800),
            activate_retry: RetryPolicy::linear(Duration::from_millis(300)),
            load_retry: RetryPolicy::linear(Duration::from_millis(400)),
        }
    }
}

/// What happened to one observed metrics record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    /// Admitted and appended to the queue
    Queued,
    /// Seen inside the cooldown window; forwarded but not queued
    RateLimited,
}

// =============================================================================
// Coordinator
// =============================================================================

/// Shared components the coordinator is built from.
pub struct CoordinatorParts {
    pub limiter: Arc<RateLimiter>,
    pub queue: Arc<DurableQueue>,
    pub last_metrics: LastMetricsStore,
    pub sync: Arc<SyncCoordinator>,
    pub router: Arc<MessageRouter>,
    pub telemetry: Arc<Telemetry>,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    limiter: Arc<RateLimiter>,
    queue: Arc<DurableQueue>,
    last_metrics: LastMetricsStore,
    sync: Arc<SyncCoordinator>,
    router: Arc<MessageRouter>,
    telemetry: Arc<Telemetry>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, parts: CoordinatorParts) -> Arc<Self> {
        Arc::new(Self {
            config,
            limiter: parts.limiter,
            queue: parts.queue,
            last_metrics: parts.last_metrics,
            sync: parts.sync,
            router: parts.router,
            telemetry: parts.telemetry,
        })
    }

    /// Whether `url` is one the observer must never be asked about.
    pub fn is_restricted(&self, url: &str) -> bool {
        self.config
            .restricted_prefixes
            .iter()
            .any(|prefix| url.starts_with(prefix.as_str()))
    }

    /// Handle freshly observed metrics.
    ///
    /// The record is remembered as the last known metrics, queued if the
    /// limiter admits its url, and forwarded to the viewer in every case.
    #[instrument(skip(self, metrics), fields(url = %metrics.url))]
    pub async fn ingest(&self, metrics: PageMetrics) -> Result<Ingested> {
        if let Err(e) = self.last_metrics.save(&metrics).await {
            warn!("Failed to persist last metrics: {}", e);
        }

        let queued = if self.limiter.can_add(&metrics.url) {
            let added = self.queue.add(metrics.clone().into()).await;
            if added.is_err() {
                // nothing was queued, so the url must not sit out the window
                self.limiter.release(&metrics.url);
            }
            added.map(|_| Ingested::Queued)
        } else {
            self.telemetry.record_rate_limited();
            Ok(Ingested::RateLimited)
        };

        match &queued {
            Ok(Ingested::Queued) => {
                self.telemetry.record_queued();
                if let Ok(depth) = self.queue.count().await {
                    self.telemetry.set_queue_depth(depth);
                }
            }
            Ok(Ingested::RateLimited) => debug!("Visit not queued, inside cooldown window"),
            Err(e) => error!("Failed to queue visit: {}", e),
        }

        self.router.send(
            Context::Coordinator,
            Context::Viewer,
            Message::MetricsUpdated(metrics),
        );

        queued
    }

    /// Flush on request. A successful flush is announced to the viewer.
    pub async fn manual_sync(&self) -> Result<SyncOutcome> {
        let result = self.sync.flush().await;

        if result.is_ok() {
            self.router
                .send(Context::Coordinator, Context::Viewer, Message::QueueSynced);
        }
        result
    }

    /// A tab became active: ask its observer for metrics and ingest them.
    pub async fn on_tab_activated(&self, tab: TabId, url: &str) -> Option<Ingested> {
        let policy = self.config.activate_retry;
        self.collect_from(tab, url, &policy).await
    }

    /// A tab finished loading: let the page settle, then ask for metrics.
    pub async fn on_tab_loaded(&self, tab: TabId, url: &str) -> Option<Ingested> {
        if self.is_restricted(url) {
            return None;
        }
        tokio::time::sleep(self.config.settle_delay).await;

        let policy = self.config.load_retry;
        self.collect_from(tab, url, &policy).await
    }

    async fn collect_from(&self, tab: TabId, url: &str, policy: &RetryPolicy) -> Option<Ingested> {
        if self.is_restricted(url) {
            debug!("Skipping restricted url {}", url);
            return None;
        }

        let outcome = self
            .router
            .request_with_retry(
                Context::Coordinator,
                Context::Observer(tab),
                Message::GetMetrics,
                policy,
            )
            .await;

        match outcome {
            RetryOutcome::Ready {
                value: Reply::Metrics(metrics),
                ..
            } => self.ingest(metrics).await.ok(),
            RetryOutcome::Ready { value, .. } => {
                let err = Error::UnexpectedReply {
                    request: Message::GetMetrics.kind().to_string(),
                    reply: value.kind().to_string(),
                };
                warn!("{} answered badly: {}", tab, err);
                None
            }
            RetryOutcome::Unavailable { attempts, last_error } => {
                debug!(
                    "Observer for {} unavailable after {} attempts: {}",
                    tab, attempts, last_error
                );
                None
            }
        }
    }

    async fn handle(&self, mut envelope: Envelope) {
        let responder = envelope.take_responder();
        if responder.is_none() && envelope.message.expects_reply() {
            debug!("{} sent {} without awaiting a reply", envelope.from, envelope.message.kind());
        }

        match envelope.message {
            Message::PageMetrics(metrics) => {
                // failures are logged inside ingest
                let _ = self.ingest(metrics).await;
            }
            Message::SyncQueue => {
                let success = self.manual_sync().await.is_ok();
                if let Some(responder) = responder {
                    if !responder.respond(Reply::SyncAck { success }) {
                        debug!("{} stopped waiting for sync ack", envelope.from);
                    }
                }
            }
            other => {
                debug!("Coordinator ignoring {} from {}", other.kind(), envelope.from);
            }
        }
    }

    /// Dispatch inbox messages until `shutdown` fires or the inbox closes.
    /// Messages already buffered at shutdown are still handled.
    pub async fn serve(self: Arc<Self>, mut inbox: Inbox, shutdown: CancellationToken) {
        info!("Coordinator listening");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    while let Some(envelope) = inbox.try_recv() {
                        self.handle(envelope).await;
                    }
                    info!("Coordinator shutting down");
                    break;
                }
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => self.handle(envelope).await,
                    None => break,
                },
            }
        }
    }

    /// Subscribe to the router and start the dispatch loop and both timers.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> CoordinatorTasks {
        let (subscription, inbox) = self.router.subscribe(Context::Coordinator);

        let handles = vec![
            tokio::spawn(self.clone().serve(inbox, shutdown.clone())),
            tokio::spawn(self.sync.clone().run(shutdown.clone())),
            tokio::spawn(self.limiter.clone().run_cleanup(shutdown.clone())),
        ];

        CoordinatorTasks {
            router: self.router.clone(),
            subscription: Some(subscription),
            handles,
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .finish()
    }
}

/// Background tasks of a started coordinator.
pub struct CoordinatorTasks {
    router: Arc<MessageRouter>,
    subscription: Option<crate::router::Subscription>,
    handles: Vec<JoinHandle<()>>,
}

impl CoordinatorTasks {
    /// Wait for every task to stop, then leave the router.
    pub async fn join(mut self) {
        for result in join_all(self.handles.drain(..)).await {
            if let Err(e) = result {
                error!("Coordinator task failed: {}", e);
            }
        }
        if let Some(subscription) = self.subscription.take() {
            self.router.unsubscribe(subscription);
        }
    }
}
