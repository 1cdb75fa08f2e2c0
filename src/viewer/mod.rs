//! Viewer Session
//!
//! State behind the history view: the url being looked at, its latest
//! metrics, the fused history and the total shown to the user.
//!
//! ```text
//!   Loading ──start(Some(url))──▶ Ready ──METRICS_UPDATED / QUEUE_SYNCED──▶ refresh
//!      │
//!      └────start(None)─────────▶ NoPage
//! ```
//!
//! Messages that arrive while the session is still loading are held and
//! applied in arrival order once it is ready. Tearing the session down
//! asks the coordinator for one last sync without waiting for the answer.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::domain::{Context, Message, PageMetrics};
use crate::error::Result;
use crate::history::{ConfirmedHistory, FusedHistoryView, HistoryMerger};
use crate::queue::LastMetricsStore;
use crate::router::{Delivery, Inbox, MessageRouter, Subscription};

/// Lifecycle of a viewer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    /// Subscribed, initial data not loaded yet
    Loading,
    /// No observable page is open
    NoPage,
    /// Showing history for the current url
    Ready,
}

/// What the presentation layer renders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewerSnapshot {
    pub url: Option<String>,
    pub metrics: Option<PageMetrics>,
    pub history: Option<FusedHistoryView>,
    /// Last remote error, shown next to the history
    pub error: Option<String>,
}

pub struct ViewerSession {
    router: Arc<MessageRouter>,
    merger: HistoryMerger,
    last_metrics: LastMetricsStore,
    subscription: Option<Subscription>,
    state: ViewerState,
    buffered: Vec<Message>,
    confirmed: Option<ConfirmedHistory>,
    snapshot: ViewerSnapshot,
    published: watch::Sender<ViewerSnapshot>,
}

impl ViewerSession {
    /// Subscribe as the viewer. Messages are accepted from this point on.
    pub fn open(
        router: Arc<MessageRouter>,
        merger: HistoryMerger,
        last_metrics: LastMetricsStore,
    ) -> (Self, Inbox) {
        let (subscription, inbox) = router.subscribe(Context::Viewer);
        let (published, _) = watch::channel(ViewerSnapshot::default());

        let session = Self {
            router,
            merger,
            last_metrics,
            subscription: Some(subscription),
            state: ViewerState::Loading,
            buffered: Vec::new(),
            confirmed: None,
            snapshot: ViewerSnapshot::default(),
            published,
        };
        (session, inbox)
    }

    pub fn state(&self) -> ViewerState {
        self.state
    }

    pub fn snapshot(&self) -> &ViewerSnapshot {
        &self.snapshot
    }

    /// Receives every snapshot the session publishes.
    pub fn watch(&self) -> watch::Receiver<ViewerSnapshot> {
        self.published.subscribe()
    }

    /// Load initial data for `url` and become ready. `None` means no
    /// observable page is open.
    #[instrument(skip(self))]
    pub async fn start(&mut self, url: Option<String>) -> Result<()> {
        let Some(url) = url else {
            self.state = ViewerState::NoPage;
            self.buffered.clear();
            self.publish();
            return Ok(());
        };

        self.snapshot.metrics = self.last_metrics.load_for(&url).await?;
        self.snapshot.url = Some(url.clone());
        self.confirmed = Some(ConfirmedHistory::new(url));
        self.refresh().await?;
        self.become_ready().await
    }

    async fn become_ready(&mut self) -> Result<()> {
        self.state = ViewerState::Ready;

        let buffered = std::mem::take(&mut self.buffered);
        if !buffered.is_empty() {
            debug!("Applying {} messages received while loading", buffered.len());
        }
        for message in buffered {
            self.apply(message).await?;
        }
        Ok(())
    }

    /// Switch to another url. Metrics and history of the previous one are dropped.
    pub async fn set_current_url(&mut self, url: impl Into<String>) -> Result<()> {
        let url = url.into();
        if self.snapshot.url.as_deref() == Some(url.as_str()) {
            return Ok(());
        }

        self.snapshot = ViewerSnapshot {
            url: Some(url.clone()),
            ..Default::default()
        };
        self.confirmed = Some(ConfirmedHistory::new(url));
        self.refresh().await?;
        self.become_ready().await
    }

    /// Accept a router message; held until the session is ready.
    pub async fn handle_message(&mut self, message: Message) -> Result<()> {
        match self.state {
            ViewerState::Loading => {
                self.buffered.push(message);
                Ok(())
            }
            ViewerState::NoPage => Ok(()),
            ViewerState::Ready => self.apply(message).await,
        }
    }

    async fn apply(&mut self, message: Message) -> Result<()> {
        match message {
            Message::MetricsUpdated(metrics) => {
                if self.snapshot.url.as_deref() != Some(metrics.url.as_str()) {
                    debug!("Ignoring metrics for {}", metrics.url);
                    return Ok(());
                }
                self.snapshot.metrics = Some(metrics);
                self.refresh().await
            }
            Message::QueueSynced => self.refresh().await,
            other => {
                debug!("Viewer ignoring {}", other.kind());
                Ok(())
            }
        }
    }

    /// Reload the loaded history pages and the total.
    pub async fn refresh(&mut self) -> Result<()> {
        let Some(confirmed) = self.confirmed.as_mut() else {
            return Ok(());
        };

        let refresh = self.merger.refresh(confirmed).await?;
        self.snapshot.error = refresh.remote_error.map(|e| e.to_string());
        self.snapshot.history = Some(refresh.view);
        self.publish();
        Ok(())
    }

    /// Load the next confirmed page, if any.
    pub async fn load_more(&mut self) -> Result<bool> {
        let Some(confirmed) = self.confirmed.as_mut() else {
            return Ok(false);
        };

        let loaded = match self.merger.load_more(confirmed).await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("Failed to load more history: {}", e);
                self.snapshot.error = Some(e.to_string());
                self.publish();
                return Ok(false);
            }
        };

        if loaded {
            self.snapshot.history = Some(self.merger.view(confirmed).await?);
            self.snapshot.error = None;
            self.publish();
        }
        Ok(loaded)
    }

    /// Leave the router and ask the coordinator for a final sync.
    pub fn teardown(mut self) -> Delivery {
        if let Some(subscription) = self.subscription.take() {
            self.router.unsubscribe(subscription);
        }
        info!("Viewer closing, requesting queue sync");
        self.router
            .send(Context::Viewer, Context::Coordinator, Message::SyncQueue)
    }

    /// Apply inbox messages until `shutdown` fires, then tear down.
    pub async fn run(mut self, mut inbox: Inbox, shutdown: CancellationToken) -> Delivery {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => {
                        if let Err(e) = self.handle_message(envelope.message).await {
                            warn!("Viewer failed to apply message: {}", e);
                        }
                    }
                    None => break,
                },
            }
        }
        self.teardown()
    }

    fn publish(&self) {
        self.published.send_replace(self.snapshot.clone());
    }
}

impl std::fmt::Debug for ViewerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerSession")
            .field("state", &self.state)
            .field("url", &self.snapshot.url)
            .finish()
    }
}
