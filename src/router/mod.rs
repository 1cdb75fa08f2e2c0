//! Message Router
//!
//! Delivers [`Message`]s between isolated execution contexts that share no
//! state. Each context subscribes and drains its own [`Inbox`].
//!
//! # Delivery Contract
//!
//! - At most once, best effort. Nothing is persisted; a full or closed inbox
//!   drops the message.
//! - `send` to a context with no listener is a normal outcome
//!   ([`Delivery::NoListener`]), not an error.
//! - `request` goes to one live listener and waits for its reply, bounded by
//!   the configured timeout.
//!
//! ```text
//!  Observer(tab) ──PAGE_METRICS──▶ Coordinator ──METRICS_UPDATED──▶ Viewer
//!        ▲                             │  ▲                          │
//!        └────────GET_METRICS──────────┘  └────────SYNC_QUEUE────────┘
//! ```

mod retry;

pub use retry::{retry_linear, RetryOutcome, RetryPolicy};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::domain::{Context, Message, Reply};
use crate::error::{Error, Result};
use crate::telemetry::Telemetry;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the message router
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How long a request waits for its reply
    pub request_timeout: Duration,

    /// Messages buffered per listener before new ones are dropped
    pub inbox_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(5_000),
            inbox_capacity: 256,
        }
    }
}

// =============================================================================
// Envelopes
// =============================================================================

/// Unique handle for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Capability returned by [`MessageRouter::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, PartialEq, Eq)]
pub struct Subscription {
    id: SubscriptionId,
    context: Context,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn context(&self) -> Context {
        self.context
    }
}

/// One-shot reply channel attached to a request.
#[derive(Debug)]
pub struct Responder(oneshot::Sender<Reply>);

impl Responder {
    /// Send the reply. Returns false if the requester stopped waiting.
    pub fn respond(self, reply: Reply) -> bool {
        self.0.send(reply).is_ok()
    }
}

/// A delivered message.
#[derive(Debug)]
pub struct Envelope {
    pub id: Uuid,
    pub from: Context,
    pub message: Message,
    responder: Option<Responder>,
}

impl Envelope {
    /// The reply channel, present only for requests. Taking it twice yields `None`.
    pub fn take_responder(&mut self) -> Option<Responder> {
        self.responder.take()
    }
}

/// Receiving side of a subscription.
#[derive(Debug)]
pub struct Inbox {
    context: Context,
    rx: mpsc::Receiver<Envelope>,
}

impl Inbox {
    pub fn context(&self) -> Context {
        self.context
    }

    /// Next envelope, or `None` once the subscription is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Next envelope if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

/// Outcome of a fire-and-forget send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Delivered to this many listeners
    Delivered(usize),
    /// Nobody was listening
    NoListener,
}

struct Listener {
    id: SubscriptionId,
    tx: mpsc::Sender<Envelope>,
}

// =============================================================================
// Router
// =============================================================================

/// Pub/sub and request-response between contexts.
pub struct MessageRouter {
    config: RouterConfig,
    listeners: DashMap<Context, Vec<Listener>>,
    next_id: AtomicU64,
    telemetry: Arc<Telemetry>,
}

impl MessageRouter {
    pub fn new(config: RouterConfig, telemetry: Arc<Telemetry>) -> Arc<Self> {
        Arc::new(Self {
            config,
            listeners: DashMap::new(),
            next_id: AtomicU64::new(1),
            telemetry,
        })
    }

    /// Register a listener for `context`.
    pub fn subscribe(&self, context: Context) -> (Subscription, Inbox) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.config.inbox_capacity.max(1));

        self.listeners
            .entry(context)
            .or_default()
            .push(Listener { id, tx });
        debug!("Subscribed {:?} to {}", id, context);

        (Subscription { id, context }, Inbox { context, rx })
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut removed = false;
        if let Some(mut listeners) = self.listeners.get_mut(&subscription.context) {
            let before = listeners.len();
            listeners.retain(|l| l.id != subscription.id);
            removed = listeners.len() < before;
        }
        self.listeners
            .remove_if(&subscription.context, |_, listeners| listeners.is_empty());

        debug!("Unsubscribed {:?} from {}", subscription.id, subscription.context);
        removed
    }

    /// Live listeners for `context`.
    pub fn listener_count(&self, context: Context) -> usize {
        self.listeners.get(&context).map_or(0, |listeners| {
            listeners.iter().filter(|l| !l.tx.is_closed()).count()
        })
    }

    /// Fire-and-forget delivery to every listener of `to`.
    pub fn send(&self, from: Context, to: Context, message: Message) -> Delivery {
        let kind = message.kind();
        let mut delivered = 0;

        if let Some(mut listeners) = self.listeners.get_mut(&to) {
            listeners.retain(|l| !l.tx.is_closed());

            for listener in listeners.iter() {
                let envelope = Envelope {
                    id: Uuid::new_v4(),
                    from,
                    message: message.clone(),
                    responder: None,
                };
                match listener.tx.try_send(envelope) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        warn!("Dropped {} for {}: {}", kind, to, e);
                        self.telemetry.record_message(kind, "dropped");
                    }
                }
            }
        }

        if delivered == 0 {
            debug!("No listener for {} in {}", kind, to);
            self.telemetry.record_message(kind, "no_listener");
            Delivery::NoListener
        } else {
            self.telemetry.record_message(kind, "delivered");
            Delivery::Delivered(delivered)
        }
    }

    /// Send `message` to one listener of `to` and wait for its reply.
    #[instrument(skip(self, message), fields(kind = message.kind()))]
    pub async fn request(&self, from: Context, to: Context, message: Message) -> Result<Reply> {
        let kind = message.kind();
        let (reply_tx, reply_rx) = oneshot::channel();

        let mut envelope = Envelope {
            id: Uuid::new_v4(),
            from,
            message,
            responder: Some(Responder(reply_tx)),
        };

        // Hand the request to the first listener that accepts it.
        let mut accepted = false;
        if let Some(mut listeners) = self.listeners.get_mut(&to) {
            listeners.retain(|l| !l.tx.is_closed());
            for listener in listeners.iter() {
                match listener.tx.try_send(envelope) {
                    Ok(()) => {
                        accepted = true;
                        break;
                    }
                    Err(mpsc::error::TrySendError::Full(back))
                    | Err(mpsc::error::TrySendError::Closed(back)) => envelope = back,
                }
            }
        }

        if !accepted {
            self.telemetry.record_message(kind, "no_listener");
            return Err(Error::ContextUnavailable(format!(
                "no listener for {} in {}",
                kind, to
            )));
        }
        self.telemetry.record_message(kind, "delivered");

        match tokio::time::timeout(self.config.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::ContextUnavailable(format!(
                "{} closed without answering {}",
                to, kind
            ))),
            Err(_) => Err(Error::ContextUnavailable(format!(
                "{} did not answer {} within {:?}",
                to, kind, self.config.request_timeout
            ))),
        }
    }

    /// [`request`](Self::request) under a retry policy.
    pub async fn request_with_retry(
        &self,
        from: Context,
        to: Context,
        message: Message,
        policy: &RetryPolicy,
    ) -> RetryOutcome<Reply> {
        retry_linear(policy, |_| self.request(from, to, message.clone())).await
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("contexts", &self.listeners.len())
            .field("request_timeout", &self.config.request_timeout)
            .finish()
    }
}
