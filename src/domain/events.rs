//! Cross-context Messages
//!
//! The message catalog exchanged between the observer, coordinator and viewer
//! contexts. Every message and reply is plain structured data and serializes
//! as `{"type": "...", "data": ...}`.
//!
//! | Message           | Direction              | Kind                 |
//! |-------------------|------------------------|----------------------|
//! | `GET_METRICS`     | Coordinator → Observer | request-response     |
//! | `PAGE_METRICS`    | Observer → Coordinator | fire-and-forget      |
//! | `METRICS_UPDATED` | Coordinator → Viewer   | broadcast            |
//! | `SYNC_QUEUE`      | Viewer → Coordinator   | request-response     |
//! | `QUEUE_SYNCED`    | Coordinator → Viewer   | broadcast            |

use serde::{Deserialize, Serialize};

use super::ports::PageMetrics;

/// Identifies the browser tab an observer is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabId(pub u32);

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tab-{}", self.0)
    }
}

/// An isolated execution context reachable through the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Context {
    /// Metric extractor attached to one tab
    Observer(TabId),
    /// Long-lived process holding the queue, limiter and sync timer
    Coordinator,
    /// History presentation
    Viewer,
}

impl std::fmt::Display for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Context::Observer(tab) => write!(f, "observer({})", tab),
            Context::Coordinator => write!(f, "coordinator"),
            Context::Viewer => write!(f, "viewer"),
        }
    }
}

/// A message in the cross-context protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Ask an observer for the metrics of its page
    GetMetrics,
    /// Freshly observed metrics from an observer
    PageMetrics(PageMetrics),
    /// Metrics forwarded to the viewer for immediate display
    MetricsUpdated(PageMetrics),
    /// Ask the coordinator to flush the queue now
    SyncQueue,
    /// A manual flush finished
    QueueSynced,
}

impl Message {
    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::GetMetrics => "GET_METRICS",
            Message::PageMetrics(_) => "PAGE_METRICS",
            Message::MetricsUpdated(_) => "METRICS_UPDATED",
            Message::SyncQueue => "SYNC_QUEUE",
            Message::QueueSynced => "QUEUE_SYNCED",
        }
    }

    /// Whether the sender expects a reply.
    pub fn expects_reply(&self) -> bool {
        matches!(self, Message::GetMetrics | Message::SyncQueue)
    }
}

/// Reply to a request-response message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reply {
    /// Answer to `GET_METRICS`
    Metrics(PageMetrics),
    /// Answer to `SYNC_QUEUE`
    SyncAck { success: bool },
}

impl Reply {
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Metrics(_) => "METRICS",
            Reply::SyncAck { .. } => "SYNC_ACK",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_format() {
        let msg = Message::PageMetrics(PageMetrics::new("https://x.test", 1, 2, 3));
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "PAGE_METRICS");
        assert_eq!(json["data"]["url"], "https://x.test");

        let unit = serde_json::to_value(Message::SyncQueue).unwrap();
        assert_eq!(unit["type"], "SYNC_QUEUE");
        assert!(unit.get("data").is_none());
    }

    #[test]
    fn test_message_parse() {
        let msg: Message = serde_json::from_str(r#"{"type":"QUEUE_SYNCED"}"#).unwrap();
        assert_eq!(msg, Message::QueueSynced);
        assert_eq!(msg.kind(), "QUEUE_SYNCED");
    }

    #[test]
    fn test_expects_reply() {
        assert!(Message::GetMetrics.expects_reply());
        assert!(Message::SyncQueue.expects_reply());
        assert!(!Message::QueueSynced.expects_reply());
        assert!(!Message::MetricsUpdated(PageMetrics::new("u", 0, 0, 0)).expects_reply());
    }

    #[test]
    fn test_reply_wire_format() {
        let json = serde_json::to_value(Reply::SyncAck { success: true }).unwrap();
        assert_eq!(json["type"], "SYNC_ACK");
        assert_eq!(json["data"]["success"], true);
    }

    #[test]
    fn test_context_display() {
        assert_eq!(Context::Observer(TabId(4)).to_string(), "observer(tab-4)");
        assert_eq!(Context::Coordinator.to_string(), "coordinator");
    }
}
