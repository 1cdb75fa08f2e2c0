//! Pagetrail - Offline-tolerant Visit Recording
//!
//! Records metrics of visited pages in one execution context, queues them
//! durably on the local machine, and syncs them to a remote visit service in
//! batches. History is shown as one list that fuses visits still waiting in
//! the queue with the confirmed history the service returns.
//!
//! # Architecture
//!
//! Three isolated contexts talk only through the [`router::MessageRouter`]:
//!
//! ```text
//! ┌─────────────────┐   PAGE_METRICS    ┌──────────────────────────────┐
//! │    Observer     │──────────────────▶│         Coordinator          │
//! │   (one per tab) │◀──────────────────│  RateLimiter  DurableQueue   │
//! └─────────────────┘    GET_METRICS    │  SyncCoordinator (timer)     │
//!                                       └──────────────────────────────┘
//!                                          │ METRICS_UPDATED   ▲ SYNC_QUEUE
//!                                          ▼ QUEUE_SYNCED      │
//!                                       ┌──────────────────────────────┐
//!                                       │   Viewer (HistoryMerger)     │
//!                                       └──────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`config`] - File configuration
//! - [`coordinator`] - Long-lived context owning queue, limiter and timers
//! - [`domain`] - Value objects, messages and ports
//! - [`error`] - Error types
//! - [`history`] - Fused pending + confirmed history
//! - [`limiter`] - Per-url cooldown gate
//! - [`observer`] - Per-tab metrics responder
//! - [`queue`] - Durable pending-visit queue
//! - [`router`] - Cross-context messaging
//! - [`sync`] - Queue drain to the remote service
//! - [`telemetry`] - Prometheus metrics
//! - [`viewer`] - History view state

pub mod adapters;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod history;
pub mod limiter;
pub mod observer;
pub mod queue;
pub mod router;
pub mod sync;
pub mod telemetry;
pub mod viewer;

// Re-export commonly used types
pub use config::AppConfig;
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorParts};
pub use error::{Error, Result};
pub use history::{FusedHistoryView, FusedRow, HistoryMerger};
pub use limiter::RateLimiter;
pub use queue::DurableQueue;
pub use router::MessageRouter;
pub use sync::{SyncCoordinator, SyncOutcome};
pub use telemetry::Telemetry;
pub use viewer::ViewerSession;
