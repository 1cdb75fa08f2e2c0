//! Domain Layer
//!
//! Value objects, ports and the cross-context message catalog shared by every
//! component.
//!
//! - **Ports** (`ports.rs`) - Value objects and trait abstractions for external collaborators
//! - **Events** (`events.rs`) - Messages exchanged between execution contexts
//!
//! # Usage
//!
//! ```ignore
//! use pagetrail::domain::{Message, PageMetrics, VisitService};
//!
//! async fn ingest<S: VisitService>(service: &S, metrics: PageMetrics) -> Result<()> {
//!     service.submit_batch(&[metrics.into()]).await
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::{Context, Message, Reply, TabId};
pub use ports::{
    // Port traits
    Clock,
    MetricsSource,
    StateStore,
    VisitService,
    // Value objects
    ConfirmedVisit,
    LastMetrics,
    ManualClock,
    PageMetrics,
    PaginatedVisits,
    PendingRecord,
    SystemClock,
    VisitCreate,
    VisitMetrics,
};
