//! Infrastructure Adapters
//!
//! Adapter implementations for the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │   VisitService │ StateStore │ MetricsSource                │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ HttpVisitService │ FileStateStore │ SnapshotSource         │ │
//! │  │ InMemoryVisitService │ InMemoryStateStore                  │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use pagetrail::adapters::{FileStateStore, HttpVisitService, RemoteConfig};
//!
//! let store = Arc::new(FileStateStore::open("/var/lib/pagetrail").await?);
//! let service = Arc::new(HttpVisitService::new(RemoteConfig::default())?);
//! ```

mod file_store;
mod http_service;
mod memory;
mod snapshot;

pub use file_store::FileStateStore;
pub use http_service::{HttpVisitService, RemoteConfig};
pub use memory::{InMemoryStateStore, InMemoryVisitService};
pub use snapshot::SnapshotSource;
