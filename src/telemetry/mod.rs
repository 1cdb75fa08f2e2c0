//! Telemetry
//!
//! Prometheus counters for the sync pipeline, kept in a registry owned by
//! the process rather than the global default one.
//!
//! | Metric                              | Type        | Labels          |
//! |-------------------------------------|-------------|-----------------|
//! | `pagetrail_queue_depth`             | gauge       |                 |
//! | `pagetrail_records_queued_total`    | counter     |                 |
//! | `pagetrail_records_synced_total`    | counter     |                 |
//! | `pagetrail_rate_limited_total`      | counter     |                 |
//! | `pagetrail_sync_runs_total`         | counter vec | `outcome`       |
//! | `pagetrail_messages_total`          | counter vec | `kind, outcome` |

mod server;

pub use server::run_telemetry_server;

use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};

/// Process-wide metric handles.
pub struct Telemetry {
    registry: Registry,
    queue_depth: IntGauge,
    records_queued: IntCounter,
    records_synced: IntCounter,
    rate_limited: IntCounter,
    sync_runs: IntCounterVec,
    messages: IntCounterVec,
}

fn metric_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("Failed to register metric: {}", e))
}

impl Telemetry {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let queue_depth = IntGauge::new("pagetrail_queue_depth", "Visits waiting to be synced")
            .map_err(metric_err)?;
        let records_queued = IntCounter::new(
            "pagetrail_records_queued_total",
            "Visits appended to the durable queue",
        )
        .map_err(metric_err)?;
        let records_synced = IntCounter::new(
            "pagetrail_records_synced_total",
            "Visits accepted by the remote service",
        )
        .map_err(metric_err)?;
        let rate_limited = IntCounter::new(
            "pagetrail_rate_limited_total",
            "Observations suppressed by the per-URL window",
        )
        .map_err(metric_err)?;
        let sync_runs = IntCounterVec::new(
            Opts::new("pagetrail_sync_runs_total", "Queue flush attempts"),
            &["outcome"],
        )
        .map_err(metric_err)?;
        let messages = IntCounterVec::new(
            Opts::new("pagetrail_messages_total", "Cross-context messages routed"),
            &["kind", "outcome"],
        )
        .map_err(metric_err)?;

        registry
            .register(Box::new(queue_depth.clone()))
            .map_err(metric_err)?;
        registry
            .register(Box::new(records_queued.clone()))
            .map_err(metric_err)?;
        registry
            .register(Box::new(records_synced.clone()))
            .map_err(metric_err)?;
        registry
            .register(Box::new(rate_limited.clone()))
            .map_err(metric_err)?;
        registry
            .register(Box::new(sync_runs.clone()))
            .map_err(metric_err)?;
        registry
            .register(Box::new(messages.clone()))
            .map_err(metric_err)?;

        Ok(Arc::new(Self {
            registry,
            queue_depth,
            records_queued,
            records_synced,
            rate_limited,
            sync_runs,
            messages,
        }))
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn record_queued(&self) {
        self.records_queued.inc();
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.inc();
    }

    /// One flush attempt; `synced` is the number of records accepted.
    pub fn record_sync(&self, outcome: &str, synced: usize) {
        self.sync_runs.with_label_values(&[outcome]).inc();
        self.records_synced.inc_by(synced as u64);
    }

    pub fn record_message(&self, kind: &str, outcome: &str) {
        self.messages.with_label_values(&[kind, outcome]).inc();
    }

    pub fn queue_depth(&self) -> i64 {
        self.queue_depth.get()
    }

    pub fn sync_runs(&self, outcome: &str) -> u64 {
        self.sync_runs.with_label_values(&[outcome]).get()
    }

    pub fn messages(&self, kind: &str, outcome: &str) -> u64 {
        self.messages.with_label_values(&[kind, outcome]).get()
    }

    /// Render every metric in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;

        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("queue_depth", &self.queue_depth.get())
            .finish()
    }
}
