//! [`EventSink`] implementations.
//!
//! - [`MemorySink`] – keeps every record; used by tests and by the CLI to
//!   print an audit trail after a run.
//! - [`TracingSink`] – mirrors records into the `tracing` log at a level
//!   matching their severity.
//! - [`FanoutSink`] – tees one record to several sinks.

use std::sync::Arc;

use parking_lot::RwLock;
use photon_types::{AuditEvent, AuditKind, EventSink, Severity};
use tracing::{error, info, warn};

/// In-memory audit sink.
#[derive(Default)]
pub struct MemorySink {
    entries: RwLock<Vec<AuditEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEvent> {
        self.entries.read().clone()
    }

    /// Records of one kind, in arrival order.
    pub fn of_kind(&self, kind: AuditKind) -> Vec<AuditEvent> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: AuditEvent) {
        self.entries.write().push(event);
    }
}

/// Writes audit records to the `photon::audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: AuditEvent) {
        let kind = event.kind;
        match event.severity {
            Severity::Info => info!(target: "photon::audit", ?kind, details = %event.details),
            Severity::Warning => warn!(target: "photon::audit", ?kind, details = %event.details),
            Severity::Critical => error!(target: "photon::audit", ?kind, details = %event.details),
        }
    }
}

/// Delivers every record to each inner sink in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn record(&self, event: AuditEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}
