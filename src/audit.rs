use crate::query::Filter;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Severity attached to an audit event. `Warning` is reserved for
/// partial failures (e.g. a batch that aborted midway).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One user-visible operation, reported exactly once to the audit sink.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub op: String,
    pub collection: String,
    pub db: String,
    pub user: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
    pub severity: Severity,
    pub details: Option<String>,
    pub counts: Option<u64>,
    pub filter: Option<Filter>,
}

/// Pluggable audit destination. The core calls `log` once per
/// user-visible operation and never blocks on the sink's internals.
pub trait AuditSink: Send + Sync {
    fn log(&self, event: AuditEvent);
}

/// Counters and latency observations keyed by operation name.
pub trait MetricsCollector: Send + Sync {
    fn incr(&self, op: &str);
    fn observe_latency(&self, op: &str, duration: Duration);
}

/// Told about every page-sized disk transfer.
pub trait ResourceTracker: Send + Sync {
    fn record_read(&self, bytes: u64);
    fn record_write(&self, bytes: u64);
}

/// Default collaborators used when a caller does not supply handles.
#[derive(Debug, Default)]
pub struct NoopAudit;

impl AuditSink for NoopAudit {
    fn log(&self, _event: AuditEvent) {}
}

#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {
    fn incr(&self, _op: &str) {}
    fn observe_latency(&self, _op: &str, _duration: Duration) {}
}

#[derive(Debug, Default)]
pub struct NoopResources;

impl ResourceTracker for NoopResources {
    fn record_read(&self, _bytes: u64) {}
    fn record_write(&self, _bytes: u64) {}
}
