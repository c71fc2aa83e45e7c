//! Metrics support for the node

use iroh_metrics::core::{Core, Counter, Metric};
use struct_iterable::Iterable;

/// Metrics for a holdfast node
#[derive(Debug, Clone, Iterable)]
#[allow(missing_docs)]
pub struct Metrics {
    pub content_puts: Counter,
    pub content_put_bytes: Counter,
    pub content_gets: Counter,
    pub entries_applied: Counter,
    pub entries_replayed: Counter,
    pub entries_buffered: Counter,
    pub entries_rejected: Counter,
    pub gap_buffers_dropped: Counter,
    pub replica_sets_accepted: Counter,
    pub replica_sets_stale: Counter,
    pub sync_batches_sent: Counter,
    pub entries_sent: Counter,
    pub jobs_enqueued: Counter,
    pub jobs_merged: Counter,
    pub jobs_dropped: Counter,
    pub jobs_queue_full: Counter,
    pub jobs_succeeded: Counter,
    pub jobs_retried: Counter,
    pub jobs_failed: Counter,
    pub jobs_cancelled: Counter,
    pub sweeps: Counter,
    pub divergences: Counter,
    pub http_requests: Counter,
    pub http_requests_success: Counter,
    pub http_requests_error: Counter,
    pub http_requests_duration_ms: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            content_puts: Counter::new("Content writes accepted"),
            content_put_bytes: Counter::new("Total bytes of content accepted"),
            content_gets: Counter::new("Content reads served"),
            entries_applied: Counter::new("Log entries applied"),
            entries_replayed: Counter::new("Entries skipped as already applied"),
            entries_buffered: Counter::new("Out-of-order entries parked in a gap buffer"),
            entries_rejected: Counter::new("Entries rejected by integrity checks"),
            gap_buffers_dropped: Counter::new("Gap buffers dropped on overflow or expiry"),
            replica_sets_accepted: Counter::new("Replica set updates accepted"),
            replica_sets_stale: Counter::new("Replica set updates ignored as stale"),
            sync_batches_sent: Counter::new("Entry batches pushed to secondaries"),
            entries_sent: Counter::new("Log entries pushed to secondaries"),
            jobs_enqueued: Counter::new("Sync jobs accepted into the queue"),
            jobs_merged: Counter::new("Sync jobs merged into a pending job"),
            jobs_dropped: Counter::new("Sync jobs dropped because one was already running"),
            jobs_queue_full: Counter::new("Sync jobs rejected because the queue was full"),
            jobs_succeeded: Counter::new("Sync jobs confirmed by the target"),
            jobs_retried: Counter::new("Sync job attempts scheduled for retry"),
            jobs_failed: Counter::new("Sync jobs failed after exhausting retries"),
            jobs_cancelled: Counter::new("Sync jobs cancelled before completion"),
            sweeps: Counter::new("Reconciliation sweeps started"),
            divergences: Counter::new("Replica divergences flagged for operator attention"),
            http_requests: Counter::new("Number of HTTP requests"),
            http_requests_success: Counter::new("Number of HTTP requests with a 2xx status code"),
            http_requests_error: Counter::new("Number of HTTP requests with a non-2xx status code"),
            http_requests_duration_ms: Counter::new("Total duration of all HTTP requests"),
        }
    }
}

impl Metric for Metrics {
    fn name() -> &'static str {
        "holdfast"
    }
}

/// Init the metrics collection core.
pub fn init_metrics() {
    Core::init(|reg, metrics| {
        metrics.insert(Metrics::new(reg));
    });
}
