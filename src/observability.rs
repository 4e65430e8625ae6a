use std::net::SocketAddr;

use crate::lifecycle::Transition;

// ── Appointment flow ────────────────────────────────────────────

/// Counter: lifecycle transitions. Labels: transition, status.
pub const TRANSITIONS_TOTAL: &str = "tutorhours_transitions_total";

/// Counter: notifications handed to the hub.
pub const NOTIFICATIONS_TOTAL: &str = "tutorhours_notifications_total";

/// Counter: supervisor overrides (force archive, clock-time correction).
pub const OVERRIDES_TOTAL: &str = "tutorhours_overrides_total";

// ── Batches ─────────────────────────────────────────────────────

/// Counter: batch units finished. Labels: batch, outcome.
pub const BATCH_UNITS_TOTAL: &str = "tutorhours_batch_units_total";

/// Histogram: wall time of one batch unit in seconds, retries included. Labels: batch.
pub const BATCH_UNIT_DURATION_SECONDS: &str = "tutorhours_batch_unit_duration_seconds";

/// Counter: transient failures retried. Labels: batch.
pub const BATCH_RETRIES_TOTAL: &str = "tutorhours_batch_retries_total";

/// Gauge: units completed in the most recent batch. Labels: batch.
pub const BATCH_PROGRESS: &str = "tutorhours_batch_progress";

// ── Storage ─────────────────────────────────────────────────────

/// Gauge: number of open partitions (loaded stores).
pub const PARTITIONS_ACTIVE: &str = "tutorhours_partitions_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tutorhours_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tutorhours_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "tutorhours_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Record one transition attempt.
pub fn record_transition(transition: Transition, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    metrics::counter!(
        TRANSITIONS_TOTAL,
        "transition" => transition.as_str(),
        "status" => status
    )
    .increment(1);
}
