use std::net::SocketAddr;

// ── Lifecycle metrics ───────────────────────────────────────────

/// Counter: reservations created. Labels: status.
pub const RESERVATIONS_CREATED_TOTAL: &str = "salas_reservations_created_total";

/// Counter: creations/modifications rejected for overlapping an occupied window.
pub const WINDOW_CONFLICTS_TOTAL: &str = "salas_window_conflicts_total";

/// Counter: creations/modifications rejected by the lead-time rule.
pub const LEAD_TIME_VIOLATIONS_TOTAL: &str = "salas_lead_time_violations_total";

/// Counter: reservations cancelled. Labels: by (client, staff, payment).
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "salas_reservations_cancelled_total";

// ── Sweep metrics ───────────────────────────────────────────────

/// Counter: reservations moved ACTIVE → FINALIZED by the sweep.
pub const SWEEP_FINALIZED_TOTAL: &str = "salas_sweep_finalized_total";

/// Counter: pending reservations cancelled for an unconfirmed payment.
pub const SWEEP_PAYMENTS_EXPIRED_TOTAL: &str = "salas_sweep_payments_expired_total";

/// Histogram: sweep duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "salas_sweep_duration_seconds";

// ── Mirror metrics ──────────────────────────────────────────────

/// Counter: failed calendar mirror calls. Labels: op.
pub const MIRROR_FAILURES_TOTAL: &str = "salas_mirror_failures_total";

// ── Storage metrics ─────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "salas_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "salas_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
