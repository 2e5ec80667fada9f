use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "larder_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "larder_query_duration_seconds";

/// Counter: admission attempts. Labels: book, outcome (status admitted with, or rejection code).
pub const ADMISSIONS_TOTAL: &str = "larder_admissions_total";

/// Counter: notifications the dispatcher failed to deliver.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "larder_notifications_failed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "larder_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "larder_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "larder_connections_rejected_total";

/// Gauge: number of organizations with open books.
pub const TENANTS_ACTIVE: &str = "larder_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "larder_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "larder_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "larder_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertUnit { .. } => "insert_unit",
        Command::UpdateUnit { .. } => "update_unit",
        Command::InsertOverride { .. } => "insert_override",
        Command::DeleteOverride { .. } => "delete_override",
        Command::GrantRole { .. } => "grant_role",
        Command::RevokeRole { .. } => "revoke_role",
        Command::InsertBooking { .. } => "insert_booking",
        Command::RescheduleBooking { .. } => "reschedule_booking",
        Command::ResolveConflict { .. } => "resolve_conflict",
        Command::UpdateBookingStatus { .. } => "update_booking_status",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::InsertSeries { .. } => "insert_series",
        Command::CancelSeries { .. } => "cancel_series",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectDay { .. } => "select_day",
        Command::SelectUnits => "select_units",
        Command::SelectBookings(_) => "select_bookings",
        Command::SelectSeries(_) => "select_series",
        Command::SelectOverrides => "select_overrides",
        Command::SelectRoles { .. } => "select_roles",
    }
}
