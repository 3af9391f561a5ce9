use std::net::SocketAddr;

use crate::protocol::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "turnero_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "turnero_request_duration_seconds";

/// Counter: booking attempts. Labels: outcome (`confirmed` or an error code).
pub const BOOKINGS_TOTAL: &str = "turnero_bookings_total";

/// Histogram: time from booking request to outcome, lock wait included.
pub const BOOKING_DURATION_SECONDS: &str = "turnero_booking_duration_seconds";

pub const CANCELLATIONS_TOTAL: &str = "turnero_cancellations_total";

pub const AVAILABILITY_QUERIES_TOTAL: &str = "turnero_availability_queries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "turnero_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "turnero_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "turnero_connections_rejected_total";

/// Counter: occupancy pushes dropped because a listener fell behind.
pub const NOTIFICATIONS_LAGGED_TOTAL: &str = "turnero_notifications_lagged_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "turnero_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "turnero_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
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

/// Short label for a request, used on every per-op metric.
pub fn op_label(request: &Request) -> &'static str {
    match request {
        Request::Availability { .. } => "availability",
        Request::Book { .. } => "book",
        Request::Cancel { .. } => "cancel",
        Request::Appointments { .. } => "appointments",
        Request::SetSchedule { .. } => "set_schedule",
        Request::SetSlotDuration { .. } => "set_slot_duration",
        Request::Listen { .. } => "listen",
        Request::Unlisten { .. } => "unlisten",
    }
}
