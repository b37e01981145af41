use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "evfleet_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "evfleet_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "evfleet_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "evfleet_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "evfleet_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "evfleet_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "evfleet_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "evfleet_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "evfleet_wal_flush_batch_size";

// ── Booking lifecycle ───────────────────────────────────────────

/// Counter: bookings accepted.
pub const BOOKINGS_CREATED_TOTAL: &str = "evfleet_bookings_created_total";

/// Counter: status transitions. Labels: from, to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "evfleet_booking_transitions_total";

/// Counter: bookings cancelled by the sweeper. Labels: reason.
pub const SWEEPER_CANCELLATIONS_TOTAL: &str = "evfleet_sweeper_cancellations_total";

/// Counter: reminders delivered by the sweeper.
pub const REMINDERS_SENT_TOTAL: &str = "evfleet_reminders_sent_total";

/// Counter: notification records persisted. Labels: kind.
pub const NOTIFICATIONS_TOTAL: &str = "evfleet_notifications_total";

/// Counter: push messages nobody received or that failed. Labels: reason.
pub const PUSH_MISSES_TOTAL: &str = "evfleet_push_misses_total";

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
        Command::InsertStation { .. } => "insert_station",
        Command::DeleteStation { .. } => "delete_station",
        Command::InsertUser { .. } => "insert_user",
        Command::UpdateUserRole { .. } => "update_user_role",
        Command::DeactivateUser { .. } => "deactivate_user",
        Command::InsertVehicle { .. } => "insert_vehicle",
        Command::UpdateVehicle { .. } => "update_vehicle",
        Command::DeleteVehicle { .. } => "delete_vehicle",
        Command::RemoveUnmanagedVehicles { .. } => "remove_unmanaged_vehicles",
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdateBookingStatus { .. } => "update_booking_status",
        Command::ModifyBooking { .. } => "modify_booking",
        Command::RecordPayment { .. } => "record_payment",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectBookedSlots { .. } => "select_booked_slots",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectVehicles { .. } => "select_vehicles",
        Command::SelectStations => "select_stations",
        Command::SelectUsers => "select_users",
        Command::SelectDashboard { .. } => "select_dashboard",
        Command::SelectActiveRides => "select_active_rides",
        Command::SelectNotifications { .. } => "select_notifications",
        Command::MarkNotificationsRead { .. } => "mark_notifications_read",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
