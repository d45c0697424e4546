use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "hostbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "hostbook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "hostbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "hostbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "hostbook_connections_rejected_total";

/// Gauge: number of loaded tenants.
pub const TENANTS_ACTIVE: &str = "hostbook_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "hostbook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "hostbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "hostbook_wal_flush_batch_size";

// ── Business metrics ────────────────────────────────────────────

/// Counter: reservation status changes. Labels: to.
pub const RESERVATION_TRANSITIONS_TOTAL: &str = "hostbook_reservation_transitions_total";

/// Counter: ledger status changes. Labels: to.
pub const ESCROW_TRANSITIONS_TOTAL: &str = "hostbook_escrow_transitions_total";

/// Counter: entries flagged released by settlement.
pub const RELEASES_TOTAL: &str = "hostbook_releases_total";

/// Counter: automatic refunds that could not be issued.
pub const COMPENSATION_FAILURES_TOTAL: &str = "hostbook_compensation_failures_total";

/// Histogram: payment gateway call latency in seconds. Labels: op.
pub const GATEWAY_CALL_DURATION_SECONDS: &str = "hostbook_gateway_call_duration_seconds";

/// Counter: failed gateway calls. Labels: op, reason.
pub const GATEWAY_FAILURES_TOTAL: &str = "hostbook_gateway_failures_total";

/// Counter: notifications emitted. Labels: kind.
pub const NOTIFICATIONS_TOTAL: &str = "hostbook_notifications_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertHost { .. } => "upsert_host",
        Command::UpsertCustomer { .. } => "upsert_customer",
        Command::CreatePayoutAccount { .. } => "create_payout_account",
        Command::InsertAvailability { .. } => "insert_availability",
        Command::RetireAvailability { .. } => "retire_availability",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::ConfirmReservation { .. } => "confirm_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::RescheduleReservation { .. } => "reschedule_reservation",
        Command::CompleteReservation { .. } => "complete_reservation",
        Command::MarkNoShow { .. } => "mark_no_show",
        Command::OverrideStatus { .. } => "override_status",
        Command::InsertPayment { .. } => "insert_payment",
        Command::CapturePayment { .. } => "capture_payment",
        Command::RefundTransaction { .. } => "refund_transaction",
        Command::RunSettlement { .. } => "run_settlement",
        Command::Webhook { .. } => "webhook",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSlot { .. } => "select_slot",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectTransactions { .. } => "select_transactions",
        Command::SelectTransactionStats => "select_transaction_stats",
        Command::SelectCallToken { .. } => "select_call_token",
        Command::Listen { .. } => "listen",
    }
}
