use std::net::SocketAddr;

use crate::model::SeatEvent;

// ── Feed channels ───────────────────────────────────────────────

/// Gauge: change-feed channels currently open.
pub const SUBSCRIPTIONS_ACTIVE: &str = "covoit_subscriptions_active";

/// Counter: channel opens that failed. Labels: table.
pub const SUBSCRIBE_FAILURES_TOTAL: &str = "covoit_subscribe_failures_total";

/// Counter: changes the feed skipped because a receiver fell behind.
pub const FEED_LAGGED_TOTAL: &str = "covoit_feed_lagged_total";

// ── Reconciliation ──────────────────────────────────────────────

/// Gauge: trips in the currently tracked list.
pub const TRACKED_TRIPS: &str = "covoit_tracked_trips";

/// Counter: changes applied to a live seat map. Labels: kind.
pub const CHANGES_APPLIED_TOTAL: &str = "covoit_changes_applied_total";

/// Counter: changes received but not applied. Labels: reason.
pub const CHANGES_IGNORED_TOTAL: &str = "covoit_changes_ignored_total";

/// Counter: payloads rejected by the parser. Labels: reason.
pub const PAYLOADS_REJECTED_TOTAL: &str = "covoit_payloads_rejected_total";

/// Histogram: time to apply one change, in seconds.
pub const RECONCILE_DURATION_SECONDS: &str = "covoit_reconcile_duration_seconds";

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

/// Short label for a seat event kind.
pub fn event_label(event: &SeatEvent) -> &'static str {
    match event {
        SeatEvent::Absolute { .. } => "absolute",
        SeatEvent::Delta { .. } => "delta",
    }
}
