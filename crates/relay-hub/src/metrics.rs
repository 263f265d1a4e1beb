//! Metric names emitted by the hub.
//!
//! The hub only records through the `metrics` facade; installing a recorder
//! (Prometheus in `relay-server`) is the binary's job.

/// Connections admitted (counter, labels: transport).
pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
/// Live connections (gauge, labels: transport).
pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
/// Connections torn down (counter, labels: transport).
pub const DISCONNECTIONS_TOTAL: &str = "relay_disconnections_total";
/// Connection lifetime (histogram, labels: transport).
pub const CONNECTION_DURATION_SECONDS: &str = "relay_connection_duration_seconds";
/// Admissions refused (counter, labels: code).
pub const ADMISSION_REJECTED_TOTAL: &str = "relay_admission_rejected_total";
/// Messages enqueued to a subscriber (counter).
pub const DISPATCH_TOTAL: &str = "relay_dispatch_total";
/// Messages dropped on a full subscriber queue (counter).
pub const DISPATCH_DROPS_TOTAL: &str = "relay_dispatch_drops_total";
/// Malformed control frames (counter, labels: code).
pub const PROTOCOL_ERRORS_TOTAL: &str = "relay_protocol_errors_total";
/// Duplex peers declared dead by heartbeat (counter).
pub const HEARTBEAT_TIMEOUTS_TOTAL: &str = "relay_heartbeat_timeouts_total";
/// Envelopes published to the bus (counter).
pub const BRIDGE_PUBLISHED_TOTAL: &str = "relay_bridge_published_total";
/// Foreign envelopes dispatched from the bus (counter).
pub const BRIDGE_RECEIVED_TOTAL: &str = "relay_bridge_received_total";
/// Bridge failures (counter, labels: kind).
pub const BRIDGE_ERRORS_TOTAL: &str = "relay_bridge_errors_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_prefixed_snake_case() {
        let names = [
            CONNECTIONS_TOTAL,
            CONNECTIONS_ACTIVE,
            DISCONNECTIONS_TOTAL,
            CONNECTION_DURATION_SECONDS,
            ADMISSION_REJECTED_TOTAL,
            DISPATCH_TOTAL,
            DISPATCH_DROPS_TOTAL,
            PROTOCOL_ERRORS_TOTAL,
            HEARTBEAT_TIMEOUTS_TOTAL,
            BRIDGE_PUBLISHED_TOTAL,
            BRIDGE_RECEIVED_TOTAL,
            BRIDGE_ERRORS_TOTAL,
        ];
        for name in names {
            assert!(name.starts_with("relay_"), "metric '{name}' must be prefixed");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
