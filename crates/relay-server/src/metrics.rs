//! Prometheus recorder and metric descriptions.

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use relay_hub::metrics::{
    ADMISSION_REJECTED_TOTAL, BRIDGE_ERRORS_TOTAL, BRIDGE_PUBLISHED_TOTAL, BRIDGE_RECEIVED_TOTAL,
    CONNECTION_DURATION_SECONDS, CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL, DISCONNECTIONS_TOTAL,
    DISPATCH_DROPS_TOTAL, DISPATCH_TOTAL, HEARTBEAT_TIMEOUTS_TOTAL, PROTOCOL_ERRORS_TOTAL,
};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Call once at startup, before any metric is recorded. The returned handle
/// renders the `/metrics` body.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Attach help text to every relay metric.
pub fn describe_metrics() {
    describe_counter!(CONNECTIONS_TOTAL, "Connections admitted");
    describe_gauge!(CONNECTIONS_ACTIVE, "Live connections");
    describe_counter!(DISCONNECTIONS_TOTAL, "Connections torn down");
    describe_histogram!(
        CONNECTION_DURATION_SECONDS,
        Unit::Seconds,
        "Connection lifetime"
    );
    describe_counter!(ADMISSION_REJECTED_TOTAL, "Admissions refused");
    describe_counter!(DISPATCH_TOTAL, "Messages queued to subscribers");
    describe_counter!(DISPATCH_DROPS_TOTAL, "Messages dropped on full queues");
    describe_counter!(PROTOCOL_ERRORS_TOTAL, "Malformed control frames");
    describe_counter!(HEARTBEAT_TIMEOUTS_TOTAL, "Duplex peers declared dead");
    describe_counter!(BRIDGE_PUBLISHED_TOTAL, "Envelopes published to the bus");
    describe_counter!(BRIDGE_RECEIVED_TOTAL, "Envelopes dispatched from the bus");
    describe_counter!(BRIDGE_ERRORS_TOTAL, "Bus failures");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_from_local_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(CONNECTIONS_TOTAL, "transport" => "duplex").increment(2);
        });
        let text = render(&handle);
        assert!(text.contains("relay_connections_total"));
        assert!(text.contains("transport=\"duplex\""));
    }

    #[test]
    fn describe_without_recorder_is_noop() {
        describe_metrics();
    }
}
