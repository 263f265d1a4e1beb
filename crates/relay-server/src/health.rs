//! `/health` endpoint.

use relay_hub::HubStats;
use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `"ok"`, or `"shutting_down"` once shutdown has begun.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live connections of any kind.
    pub connections: usize,
    /// Live push streams.
    pub streams: usize,
    /// Topics with at least one subscriber.
    pub topics: usize,
    /// Whether the cross-process bridge is attached.
    pub bridge: bool,
}

/// Build a health response from hub counters.
pub fn health_check(start_time: Instant, stats: HubStats, shutting_down: bool) -> HealthResponse {
    HealthResponse {
        status: if shutting_down { "shutting_down" } else { "ok" },
        uptime_secs: start_time.elapsed().as_secs(),
        connections: stats.connections,
        streams: stats.streams,
        topics: stats.topics,
        bridge: stats.bridge_enabled,
    }
}
