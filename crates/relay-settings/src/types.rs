//! Settings types.
//!
//! All structs use `camelCase` JSON keys and `#[serde(default)]`, so a
//! settings file only needs to name the values it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// HTTP listener settings.
    pub server: ServerSettings,
    /// Fan-out hub settings.
    pub hub: HubSettings,
    /// Cross-process bridge settings.
    pub bridge: BridgeSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.hub.queue_capacity == 0 {
            return Err(SettingsError::rejected("hub.queueCapacity", "must be greater than 0"));
        }
        if self.hub.ping_interval_ms == 0 {
            return Err(SettingsError::rejected("hub.pingIntervalMs", "must be greater than 0"));
        }
        if self.hub.max_missed_pongs == 0 {
            return Err(SettingsError::rejected("hub.maxMissedPongs", "must be greater than 0"));
        }
        if self.hub.stream_keepalive_ms == 0 {
            return Err(SettingsError::rejected(
                "hub.streamKeepaliveMs",
                "must be greater than 0",
            ));
        }
        if self.bridge.channel.trim().is_empty() {
            return Err(SettingsError::rejected("bridge.channel", "must not be empty"));
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` auto-assigns).
    pub port: u16,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// How long shutdown waits for connections to drain.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_message_size: 64 * 1024,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl ServerSettings {
    /// Shutdown drain timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Fan-out hub settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Maximum live connections (duplex + stream).
    pub max_connections: usize,
    /// Per-connection outbound queue capacity.
    pub queue_capacity: usize,
    /// Interval between duplex liveness probes.
    pub ping_interval_ms: u64,
    /// Consecutive unanswered probes before a duplex peer is declared dead.
    pub max_missed_pongs: u32,
    /// Interval between keepalive comments on push streams.
    pub stream_keepalive_ms: u64,
    /// Consecutive malformed control frames tolerated before disconnecting.
    /// `0` tolerates any number.
    pub max_malformed_frames: u32,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            queue_capacity: 256,
            ping_interval_ms: 30_000,
            max_missed_pongs: 2,
            stream_keepalive_ms: 15_000,
            max_malformed_frames: 10,
        }
    }
}

impl HubSettings {
    /// Duplex ping interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Stream keepalive interval.
    pub fn stream_keepalive(&self) -> Duration {
        Duration::from_millis(self.stream_keepalive_ms)
    }
}

/// Cross-process bridge settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeSettings {
    /// Whether to attempt connecting to the bus at all.
    pub enabled: bool,
    /// Bus URL (e.g. `redis://127.0.0.1:6379`). `None` runs single-process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Bus channel carrying broadcast envelopes.
    pub channel: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            channel: "relay:broadcast".to_string(),
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
