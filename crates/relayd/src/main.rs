//! # relayd
//!
//! Relay server binary: loads settings, initializes logging and metrics,
//! attaches the cross-process bus when one is configured, and serves until
//! ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_hub::{Hub, MessageBus};
use relay_server::RelayServer;
use relay_settings::{BridgeSettings, RelaySettings, load_settings_from_path};
use tracing::{info, warn};

/// Real-time relay server.
#[derive(Parser, Debug)]
#[command(name = "relayd", about = "Real-time event relay")]
struct Cli {
    /// Path to the JSON settings file. Missing file means defaults.
    #[arg(long, default_value = "relay.json")]
    settings: PathBuf,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Pub/sub bus URL, e.g. `redis://127.0.0.1:6379` (overrides settings).
    #[arg(long)]
    bus_url: Option<String>,

    /// Emit JSON logs (overrides settings).
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Command-line flags take priority over every settings layer.
    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(url) = &self.bus_url {
            settings.bridge.url = Some(url.clone());
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}

/// Connect to the configured bus. `None` means single-process mode.
async fn connect_bus(bridge: &BridgeSettings) -> Option<Arc<dyn MessageBus>> {
    if !bridge.enabled {
        info!("bridge disabled, running single-process");
        return None;
    }
    let Some(url) = bridge.url.as_deref() else {
        info!("no bus url configured, running single-process");
        return None;
    };
    open_bus(url).await
}

#[cfg(feature = "redis")]
async fn open_bus(url: &str) -> Option<Arc<dyn MessageBus>> {
    match relay_hub::RedisBus::connect(url).await {
        Ok(bus) => Some(Arc::new(bus)),
        Err(e) => {
            warn!(error = %e, "bus unreachable, running single-process");
            None
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn open_bus(url: &str) -> Option<Arc<dyn MessageBus>> {
    warn!(url, "built without redis support, running single-process");
    None
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = load_settings_from_path(&cli.settings)
        .with_context(|| format!("Failed to load settings from {}", cli.settings.display()))?;
    cli.apply(&mut settings);

    if settings.logging.json {
        relay_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        relay_core::logging::init_subscriber(&settings.logging.level);
    }

    let metrics = relay_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let hub = match connect_bus(&settings.bridge).await {
        Some(bus) => {
            Hub::with_bus(settings.hub.clone(), bus, settings.bridge.channel.clone()).await
        }
        None => Hub::new(settings.hub.clone()),
    };

    let server = RelayServer::new(settings.server.clone(), hub).with_metrics(metrics);
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    info!(
        bridge = server.hub().bridge_enabled(),
        node_id = %server.hub().node_id(),
        "relay listening on http://{addr}"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("Shutting down...");
    if !server.shutdown_gracefully(handle).await {
        warn!("some sessions did not finish before the shutdown timeout");
    }
    info!("Shutdown complete");
    Ok(())
}
