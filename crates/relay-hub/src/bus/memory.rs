//! In-memory pub/sub bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::BridgeError;
use tokio::sync::broadcast;
use tracing::warn;

use super::{BusStream, MessageBus};

/// Channel → broadcast sender. Clones share the same channels, so several
/// hubs holding clones behave like processes on one external bus.
#[derive(Clone, Debug)]
pub struct MemoryBus {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    buffer_size: usize,
    offline: Arc<AtomicBool>,
}

impl MemoryBus {
    /// Bus whose channels buffer up to `buffer_size` messages per receiver.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            buffer_size: buffer_size.max(1),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every subsequent publish and subscribe fail, as an unreachable
    /// bus would.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// End every live subscription on `channel`, as a dropped bus
    /// connection would. Later subscribers get a fresh channel.
    pub fn disconnect(&self, channel: &str) {
        let _ = self.channels.lock().remove(channel);
    }

    fn check_online(&self, what: &str) -> Result<(), BridgeError> {
        if self.offline.load(Ordering::Relaxed) {
            let reason = format!("memory bus offline during {what}");
            return Err(if what == "publish" {
                BridgeError::Publish(reason)
            } else {
                BridgeError::Connect(reason)
            });
        }
        Ok(())
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BridgeError> {
        self.check_online("publish")?;
        let channels = self.channels.lock();
        if let Some(tx) = channels.get(channel) {
            // No receivers is fine: nobody is listening on the bus.
            let _ = tx.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BusStream, BridgeError> {
        self.check_online("subscribe")?;
        let mut rx = {
            let mut channels = self.channels.lock();
            channels
                .entry(channel.to_owned())
                .or_insert_with(|| broadcast::channel(self.buffer_size).0)
                .subscribe()
        };
        let channel = channel.to_owned();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(payload) => yield payload,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(channel = %channel, lagged = n, "memory bus receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
