//! Redis pub/sub bus.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use relay_core::BridgeError;
use tracing::{info, warn};

use super::{BusStream, MessageBus};

/// Redis `PUBLISH`/`SUBSCRIBE` over one multiplexed publishing connection
/// plus one dedicated connection per subscription.
pub struct RedisBus {
    client: redis::Client,
    publisher: MultiplexedConnection,
}

impl RedisBus {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, BridgeError> {
        let client = redis::Client::open(url).map_err(|e| BridgeError::Connect(e.to_string()))?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;
        info!("connected to redis bus");
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BridgeError> {
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| BridgeError::Publish(e.to_string()))
    }

    async fn subscribe(&self, channel: &str) -> Result<BusStream, BridgeError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(error = %e, "non-text payload on redis bus, skipping");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
