//! External publish/subscribe bus used to replicate broadcasts across
//! relay processes.
//!
//! - [`MemoryBus`]: in-process, for tests and several hubs in one binary
//! - `RedisBus` (feature `redis`): Redis `PUBLISH`/`SUBSCRIBE`

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use futures::stream::BoxStream;
use relay_core::BridgeError;

pub use memory::MemoryBus;
#[cfg(feature = "redis")]
pub use self::redis::RedisBus;

/// Stream of raw text payloads received on one bus channel.
pub type BusStream = BoxStream<'static, String>;

/// A text pub/sub transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `payload` on `channel`.
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BridgeError>;

    /// Subscribe to `channel`. The stream ends when the bus goes away.
    async fn subscribe(&self, channel: &str) -> Result<BusStream, BridgeError>;
}
