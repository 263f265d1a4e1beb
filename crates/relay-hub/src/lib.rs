//! # relay-hub
//!
//! Real-time event fan-out.
//!
//! - [`registry`]: topic → subscriber-ID sets, plus the live connection table
//! - [`dispatcher`]: non-blocking local fan-out over a registry snapshot
//! - [`connection`]: per-connection state (bounded queue, cancellation, liveness)
//! - [`duplex`]: reader/writer actor pair for WebSocket-style transports
//! - [`stream`]: single-loop actor for one-way push streams
//! - [`bus`] + [`bridge`]: cross-process replication over a pub/sub bus
//! - [`hub`]: admission, administrative operations, teardown, shutdown

#![deny(unsafe_code)]

pub mod bridge;
pub mod bus;
pub mod connection;
pub mod dispatcher;
pub mod duplex;
pub mod heartbeat;
pub mod hub;
pub mod message;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod stream;

pub use bridge::Bridge;
#[cfg(feature = "redis")]
pub use bus::RedisBus;
pub use bus::{BusStream, MemoryBus, MessageBus};
pub use connection::{ClientConnection, TransportKind};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use duplex::run_duplex_session;
pub use hub::{Admission, Hub, HubStats};
pub use message::{Envelope, Message};
pub use registry::TopicRegistry;
pub use stream::push_stream;
