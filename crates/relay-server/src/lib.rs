//! # relay-server
//!
//! Thin HTTP surface over [`relay_hub::Hub`].
//!
//! - `GET /ws`: duplex WebSocket session
//! - `GET /events`: one-way `text/event-stream` push
//! - `GET /health`: liveness and hub counters
//! - `GET /metrics`: Prometheus text exposition

#![deny(unsafe_code)]

pub mod auth;
pub mod error;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;

pub use auth::{Authenticator, TrustedHeaders};
pub use server::{AppState, RelayServer};
pub use shutdown::ShutdownCoordinator;
