//! # relay-core
//!
//! Shared vocabulary for the relay workspace.
//!
//! - [`ids`]: branded ID newtypes (`ConnectionId`, `NodeId`)
//! - [`identity`]: the admitted identity and its topic naming conventions
//! - [`errors`]: error taxonomy shared by the hub and the HTTP layer
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod errors;
pub mod identity;
pub mod ids;
pub mod logging;

pub use errors::{AdmissionError, BridgeError, EnqueueError, HubError, ProtocolError, TransportError};
pub use identity::Identity;
pub use ids::{ConnectionId, NodeId};
