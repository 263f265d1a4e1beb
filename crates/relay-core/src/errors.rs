//! Error taxonomy for the relay.
//!
//! Each domain gets its own [`thiserror`] enum so callers can match on the
//! failure class they care about:
//!
//! - [`AdmissionError`]: a connection was refused; nothing was created
//! - [`ProtocolError`]: a client control frame could not be understood
//! - [`TransportError`]: reading from or writing to one transport failed
//! - [`EnqueueError`]: one message could not be queued for one connection
//! - [`BridgeError`]: the cross-process bus misbehaved
//! - [`HubError`]: administrative operations against the hub
//!
//! Every variant maps to a stable machine-readable [`code`](HubError::code)
//! used in log fields and HTTP error bodies.

use thiserror::Error;

/// Why a connection was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// The auth layer supplied no user ID.
    #[error("missing or empty identity")]
    MissingIdentity,
    /// The hub already holds its configured maximum of live connections.
    #[error("connection limit of {max} reached")]
    AtCapacity {
        /// Configured limit.
        max: usize,
    },
    /// The hub is shutting down and accepts no new connections.
    #[error("relay is shutting down")]
    ShuttingDown,
}

impl AdmissionError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingIdentity => "MISSING_IDENTITY",
            Self::AtCapacity { .. } => "AT_CAPACITY",
            Self::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

/// A control frame from a duplex client that could not be decoded.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON or did not match the control schema.
    #[error("invalid control frame: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// The frame named an action but no (or a blank) channel.
    #[error("control frame has no channel")]
    MissingChannel,
    /// A binary frame that is not UTF-8 text.
    #[error("binary frame is not valid UTF-8")]
    NonText,
}

impl ProtocolError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "INVALID_JSON",
            Self::MissingChannel => "MISSING_CHANNEL",
            Self::NonText => "NON_TEXT",
        }
    }
}

/// Failure of the underlying transport for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Receiving from the peer failed.
    #[error("transport receive failed: {0}")]
    Receive(String),
    /// Writing to the peer failed.
    #[error("transport send failed: {0}")]
    Send(String),
}

/// Why a message could not be placed on a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// The queue is at capacity; the message was dropped.
    #[error("outbound queue full")]
    Full,
    /// The queue has been closed by teardown.
    #[error("outbound queue closed")]
    Closed,
}

/// Failure on the cross-process bus. Never surfaced to publishers.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The bus could not be reached or subscribed to.
    #[error("bus connect failed: {0}")]
    Connect(String),
    /// Publishing an envelope failed.
    #[error("bus publish failed: {0}")]
    Publish(String),
    /// An envelope could not be encoded or decoded.
    #[error("envelope codec failed: {0}")]
    Codec(#[from] serde_json::Error),
}

impl BridgeError {
    /// Machine-readable error code, also used as a metric label.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Publish(_) => "publish",
            Self::Codec(_) => "codec",
        }
    }
}

/// Errors returned by hub operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// Admission was refused.
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    /// The targeted connection is closed or was never admitted.
    #[error("no active connection for {target}")]
    NoActiveConnection {
        /// Connection ID or user ID the caller targeted.
        target: String,
    },
}

impl HubError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Admission(e) => e.code(),
            Self::NoActiveConnection { .. } => "NO_ACTIVE_CONNECTION",
        }
    }

    /// Shorthand for [`HubError::NoActiveConnection`].
    pub fn no_connection(target: impl Into<String>) -> Self {
        Self::NoActiveConnection {
            target: target.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_codes() {
        assert_eq!(AdmissionError::MissingIdentity.code(), "MISSING_IDENTITY");
        assert_eq!(AdmissionError::AtCapacity { max: 3 }.code(), "AT_CAPACITY");
        assert_eq!(AdmissionError::ShuttingDown.code(), "SHUTTING_DOWN");
    }

    #[test]
    fn at_capacity_display_includes_limit() {
        let err = AdmissionError::AtCapacity { max: 50 };
        assert_eq!(err.to_string(), "connection limit of 50 reached");
    }

    #[test]
    fn protocol_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let err: ProtocolError = json_err.into();
        assert!(matches!(err, ProtocolError::InvalidJson(_)));
        assert_eq!(err.code(), "INVALID_JSON");
    }

    #[test]
    fn hub_error_wraps_admission_transparently() {
        let err: HubError = AdmissionError::ShuttingDown.into();
        assert_eq!(err.to_string(), "relay is shutting down");
        assert_eq!(err.code(), "SHUTTING_DOWN");
    }

    #[test]
    fn no_active_connection_names_target() {
        let err = HubError::no_connection("u1");
        assert_eq!(err.to_string(), "no active connection for u1");
        assert_eq!(err.code(), "NO_ACTIVE_CONNECTION");
    }

    #[test]
    fn bridge_codes_are_metric_labels() {
        assert_eq!(BridgeError::Connect("x".into()).code(), "connect");
        assert_eq!(BridgeError::Publish("x".into()).code(), "publish");
    }
}
