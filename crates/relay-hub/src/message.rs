//! Broadcast messages and their three wire shapes.
//!
//! - duplex outbound: `{"channel": <topic>, "payload": <any>}`
//! - stream outbound: `event: message\ndata: {"channel": <topic>, "event": <name>}\n\n`
//! - bus envelope: `{"topic": <topic>, "payload": <any>, "event"?, "origin"?}`

use chrono::{DateTime, Utc};
use relay_core::{BridgeError, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event name used when neither the message nor its payload names one.
pub const DEFAULT_EVENT: &str = "message";

/// One broadcast: a topic, an arbitrary payload, and an optional event tag.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// Destination topic.
    pub topic: String,
    /// Arbitrary JSON payload.
    pub payload: Value,
    /// Named event tag for the push-stream frame.
    pub event: Option<String>,
}

#[derive(Serialize)]
struct DuplexWire<'a> {
    channel: &'a str,
    payload: &'a Value,
}

#[derive(Serialize)]
struct StreamWire<'a> {
    channel: &'a str,
    event: &'a str,
}

impl Message {
    /// Untagged message.
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            event: None,
        }
    }

    /// Attach an explicit event tag.
    #[must_use]
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// Event name for stream frames: the explicit tag, else a string
    /// `payload.event`, else [`DEFAULT_EVENT`].
    pub fn event_name(&self) -> &str {
        self.event
            .as_deref()
            .or_else(|| self.payload.get("event").and_then(Value::as_str))
            .unwrap_or(DEFAULT_EVENT)
    }

    /// Serialize for a duplex client.
    pub fn to_duplex_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&DuplexWire {
            channel: &self.topic,
            payload: &self.payload,
        })
    }

    /// Serialize as one push-stream event block.
    pub fn to_stream_frame(&self) -> serde_json::Result<String> {
        let data = serde_json::to_string(&StreamWire {
            channel: &self.topic,
            event: self.event_name(),
        })?;
        Ok(format!("event: message\ndata: {data}\n\n"))
    }
}

/// Comment-only keepalive block. Clients ignore it.
pub fn keepalive_frame(now: DateTime<Utc>) -> String {
    format!(": ping {}\n\n", now.timestamp())
}

/// Wire form of a [`Message`] on the cross-process bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Destination topic.
    pub topic: String,
    /// Arbitrary JSON payload.
    pub payload: Value,
    /// Named event tag, when the publisher set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// Publishing node. Receivers skip their own envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<NodeId>,
}

impl Envelope {
    /// Wrap a message for publication by `origin`.
    pub fn from_message(message: &Message, origin: &NodeId) -> Self {
        Self {
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            event: message.event.clone(),
            origin: Some(origin.clone()),
        }
    }

    /// Encode as bus text.
    pub fn encode(&self) -> Result<String, BridgeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode bus text.
    pub fn decode(raw: &str) -> Result<Self, BridgeError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Whether this envelope was published by `node`.
    pub fn is_from(&self, node: &NodeId) -> bool {
        self.origin.as_ref() == Some(node)
    }

    /// Unwrap into a local message.
    pub fn into_message(self) -> Message {
        Message {
            topic: self.topic,
            payload: self.payload,
            event: self.event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn duplex_wire_shape() {
        let msg = Message::new("org:o1", json!({"event": "x", "n": 1}));
        let parsed: Value = serde_json::from_str(&msg.to_duplex_json().unwrap()).unwrap();
        assert_eq!(parsed, json!({"channel": "org:o1", "payload": {"event": "x", "n": 1}}));
    }

    #[test]
    fn stream_frame_shape() {
        let msg = Message::new("user:u1", json!({})).with_event("invitation.created");
        let frame = msg.to_stream_frame().unwrap();
        assert_eq!(
            frame,
            "event: message\ndata: {\"channel\":\"user:u1\",\"event\":\"invitation.created\"}\n\n"
        );
    }

    #[test]
    fn stream_frame_data_is_single_line() {
        let msg = Message::new("t", json!({"event": "multi\nline"}));
        let frame = msg.to_stream_frame().unwrap();
        assert_eq!(frame.matches('\n').count(), 3);
    }

    #[test]
    fn event_name_precedence() {
        let explicit = Message::new("t", json!({"event": "from_payload"})).with_event("explicit");
        assert_eq!(explicit.event_name(), "explicit");

        let from_payload = Message::new("t", json!({"event": "from_payload"}));
        assert_eq!(from_payload.event_name(), "from_payload");

        let non_string = Message::new("t", json!({"event": 7}));
        assert_eq!(non_string.event_name(), DEFAULT_EVENT);

        let scalar = Message::new("t", json!("hi"));
        assert_eq!(scalar.event_name(), DEFAULT_EVENT);
    }

    #[test]
    fn keepalive_is_comment_block() {
        let ts = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(keepalive_frame(ts), ": ping 1700000000\n\n");
    }

    #[test]
    fn envelope_roundtrip_keeps_origin() {
        let node = NodeId::from("node-a");
        let msg = Message::new("org:o1", json!({"k": "v"})).with_event("e");
        let env = Envelope::from_message(&msg, &node);
        let back = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert!(back.is_from(&node));
        assert!(!back.is_from(&NodeId::from("node-b")));
        assert_eq!(back.into_message(), msg);
    }

    #[test]
    fn envelope_minimal_form_decodes() {
        let env = Envelope::decode(r#"{"topic":"org:o1","payload":{"a":1}}"#).unwrap();
        assert!(env.origin.is_none());
        assert!(env.event.is_none());
        assert_eq!(env.topic, "org:o1");
    }

    #[test]
    fn envelope_garbage_is_codec_error() {
        let err = Envelope::decode("not json").unwrap_err();
        assert!(matches!(err, BridgeError::Codec(_)));
    }

    #[test]
    fn envelope_omits_absent_fields() {
        let env = Envelope {
            topic: "t".into(),
            payload: json!(null),
            event: None,
            origin: None,
        };
        assert_eq!(env.encode().unwrap(), r#"{"topic":"t","payload":null}"#);
    }
}
