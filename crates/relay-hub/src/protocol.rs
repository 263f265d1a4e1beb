//! Duplex control protocol (client → server).
//!
//! `{"action":"subscribe","channel":"<topic>"}` /
//! `{"action":"unsubscribe","channel":"<topic>"}`, decoded once into
//! [`ClientAction`] at the parse boundary.

use relay_core::ProtocolError;
use serde::Deserialize;

/// A decoded control frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientAction {
    /// Join a topic.
    Subscribe(String),
    /// Leave a topic.
    Unsubscribe(String),
    /// Well-formed frame with an action the relay does not implement.
    Unrecognized(String),
}

#[derive(Deserialize)]
struct ControlFrame {
    action: String,
    #[serde(default)]
    channel: Option<String>,
}

/// Parse one text frame.
pub fn parse_control_frame(text: &str) -> Result<ClientAction, ProtocolError> {
    let frame: ControlFrame = serde_json::from_str(text)?;
    let channel = || {
        frame
            .channel
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_owned)
            .ok_or(ProtocolError::MissingChannel)
    };
    match frame.action.as_str() {
        "subscribe" => Ok(ClientAction::Subscribe(channel()?)),
        "unsubscribe" => Ok(ClientAction::Unsubscribe(channel()?)),
        other => Ok(ClientAction::Unrecognized(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe() {
        let action = parse_control_frame(r#"{"action":"subscribe","channel":"org:o1"}"#).unwrap();
        assert_eq!(action, ClientAction::Subscribe("org:o1".into()));
    }

    #[test]
    fn unsubscribe() {
        let action =
            parse_control_frame(r#"{"action":"unsubscribe","channel":"user:u1"}"#).unwrap();
        assert_eq!(action, ClientAction::Unsubscribe("user:u1".into()));
    }

    #[test]
    fn channel_is_trimmed() {
        let action = parse_control_frame(r#"{"action":"subscribe","channel":"  t  "}"#).unwrap();
        assert_eq!(action, ClientAction::Subscribe("t".into()));
    }

    #[test]
    fn unknown_action_is_unrecognized() {
        let action = parse_control_frame(r#"{"action":"publish","channel":"t"}"#).unwrap();
        assert_eq!(action, ClientAction::Unrecognized("publish".into()));
    }

    #[test]
    fn action_is_case_sensitive() {
        let action = parse_control_frame(r#"{"action":"Subscribe","channel":"t"}"#).unwrap();
        assert_eq!(action, ClientAction::Unrecognized("Subscribe".into()));
    }

    #[test]
    fn missing_channel() {
        let err = parse_control_frame(r#"{"action":"subscribe"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingChannel));
    }

    #[test]
    fn blank_channel() {
        let err = parse_control_frame(r#"{"action":"subscribe","channel":" "}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingChannel));
    }

    #[test]
    fn invalid_json() {
        let err = parse_control_frame("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidJson(_)));
    }

    #[test]
    fn missing_action() {
        let err = parse_control_frame(r#"{"channel":"t"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidJson(_)));
    }

    #[test]
    fn non_object() {
        assert!(parse_control_frame("[1,2,3]").is_err());
        assert!(parse_control_frame("").is_err());
    }

    #[test]
    fn extra_fields_ignored() {
        let action =
            parse_control_frame(r#"{"action":"subscribe","channel":"t","id":"r1"}"#).unwrap();
        assert_eq!(action, ClientAction::Subscribe("t".into()));
    }
}
