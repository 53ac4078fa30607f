//! Client → Service push-channel messages

use serde::{Deserialize, Serialize};

/// Messages sent from the training client over the push channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // Room membership
    JoinSession { session_id: String },
    LeaveSession { session_id: String },

    // Turns
    CallTakerMessage { session_id: String, message: String },
}

impl ClientMessage {
    pub fn session_id(&self) -> &str {
        match self {
            ClientMessage::JoinSession { session_id }
            | ClientMessage::LeaveSession { session_id }
            | ClientMessage::CallTakerMessage { session_id, .. } => session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ClientMessage;

    #[test]
    fn call_taker_message_wire_shape() {
        let msg = ClientMessage::CallTakerMessage {
            session_id: "sess-1".to_string(),
            message: "What's your location?".to_string(),
        };

        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(value["type"], "call_taker_message");
        assert_eq!(value["session_id"], "sess-1");
        assert_eq!(value["message"], "What's your location?");
    }

    #[test]
    fn deserializes_leave_session() {
        let json = r#"{"type":"leave_session","session_id":"sess-2"}"#;
        let parsed: ClientMessage = serde_json::from_str(json).expect("parse leave_session");
        assert_eq!(parsed.session_id(), "sess-2");
        assert!(matches!(parsed, ClientMessage::LeaveSession { .. }));
    }
}
