//! Service → Client push-channel messages

use serde::{Deserialize, Serialize};

use crate::types::CallerReply;

/// Messages pushed by the simulation service to subscribed clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Caller turn produced for the session room
    CallerResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(flatten)]
        reply: CallerReply,
    },

    // Errors
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}
