//! Request/response bodies for the simulation service REST API

use serde::{Deserialize, Serialize};

/// `POST /sessions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub trainee_id: String,
    pub scenario_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_subtype: Option<String>,
}

/// `POST /sessions/{id}/message`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub message: String,
}

/// Error payload returned with non-2xx statuses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// `GET /health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_sessions: Option<u64>,
}
