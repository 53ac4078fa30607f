//! Request/response transport over HTTP (reqwest)

use std::time::Duration;

use async_trait::async_trait;
use dispatchsim_protocol::rest::{
    CreateSessionRequest, ErrorBody, HealthStatus, SendMessageRequest,
};
use dispatchsim_protocol::{CallerReply, SessionDescriptor, TerminationAck};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{SimulationApi, TransportError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Simulation service client speaking the `/sessions` REST API
#[derive(Debug, Clone)]
pub struct HttpSimulationApi {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpSimulationApi {
    /// `base_url` is the API root, e.g. `http://localhost:5000/api`.
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn session_url(&self, session_id: &str, suffix: &str) -> String {
        format!(
            "{}/sessions/{}{}",
            self.base_url,
            urlencoding::encode(session_id),
            suffix
        )
    }

    /// Health lives at the service origin, outside the `/api` prefix.
    fn health_url(&self) -> String {
        let origin = self
            .base_url
            .strip_suffix("/api")
            .unwrap_or(&self.base_url);
        format!("{origin}/health")
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        session_id: Option<&str>,
    ) -> Result<T, TransportError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        debug!(
            component = "transport",
            event = "http.response",
            status = status.as_u16(),
            body_bytes = body.len(),
            "Simulation service responded"
        );

        if status.is_success() {
            return serde_json::from_str(&body).map_err(|e| TransportError::Decode(e.to_string()));
        }

        if status == StatusCode::NOT_FOUND {
            if let Some(session_id) = session_id {
                return Err(TransportError::NotFound {
                    session_id: session_id.to_string(),
                });
            }
        }

        Err(TransportError::Status {
            status: status.as_u16(),
            message: error_message(status, &body),
        })
    }
}

fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        return parsed.error;
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
impl SimulationApi for HttpSimulationApi {
    async fn create_remote_session(
        &self,
        trainee_id: &str,
        scenario_code: &str,
        subtype: Option<&str>,
    ) -> Result<SessionDescriptor, TransportError> {
        let body = CreateSessionRequest {
            trainee_id: trainee_id.to_string(),
            scenario_type: scenario_code.to_string(),
            selected_subtype: subtype.map(str::to_string),
        };
        let request = self
            .client
            .post(format!("{}/sessions", self.base_url))
            .json(&body);
        self.execute(request, None).await
    }

    async fn send_utterance(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<CallerReply, TransportError> {
        let request = self
            .client
            .post(self.session_url(session_id, "/message"))
            .json(&SendMessageRequest {
                message: text.to_string(),
            });
        self.execute(request, Some(session_id)).await
    }

    async fn terminate_remote_session(
        &self,
        session_id: &str,
    ) -> Result<TerminationAck, TransportError> {
        let request = self.client.post(self.session_url(session_id, "/end"));
        self.execute(request, Some(session_id)).await
    }

    async fn fetch_remote_session(
        &self,
        session_id: &str,
    ) -> Result<SessionDescriptor, TransportError> {
        let request = self.client.get(self.session_url(session_id, ""));
        self.execute(request, Some(session_id)).await
    }

    async fn health(&self) -> Result<HealthStatus, TransportError> {
        let request = self.client.get(self.health_url());
        self.execute(request, None).await
    }
}
