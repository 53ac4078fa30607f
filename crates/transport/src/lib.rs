//! DispatchSim Transport
//!
//! Delivers call-taker utterances to the simulation service and brings caller
//! replies back. Two interchangeable modes exist: request/response over HTTP
//! (`SimulationApi`) and a session-scoped push channel over WebSocket
//! (`PushChannel`). A deployment picks one through [`Delivery`].

pub mod http;
pub mod ws;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use dispatchsim_protocol::rest::HealthStatus;
use dispatchsim_protocol::{
    CallerReply, ClientMessage, SessionDescriptor, TerminationAck,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

pub use http::HttpSimulationApi;
pub use ws::WsPushChannel;

/// Errors raised while talking to the simulation service
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Simulation service returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Session not found: {session_id}")]
    NotFound { session_id: String },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Invalid response from simulation service: {0}")]
    Decode(String),

    #[error("Not connected to server")]
    Disconnected,
}

impl TransportError {
    /// HTTP-like status, when the failure came with one.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            TransportError::NotFound { .. } => Some(404),
            _ => None,
        }
    }
}

/// Request/response access to the simulation service.
#[async_trait]
pub trait SimulationApi: Send + Sync {
    async fn create_remote_session(
        &self,
        trainee_id: &str,
        scenario_code: &str,
        subtype: Option<&str>,
    ) -> Result<SessionDescriptor, TransportError>;

    async fn send_utterance(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<CallerReply, TransportError>;

    async fn terminate_remote_session(
        &self,
        session_id: &str,
    ) -> Result<TerminationAck, TransportError>;

    async fn fetch_remote_session(
        &self,
        session_id: &str,
    ) -> Result<SessionDescriptor, TransportError>;

    async fn health(&self) -> Result<HealthStatus, TransportError>;
}

/// Session-scoped push channel.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Join the session channel. Connection happens in the background;
    /// watch [`Subscription::connection`] for the connected flag.
    async fn subscribe(&self, session_id: &str) -> Result<Subscription, TransportError>;
}

/// Asynchronous event delivered on a push channel
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Reply(CallerReply),
    Error { message: String },
}

/// A live push-channel membership.
///
/// Dropping or cancelling it leaves the session room and closes the socket.
pub struct Subscription {
    session_id: String,
    outbound: mpsc::Sender<ClientMessage>,
    events: Option<mpsc::Receiver<PushEvent>>,
    connected: watch::Receiver<bool>,
    shutdown: Option<oneshot::Sender<()>>,
}

/// Channel-side half of a [`Subscription`], driven by a transport task.
pub struct ChannelDriver {
    pub session_id: String,
    pub outbound: mpsc::Receiver<ClientMessage>,
    pub events: mpsc::Sender<PushEvent>,
    pub connected: watch::Sender<bool>,
    pub shutdown: oneshot::Receiver<()>,
}

impl Subscription {
    /// Create a disconnected subscription and the driver half that feeds it.
    pub fn channel(session_id: &str) -> (Subscription, ChannelDriver) {
        let (outbound_tx, outbound_rx) = mpsc::channel(32);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (connected_tx, connected_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let subscription = Subscription {
            session_id: session_id.to_string(),
            outbound: outbound_tx,
            events: Some(events_rx),
            connected: connected_rx,
            shutdown: Some(shutdown_tx),
        };
        let driver = ChannelDriver {
            session_id: session_id.to_string(),
            outbound: outbound_rx,
            events: events_tx,
            connected: connected_tx,
            shutdown: shutdown_rx,
        };
        (subscription, driver)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch the connected flag.
    pub fn connection(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Take the event receiver. Only one consumer may own it.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<PushEvent>> {
        self.events.take()
    }

    /// Cloneable handle for sending utterances on this channel.
    pub fn sender(&self) -> PushSender {
        PushSender {
            session_id: self.session_id.clone(),
            outbound: self.outbound.clone(),
            connected: self.connected.clone(),
        }
    }

    /// Leave the session channel. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_none()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("session_id", &self.session_id)
            .field("connected", &self.is_connected())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Sends call-taker utterances over a subscription's channel
#[derive(Clone)]
pub struct PushSender {
    session_id: String,
    outbound: mpsc::Sender<ClientMessage>,
    connected: watch::Receiver<bool>,
}

impl PushSender {
    pub async fn send_utterance(&self, text: &str) -> Result<(), TransportError> {
        if !*self.connected.borrow() {
            return Err(TransportError::Disconnected);
        }
        self.outbound
            .send(ClientMessage::CallTakerMessage {
                session_id: self.session_id.clone(),
                message: text.to_string(),
            })
            .await
            .map_err(|_| TransportError::Disconnected)
    }
}

/// How caller replies reach the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    Polling,
    Streaming,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::Polling => f.write_str("polling"),
            DeliveryMode::Streaming => f.write_str("streaming"),
        }
    }
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "polling" | "http" => Ok(DeliveryMode::Polling),
            "streaming" | "ws" | "websocket" => Ok(DeliveryMode::Streaming),
            other => Err(format!(
                "unknown delivery mode '{other}' (expected polling or streaming)"
            )),
        }
    }
}

/// Delivery configuration for a deployment.
///
/// `Polling` gets the caller reply as the HTTP response to the send;
/// `Streaming` sends over the push channel and receives the reply as an event.
#[derive(Clone)]
pub enum Delivery {
    Polling,
    Streaming(Arc<dyn PushChannel>),
}

impl Delivery {
    pub fn mode(&self) -> DeliveryMode {
        match self {
            Delivery::Polling => DeliveryMode::Polling,
            Delivery::Streaming(_) => DeliveryMode::Streaming,
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Delivery::{}", self.mode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_sender_rejects_while_disconnected() {
        let (subscription, _driver) = Subscription::channel("sess-1");
        let err = subscription
            .sender()
            .send_utterance("hello")
            .await
            .expect_err("disconnected send must fail");
        assert!(matches!(err, TransportError::Disconnected));
    }

    #[tokio::test]
    async fn push_sender_forwards_when_connected() {
        let (subscription, mut driver) = Subscription::channel("sess-1");
        driver.connected.send_replace(true);

        subscription
            .sender()
            .send_utterance("What's your location?")
            .await
            .expect("send");

        let msg = driver.outbound.recv().await.expect("outbound message");
        assert_eq!(
            msg,
            ClientMessage::CallTakerMessage {
                session_id: "sess-1".to_string(),
                message: "What's your location?".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn dropping_subscription_signals_shutdown() {
        let (subscription, driver) = Subscription::channel("sess-1");
        drop(subscription);
        assert!(driver.shutdown.await.is_ok());
    }

    #[test]
    fn cancel_is_idempotent() {
        let (mut subscription, _driver) = Subscription::channel("sess-1");
        subscription.cancel();
        subscription.cancel();
        assert!(subscription.is_cancelled());
    }

    #[test]
    fn delivery_mode_parses_aliases() {
        assert_eq!("WS".parse::<DeliveryMode>(), Ok(DeliveryMode::Streaming));
        assert_eq!("polling".parse::<DeliveryMode>(), Ok(DeliveryMode::Polling));
        assert!("carrier-pigeon".parse::<DeliveryMode>().is_err());
    }

    #[test]
    fn status_codes_are_exposed() {
        let err = TransportError::Status {
            status: 500,
            message: "Internal server error".into(),
        };
        assert_eq!(err.status(), Some(500));
        assert_eq!(
            TransportError::NotFound {
                session_id: "x".into()
            }
            .status(),
            Some(404)
        );
        assert_eq!(TransportError::Disconnected.status(), None);
    }
}
