//! Push transport over WebSocket (tokio-tungstenite)
//!
//! Each subscription owns one socket. The socket task joins the session room
//! once connected, forwards call-taker messages out and caller events in, and
//! leaves the room when the subscription is cancelled or dropped.

use async_trait::async_trait;
use dispatchsim_protocol::{ClientMessage, ServerMessage};
use futures::{Sink, SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::{ChannelDriver, PushChannel, PushEvent, Subscription, TransportError};

/// WebSocket implementation of [`PushChannel`]
#[derive(Debug, Clone)]
pub struct WsPushChannel {
    url: String,
    auth_token: Option<String>,
}

impl WsPushChannel {
    /// `url` is the socket endpoint, e.g. `ws://localhost:5000/ws`.
    pub fn new(url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            url: url.into(),
            auth_token,
        }
    }

    fn connect_url(&self) -> String {
        match &self.auth_token {
            Some(token) => {
                let separator = if self.url.contains('?') { '&' } else { '?' };
                format!(
                    "{}{}token={}",
                    self.url,
                    separator,
                    urlencoding::encode(token)
                )
            }
            None => self.url.clone(),
        }
    }
}

#[async_trait]
impl PushChannel for WsPushChannel {
    async fn subscribe(&self, session_id: &str) -> Result<Subscription, TransportError> {
        let (subscription, driver) = Subscription::channel(session_id);
        tokio::spawn(run_socket(self.connect_url(), driver));
        Ok(subscription)
    }
}

async fn run_socket(url: String, driver: ChannelDriver) {
    let ChannelDriver {
        session_id,
        mut outbound,
        events,
        connected,
        mut shutdown,
    } = driver;

    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            warn!(
                component = "push_channel",
                event = "ws.connect.failed",
                session_id = %session_id,
                error = %e,
                "Push channel connection failed"
            );
            connected.send_replace(false);
            let _ = events
                .send(PushEvent::Error {
                    message: "Failed to connect to server".to_string(),
                })
                .await;
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = stream.split();
    connected.send_replace(true);
    info!(
        component = "push_channel",
        event = "ws.connected",
        session_id = %session_id,
        "Push channel connected"
    );

    let join = ClientMessage::JoinSession {
        session_id: session_id.clone(),
    };
    if send_json(&mut ws_tx, &join).await.is_err() {
        connected.send_replace(false);
        return;
    }

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                leave(&mut ws_tx, &session_id).await;
                break;
            }
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if send_json(&mut ws_tx, &msg).await.is_err() {
                        break;
                    }
                }
                None => {
                    leave(&mut ws_tx, &session_id).await;
                    break;
                }
            },
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = parse_event(&session_id, text.as_str()) {
                        if events.send(event).await.is_err() {
                            leave(&mut ws_tx, &session_id).await;
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(
                        component = "push_channel",
                        event = "ws.closed_by_peer",
                        session_id = %session_id,
                        "Push channel closed by service"
                    );
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!(
                        component = "push_channel",
                        event = "ws.error",
                        session_id = %session_id,
                        error = %e,
                        "Push channel error"
                    );
                    break;
                }
            },
        }
    }

    connected.send_replace(false);
    info!(
        component = "push_channel",
        event = "ws.disconnected",
        session_id = %session_id,
        "Push channel disconnected"
    );
}

/// Events for other rooms are ignored; untagged ones are accepted.
fn parse_event(session_id: &str, text: &str) -> Option<PushEvent> {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(ServerMessage::CallerResponse {
            session_id: target,
            reply,
        }) => {
            if target.as_deref().is_some_and(|t| t != session_id) {
                return None;
            }
            Some(PushEvent::Reply(reply))
        }
        Ok(ServerMessage::Error {
            message,
            session_id: target,
        }) => {
            if target.as_deref().is_some_and(|t| t != session_id) {
                return None;
            }
            Some(PushEvent::Error { message })
        }
        Err(e) => {
            warn!(
                component = "push_channel",
                event = "ws.message.parse_failed",
                session_id = %session_id,
                error = %e,
                payload_bytes = text.len(),
                "Failed to parse push message"
            );
            None
        }
    }
}

async fn send_json<S>(ws_tx: &mut S, msg: &ClientMessage) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            warn!(
                component = "push_channel",
                event = "ws.send.serialize_failed",
                error = %e,
                "Failed to serialize client message"
            );
            return Ok(());
        }
    };
    ws_tx.send(Message::Text(json.into())).await.map_err(|_| ())
}

async fn leave<S>(ws_tx: &mut S, session_id: &str)
where
    S: Sink<Message> + Unpin,
{
    let msg = ClientMessage::LeaveSession {
        session_id: session_id.to_string(),
    };
    let _ = send_json(ws_tx, &msg).await;
    let _ = ws_tx.close().await;
}
