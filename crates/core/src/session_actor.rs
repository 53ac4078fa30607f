//! Session actor: owns a `SessionState` and processes commands sequentially.
//!
//! Each open session runs as an independent tokio task. Callers communicate
//! via `SessionActorHandle`, which sends `SessionCommand` messages over an
//! mpsc channel. Lock-free reads go through `ArcSwap`; observers subscribe
//! to a broadcast stream of `SessionEvent`s.

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use dispatchsim_protocol::Session;
use dispatchsim_transport::DeliveryMode;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::session_command::SessionCommand;
use crate::store::SessionStore;
use crate::transcript::TurnPhase;
use crate::transition::{transition, Effect, Input, LifecyclePhase, SessionEvent, SessionState};

/// Read-only view of an open session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session: Session,
    pub phase: LifecyclePhase,
    pub turn: TurnPhase,
    pub mode: DeliveryMode,
    pub connected: bool,
}

impl SessionSnapshot {
    fn of(state: &SessionState) -> Self {
        Self {
            session: state.to_session(),
            phase: state.phase,
            turn: state.turns.phase(),
            mode: state.mode,
            connected: state.connected,
        }
    }

    pub fn is_caller_responding(&self) -> bool {
        matches!(self.turn, TurnPhase::Sending { .. })
    }
}

/// Handle to a running session actor (cheap to Clone).
#[derive(Clone)]
pub struct SessionActorHandle {
    pub id: String,
    command_tx: mpsc::Sender<SessionCommand>,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl SessionActorHandle {
    pub fn spawn(state: SessionState, store: SessionStore) -> SessionActorHandle {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (events_tx, _) = broadcast::channel(256);
        let snapshot = Arc::new(ArcSwap::from_pointee(SessionSnapshot::of(&state)));
        let id = state.id().to_string();

        tokio::spawn(actor_loop(
            state,
            command_rx,
            store,
            snapshot.clone(),
            events_tx.clone(),
        ));

        SessionActorHandle {
            id,
            command_tx,
            snapshot,
            events_tx,
        }
    }

    /// Send a command to the actor. Returns `false` if the actor is gone.
    pub async fn send(&self, cmd: SessionCommand) -> bool {
        if self.command_tx.send(cmd).await.is_err() {
            warn!(
                component = "session_actor",
                session_id = %self.id,
                "Actor channel closed, command dropped"
            );
            return false;
        }
        true
    }

    /// Apply an input and wait for the executed effects.
    pub async fn apply(&self, input: Input) -> Result<Vec<Effect>, SessionError> {
        let (tx, rx) = oneshot::channel();
        if !self
            .send(SessionCommand::Apply {
                input,
                reply: Some(tx),
            })
            .await
        {
            return Err(SessionError::Detached(self.id.clone()));
        }
        rx.await.map_err(|_| SessionError::Detached(self.id.clone()))
    }

    /// Apply an input without waiting. Returns `false` if the actor is gone.
    pub async fn notify(&self, input: Input) -> bool {
        self.send(SessionCommand::Apply { input, reply: None })
            .await
    }

    /// Stop the actor, returning its final record.
    pub async fn shutdown(&self) -> Option<Session> {
        let (tx, rx) = oneshot::channel();
        if !self.send(SessionCommand::Shutdown { reply: tx }).await {
            return None;
        }
        rx.await.ok()
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}

async fn actor_loop(
    mut state: SessionState,
    mut command_rx: mpsc::Receiver<SessionCommand>,
    store: SessionStore,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
    events_tx: broadcast::Sender<SessionEvent>,
) {
    while let Some(cmd) = command_rx.recv().await {
        match cmd {
            SessionCommand::Apply { input, reply } => {
                let previous = state.phase;
                let (next, effects) = transition(state, input, Utc::now());
                state = next;

                if state.phase != previous {
                    debug!(
                        component = "session_actor",
                        event = "session.phase_changed",
                        session_id = %state.id(),
                        from = previous.as_str(),
                        to = state.phase.as_str(),
                        "Session phase changed"
                    );
                }

                snapshot.store(Arc::new(SessionSnapshot::of(&state)));
                execute_effects(&state, &effects, &store, &events_tx).await;

                if let Some(reply) = reply {
                    let _ = reply.send(effects);
                }
            }
            SessionCommand::Shutdown { reply } => {
                let _ = reply.send(state.to_session());
                break;
            }
        }
    }

    debug!(
        component = "session_actor",
        event = "session.actor_stopped",
        session_id = %state.id(),
        "Session actor stopped"
    );
}

async fn execute_effects(
    state: &SessionState,
    effects: &[Effect],
    store: &SessionStore,
    events_tx: &broadcast::Sender<SessionEvent>,
) {
    for effect in effects {
        match effect {
            Effect::PersistActive => {
                if let Err(e) = store.upsert_active(&state.to_session()).await {
                    warn!(
                        component = "session_actor",
                        event = "session.persist_failed",
                        session_id = %state.id(),
                        error = %e,
                        "Failed to persist active session"
                    );
                }
            }
            Effect::Emit(event) => {
                // No subscribers is fine.
                let _ = events_tx.send(event.clone());
            }
            Effect::TurnAccepted { .. } | Effect::TurnRejected(_) | Effect::TerminateAccepted => {}
        }
    }
}
