//! Pure state transition function
//!
//! All lifecycle rules for an open session live here as a pure,
//! synchronous function: `transition(state, input, now) -> (state, effects)`.
//! No IO, no async, no locking. The session actor executes the effects.

use chrono::{DateTime, Utc};
use dispatchsim_protocol::{CallerReply, Session, SessionDescriptor, TranscriptEntry};
use dispatchsim_transport::DeliveryMode;

use crate::transcript::{TranscriptReconciler, TurnPhase, TurnRejection, TurnTicket};

// ---------------------------------------------------------------------------
// LifecyclePhase
// ---------------------------------------------------------------------------

/// `Idle -> Creating -> WaitingPickup -> Active -> Terminating -> Terminated`
///
/// `Idle` and `Creating` happen before the service assigns an identifier, so
/// an actor starts in `WaitingPickup` (new call) or `Active` (resumed call).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Idle,
    Creating,
    WaitingPickup,
    Active,
    Terminating,
    Terminated,
}

impl LifecyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecyclePhase::Idle => "idle",
            LifecyclePhase::Creating => "creating",
            LifecyclePhase::WaitingPickup => "waiting_pickup",
            LifecyclePhase::Active => "active",
            LifecyclePhase::Terminating => "terminating",
            LifecyclePhase::Terminated => "terminated",
        }
    }
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionState {
    /// Session metadata. Its transcript lives in `turns`.
    session: Session,
    pub turns: TranscriptReconciler,
    pub phase: LifecyclePhase,
    pub mode: DeliveryMode,
    pub connected: bool,
}

impl SessionState {
    pub fn new(mut session: Session, phase: LifecyclePhase, mode: DeliveryMode) -> Self {
        let transcript = std::mem::take(&mut session.transcript);
        Self {
            session,
            turns: TranscriptReconciler::new(transcript),
            phase,
            mode,
            // Request/response has no standing connection to lose.
            connected: mode == DeliveryMode::Polling,
        }
    }

    pub fn id(&self) -> &str {
        &self.session.session_id
    }

    /// The full session record, transcript included.
    pub fn to_session(&self) -> Session {
        let mut session = self.session.clone();
        session.transcript = self.turns.transcript().clone();
        session
    }
}

// ---------------------------------------------------------------------------
// Input / Effect
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Input {
    /// The trainee answered the ringing call.
    PickedUp { greeting: Option<String> },
    TurnSubmitted { text: String },
    ReplyReceived { ticket: TurnTicket, reply: CallerReply },
    TurnFailed { ticket: TurnTicket, reason: String },
    PushReply(CallerReply),
    PushError(String),
    ConnectionChanged(bool),
    RemoteSynced(SessionDescriptor),
    TerminateRequested,
    Terminated { at: DateTime<Utc> },
}

/// Observable changes broadcast to session subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    EntryAppended(TranscriptEntry),
    PhaseChanged(LifecyclePhase),
    Responding(bool),
    ConnectionChanged(bool),
    CallerStateChanged {
        emotional_state: String,
        scenario_progress: f64,
        key_details_revealed: Vec<String>,
    },
    ChannelError(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Write the current record to the active set.
    PersistActive,
    Emit(SessionEvent),
    TurnAccepted { ticket: TurnTicket, text: String },
    TurnRejected(TurnRejection),
    TerminateAccepted,
}

// ---------------------------------------------------------------------------
// transition
// ---------------------------------------------------------------------------

pub fn transition(
    mut state: SessionState,
    input: Input,
    now: DateTime<Utc>,
) -> (SessionState, Vec<Effect>) {
    let mut effects: Vec<Effect> = Vec::new();

    match input {
        Input::PickedUp { greeting } => {
            if state.phase != LifecyclePhase::WaitingPickup {
                return (state, effects);
            }
            state.phase = LifecyclePhase::Active;
            effects.push(Effect::Emit(SessionEvent::PhaseChanged(LifecyclePhase::Active)));

            if let Some(greeting) = greeting.filter(|g| !g.trim().is_empty()) {
                let entry = state.turns.append_caller_text(&greeting, now);
                effects.push(Effect::Emit(SessionEvent::EntryAppended(entry)));
            }
            effects.push(Effect::PersistActive);
        }

        Input::TurnSubmitted { text } => {
            if state.phase != LifecyclePhase::Active {
                effects.push(Effect::TurnRejected(TurnRejection::NotActive));
                return (state, effects);
            }
            match state.turns.begin_turn(&text, now) {
                Ok(pending) => {
                    effects.push(Effect::Emit(SessionEvent::EntryAppended(pending.entry)));
                    effects.push(Effect::Emit(SessionEvent::Responding(true)));
                    effects.push(Effect::PersistActive);
                    effects.push(Effect::TurnAccepted {
                        ticket: pending.ticket,
                        text: pending.text,
                    });
                }
                Err(rejection) => effects.push(Effect::TurnRejected(rejection)),
            }
        }

        Input::ReplyReceived { ticket, reply } => {
            if state.phase != LifecyclePhase::Active {
                return (state, effects);
            }
            if let Some(entry) = state.turns.confirm(ticket, &reply, now) {
                state.session.apply_reply(&reply);
                effects.push(Effect::Emit(SessionEvent::EntryAppended(entry)));
                effects.push(Effect::Emit(SessionEvent::Responding(false)));
                effects.push(caller_state(&state.session));
                effects.push(Effect::PersistActive);
            }
        }

        Input::TurnFailed { ticket, reason } => {
            if let Some(entry) = state.turns.fail(ticket, &reason, now) {
                effects.push(Effect::Emit(SessionEvent::EntryAppended(entry)));
                effects.push(Effect::Emit(SessionEvent::Responding(false)));
                if state.phase == LifecyclePhase::Active {
                    effects.push(Effect::PersistActive);
                }
            }
        }

        Input::PushReply(reply) => {
            if state.phase != LifecyclePhase::Active {
                return (state, effects);
            }
            let accepted = state.turns.accept_push(&reply, now);
            state.session.apply_reply(&reply);
            effects.push(Effect::Emit(SessionEvent::EntryAppended(accepted.entry)));
            if accepted.settled.is_some() {
                effects.push(Effect::Emit(SessionEvent::Responding(false)));
            }
            effects.push(caller_state(&state.session));
            effects.push(Effect::PersistActive);
        }

        Input::PushError(message) => match state.turns.abort_outstanding(&message, now) {
            Some((_, entry)) => {
                effects.push(Effect::Emit(SessionEvent::EntryAppended(entry)));
                effects.push(Effect::Emit(SessionEvent::Responding(false)));
                if state.phase == LifecyclePhase::Active {
                    effects.push(Effect::PersistActive);
                }
            }
            None => effects.push(Effect::Emit(SessionEvent::ChannelError(message))),
        },

        Input::ConnectionChanged(connected) => {
            if state.connected == connected {
                return (state, effects);
            }
            state.connected = connected;
            effects.push(Effect::Emit(SessionEvent::ConnectionChanged(connected)));

            if !connected {
                if let Some((_, entry)) =
                    state.turns.abort_outstanding("Connection to server lost", now)
                {
                    effects.push(Effect::Emit(SessionEvent::EntryAppended(entry)));
                    effects.push(Effect::Emit(SessionEvent::Responding(false)));
                    if state.phase == LifecyclePhase::Active {
                        effects.push(Effect::PersistActive);
                    }
                }
            }
        }

        Input::RemoteSynced(descriptor) => {
            if matches!(
                state.phase,
                LifecyclePhase::Terminating | LifecyclePhase::Terminated
            ) {
                return (state, effects);
            }
            if let Some(emotional_state) = descriptor.emotional_state {
                state.session.emotional_state = emotional_state;
            }
            if let Some(progress) = descriptor.scenario_progress {
                state.session.scenario_progress =
                    dispatchsim_protocol::normalize_progress(progress);
            }
            state.session.merge_details(&descriptor.key_details_revealed);
            effects.push(caller_state(&state.session));
            effects.push(Effect::PersistActive);
        }

        Input::TerminateRequested => {
            if !matches!(
                state.phase,
                LifecyclePhase::WaitingPickup | LifecyclePhase::Active
            ) {
                return (state, effects);
            }
            state.phase = LifecyclePhase::Terminating;
            if let Some((_, entry)) = state
                .turns
                .abort_outstanding("Call ended before the caller replied", now)
            {
                effects.push(Effect::Emit(SessionEvent::EntryAppended(entry)));
                effects.push(Effect::Emit(SessionEvent::Responding(false)));
            }
            effects.push(Effect::Emit(SessionEvent::PhaseChanged(
                LifecyclePhase::Terminating,
            )));
            effects.push(Effect::TerminateAccepted);
        }

        Input::Terminated { at } => {
            if state.phase != LifecyclePhase::Terminating {
                return (state, effects);
            }
            state.phase = LifecyclePhase::Terminated;
            state.session.complete(at);
            effects.push(Effect::Emit(SessionEvent::PhaseChanged(
                LifecyclePhase::Terminated,
            )));
        }
    }

    (state, effects)
}

fn caller_state(session: &Session) -> Effect {
    Effect::Emit(SessionEvent::CallerStateChanged {
        emotional_state: session.emotional_state.clone(),
        scenario_progress: session.scenario_progress,
        key_details_revealed: session.key_details_revealed.clone(),
    })
}

/// Whether the turn machine has an outstanding send.
pub fn is_sending(state: &SessionState) -> bool {
    matches!(state.turns.phase(), TurnPhase::Sending { .. })
}
