//! Session lifecycle controller
//!
//! Orchestrates creation, turns, termination and retry of calls. It sits
//! between the transport and the local store and owns one actor per open
//! session. Transport failures on create and fetch propagate; turn failures
//! become system entries; termination failures are logged and the call is
//! finalized anyway.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dispatchsim_protocol::{Session, TranscriptEntry};
use dispatchsim_transport::{
    Delivery, DeliveryMode, PushEvent, PushSender, SimulationApi, Subscription, TransportError,
};
use tokio::sync::{broadcast, mpsc, watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::scenarios::ScenarioCatalog;
use crate::session_actor::{SessionActorHandle, SessionSnapshot};
use crate::store::SessionStore;
use crate::transcript::{TurnRejection, TurnTicket};
use crate::transition::{Effect, Input, LifecyclePhase, SessionEvent, SessionState};

/// Opaque trainee identity supplied by the surrounding application
#[derive(Debug, Clone)]
pub struct Identity {
    pub trainee_id: String,
    pub auth_token: Option<String>,
}

impl Identity {
    pub fn new(trainee_id: impl Into<String>) -> Self {
        Self {
            trainee_id: trainee_id.into(),
            auth_token: None,
        }
    }
}

/// Scenario parameters for a new call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioSelection {
    pub code: String,
    pub subtype: Option<String>,
}

impl ScenarioSelection {
    pub fn new(code: impl Into<String>, subtype: Option<String>) -> Self {
        Self {
            code: code.into(),
            subtype,
        }
    }

    fn of(session: &Session) -> Self {
        Self::new(session.scenario_code.clone(), session.scenario_subtype.clone())
    }
}

/// How a send completed
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Request/response: the caller's reply entry.
    Replied(TranscriptEntry),
    /// Push: the utterance is on the channel; the reply arrives as an event.
    Pending { ticket: TurnTicket },
    /// Delivery failed; a system entry was appended and the call stays active.
    Failed { reason: String },
    /// The session was detached before the reply arrived; nothing was applied.
    Discarded,
}

struct PushLink {
    sender: PushSender,
    _subscription: Subscription,
    forwarder: JoinHandle<()>,
}

impl Drop for PushLink {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

struct OpenSession {
    actor: SessionActorHandle,
    push: Option<PushLink>,
    greeting: Option<String>,
}

pub struct SessionController {
    identity: Identity,
    api: Arc<dyn SimulationApi>,
    delivery: Delivery,
    store: SessionStore,
    catalog: Option<Arc<ScenarioCatalog>>,
    sessions: DashMap<String, OpenSession>,
    loads: DashMap<String, Arc<OnceCell<()>>>,
}

impl SessionController {
    pub fn new(
        identity: Identity,
        api: Arc<dyn SimulationApi>,
        delivery: Delivery,
        store: SessionStore,
    ) -> Self {
        Self {
            identity,
            api,
            delivery,
            store,
            catalog: None,
            sessions: DashMap::new(),
            loads: DashMap::new(),
        }
    }

    /// Validate selections against `catalog` before creating sessions.
    pub fn with_catalog(mut self, catalog: Arc<ScenarioCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn mode(&self) -> DeliveryMode {
        self.delivery.mode()
    }

    /// Create a remote session and register it locally, ringing.
    ///
    /// All-or-nothing: if the service refuses, nothing is stored.
    pub async fn create(&self, selection: &ScenarioSelection) -> Result<String, SessionError> {
        let code = selection.code.trim();
        if code.is_empty() {
            return Err(SessionError::Validation(
                "Select a scenario before starting a call".to_string(),
            ));
        }
        let subtype = selection
            .subtype
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if let Some(catalog) = &self.catalog {
            catalog.resolve(code, subtype)?;
        }

        info!(
            component = "controller",
            event = "session.creating",
            scenario = %code,
            subtype = subtype.unwrap_or(""),
            phase = LifecyclePhase::Creating.as_str(),
            "Creating session"
        );

        let descriptor = self
            .api
            .create_remote_session(&self.identity.trainee_id, code, subtype)
            .await?;

        let session = Session::new(
            descriptor.session_id.clone(),
            self.identity.trainee_id.clone(),
            code,
            subtype.map(str::to_string),
            descriptor.started_at().unwrap_or_else(Utc::now),
        );

        if let Err(e) = self.store.upsert_active(&session).await {
            self.end_remote(&session.session_id).await;
            return Err(e.into());
        }

        let session_id = session.session_id.clone();
        if let Err(e) = self
            .open(session, LifecyclePhase::WaitingPickup, descriptor.initial_caller_message)
            .await
        {
            self.end_remote(&session_id).await;
            self.store
                .remove_active(&self.identity.trainee_id, &session_id)
                .await?;
            return Err(e);
        }

        info!(
            component = "controller",
            event = "session.created",
            session_id = %session_id,
            "Session created, waiting for pickup"
        );
        Ok(session_id)
    }

    /// Pick up a ringing call. The service greeting, if any, becomes the first
    /// caller entry.
    pub async fn answer(&self, session_id: &str) -> Result<Arc<SessionSnapshot>, SessionError> {
        let (actor, greeting) = {
            let mut open = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
            (open.actor.clone(), open.greeting.take())
        };

        actor.apply(Input::PickedUp { greeting }).await?;
        let snapshot = actor.snapshot();
        if snapshot.phase != LifecyclePhase::Active {
            return Err(SessionError::NotActive(session_id.to_string()));
        }
        Ok(snapshot)
    }

    /// Open a session that already exists remotely.
    ///
    /// Remote state is fetched once per identifier; concurrent callers wait on
    /// the same load.
    pub async fn load_existing(
        &self,
        session_id: &str,
    ) -> Result<Arc<SessionSnapshot>, SessionError> {
        let cell = self
            .loads
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        cell.get_or_try_init(|| self.load_once(session_id)).await?;

        self.snapshot(session_id)
            .ok_or_else(|| SessionError::Detached(session_id.to_string()))
    }

    async fn load_once(&self, session_id: &str) -> Result<(), SessionError> {
        if self.sessions.contains_key(session_id) {
            return Ok(());
        }

        let user = self.identity.trainee_id.clone();
        let local = self.store.get_active(&user, session_id).await?;
        let remote = match self.api.fetch_remote_session(session_id).await {
            Ok(remote) => remote,
            Err(TransportError::NotFound { .. }) => {
                return Err(SessionError::NotFound(session_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        if remote.is_active == Some(false) {
            if let Some(mut session) = local {
                session.complete(Utc::now());
                self.store.finalize(&session).await?;
            }
            return Err(SessionError::NotActive(session_id.to_string()));
        }

        let session = local.unwrap_or_else(|| {
            Session::new(
                session_id,
                user,
                remote.scenario_type.clone(),
                remote.selected_subtype.clone(),
                remote.started_at().unwrap_or_else(Utc::now),
            )
        });

        let actor = self.open(session, LifecyclePhase::Active, None).await?;
        actor.apply(Input::RemoteSynced(remote)).await?;

        info!(
            component = "controller",
            event = "session.loaded",
            session_id = %session_id,
            "Loaded existing session"
        );
        Ok(())
    }

    /// Send one call-taker utterance.
    ///
    /// Empty text and sends while another is outstanding are rejected before
    /// any transport call.
    pub async fn send_turn(&self, session_id: &str, text: &str) -> Result<TurnOutcome, SessionError> {
        let (actor, push) = {
            let open = self
                .sessions
                .get(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
            (
                open.actor.clone(),
                open.push.as_ref().map(|p| p.sender.clone()),
            )
        };

        let effects = actor
            .apply(Input::TurnSubmitted {
                text: text.to_string(),
            })
            .await?;
        let (ticket, text) = accepted_turn(session_id, effects)?;

        let delivered = match push {
            None => self.api.send_utterance(session_id, &text).await,
            Some(sender) => match sender.send_utterance(&text).await {
                Ok(()) => {
                    debug!(
                        component = "controller",
                        event = "turn.pushed",
                        session_id = %session_id,
                        ticket = ticket,
                        "Utterance sent on push channel"
                    );
                    return Ok(TurnOutcome::Pending { ticket });
                }
                Err(e) => Err(e),
            },
        };

        let input = match delivered {
            Ok(reply) => Input::ReplyReceived { ticket, reply },
            Err(e) => {
                warn!(
                    component = "controller",
                    event = "turn.failed",
                    session_id = %session_id,
                    ticket = ticket,
                    error = %e,
                    "Failed to deliver utterance"
                );
                Input::TurnFailed {
                    ticket,
                    reason: e.to_string(),
                }
            }
        };
        let failure = match &input {
            Input::TurnFailed { reason, .. } => Some(reason.clone()),
            _ => None,
        };

        let effects = match actor.apply(input).await {
            Ok(effects) => effects,
            Err(SessionError::Detached(_)) => {
                debug!(
                    component = "controller",
                    event = "turn.discarded",
                    session_id = %session_id,
                    ticket = ticket,
                    "Session detached before the turn completed"
                );
                return Ok(TurnOutcome::Discarded);
            }
            Err(e) => return Err(e),
        };

        if let Some(reason) = failure {
            return Ok(TurnOutcome::Failed { reason });
        }
        effects
            .into_iter()
            .find_map(|effect| match effect {
                Effect::Emit(SessionEvent::EntryAppended(entry)) => Some(entry),
                _ => None,
            })
            .map(TurnOutcome::Replied)
            .ok_or_else(|| SessionError::NotActive(session_id.to_string()))
    }

    /// Hang up: best-effort remote end, then move the session to history.
    pub async fn terminate(&self, session_id: &str) -> Result<Session, SessionError> {
        let actor = self.sessions.get(session_id).map(|open| open.actor.clone());

        let session = match actor {
            Some(actor) => {
                let effects = actor.apply(Input::TerminateRequested).await?;
                if !effects.contains(&Effect::TerminateAccepted) {
                    return Err(SessionError::NotActive(session_id.to_string()));
                }
                self.end_remote(session_id).await;
                actor.apply(Input::Terminated { at: Utc::now() }).await?;
                actor.snapshot().session.clone()
            }
            None => {
                let mut session = self
                    .store
                    .get_active(&self.identity.trainee_id, session_id)
                    .await?
                    .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
                self.end_remote(session_id).await;
                session.complete(Utc::now());
                session
            }
        };

        self.store.finalize(&session).await?;
        self.close(session_id).await;

        info!(
            component = "controller",
            event = "session.terminated",
            session_id = %session_id,
            entries = session.transcript.len(),
            "Session moved to history"
        );
        Ok(session)
    }

    /// Place a brand-new call with the same scenario.
    ///
    /// The old session is finalized into history when it has any transcript,
    /// otherwise discarded.
    pub async fn retry(&self, session_id: &str) -> Result<String, SessionError> {
        let previous = match self.snapshot(session_id) {
            Some(snapshot) => snapshot.session.clone(),
            None => self
                .store
                .get_active(&self.identity.trainee_id, session_id)
                .await?
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?,
        };
        let selection = ScenarioSelection::of(&previous);

        if previous.transcript.is_empty() {
            self.discard(session_id).await?;
        } else {
            match self.terminate(session_id).await {
                Ok(_) | Err(SessionError::NotActive(_)) => {}
                Err(e) => return Err(e),
            }
        }

        info!(
            component = "controller",
            event = "session.retry",
            previous_session_id = %session_id,
            scenario = %selection.code,
            "Retrying call"
        );
        self.create(&selection).await
    }

    /// Tear down the live view. The active record stays in the store so the
    /// call can be resumed.
    pub async fn detach(&self, session_id: &str) -> Option<Session> {
        let session = self.close(session_id).await;
        if session.is_some() {
            info!(
                component = "controller",
                event = "session.detached",
                session_id = %session_id,
                "Session detached"
            );
        }
        session
    }

    pub fn snapshot(&self, session_id: &str) -> Option<Arc<SessionSnapshot>> {
        self.sessions
            .get(session_id)
            .map(|open| open.actor.snapshot())
    }

    pub fn events(&self, session_id: &str) -> Option<broadcast::Receiver<SessionEvent>> {
        self.sessions
            .get(session_id)
            .map(|open| open.actor.subscribe())
    }

    pub fn open_sessions(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    // -- internals ----------------------------------------------------------

    async fn open(
        &self,
        session: Session,
        phase: LifecyclePhase,
        greeting: Option<String>,
    ) -> Result<SessionActorHandle, SessionError> {
        let state = SessionState::new(session, phase, self.delivery.mode());
        let actor = SessionActorHandle::spawn(state, self.store.clone());
        let push = match self.attach_push(&actor).await {
            Ok(push) => push,
            Err(e) => {
                actor.shutdown().await;
                return Err(e);
            }
        };

        self.sessions.insert(
            actor.id.clone(),
            OpenSession {
                actor: actor.clone(),
                push,
                greeting,
            },
        );
        Ok(actor)
    }

    async fn attach_push(
        &self,
        actor: &SessionActorHandle,
    ) -> Result<Option<PushLink>, SessionError> {
        let Delivery::Streaming(channel) = &self.delivery else {
            return Ok(None);
        };

        let mut subscription = channel.subscribe(&actor.id).await?;
        let events = subscription.take_events();
        let connection = subscription.connection();
        let forwarder = tokio::spawn(forward_push(actor.clone(), events, connection));

        Ok(Some(PushLink {
            sender: subscription.sender(),
            _subscription: subscription,
            forwarder,
        }))
    }

    async fn end_remote(&self, session_id: &str) {
        if let Err(e) = self.api.terminate_remote_session(session_id).await {
            warn!(
                component = "controller",
                event = "session.remote_end_failed",
                session_id = %session_id,
                error = %e,
                "Remote termination failed, finalizing locally"
            );
        }
    }

    async fn discard(&self, session_id: &str) -> Result<(), SessionError> {
        self.end_remote(session_id).await;
        self.close(session_id).await;
        self.store
            .remove_active(&self.identity.trainee_id, session_id)
            .await?;
        debug!(
            component = "controller",
            event = "session.discarded",
            session_id = %session_id,
            "Discarded session without transcript"
        );
        Ok(())
    }

    /// Release the push channel and stop the actor.
    async fn close(&self, session_id: &str) -> Option<Session> {
        self.loads.remove(session_id);
        let (_, open) = self.sessions.remove(session_id)?;
        let OpenSession { actor, push, .. } = open;
        drop(push);
        actor.shutdown().await
    }
}

fn accepted_turn(
    session_id: &str,
    effects: Vec<Effect>,
) -> Result<(TurnTicket, String), SessionError> {
    for effect in effects {
        match effect {
            Effect::TurnAccepted { ticket, text } => return Ok((ticket, text)),
            Effect::TurnRejected(TurnRejection::Empty) => {
                return Err(SessionError::Validation(
                    "Message cannot be empty".to_string(),
                ))
            }
            Effect::TurnRejected(TurnRejection::InFlight) => {
                return Err(SessionError::TurnInFlight(session_id.to_string()))
            }
            Effect::TurnRejected(TurnRejection::NotActive) => {
                return Err(SessionError::NotActive(session_id.to_string()))
            }
            _ => {}
        }
    }
    Err(SessionError::NotActive(session_id.to_string()))
}

/// Feed push events and connection changes into the session actor.
///
/// Events already queued are applied before a connection change, so a reply
/// that arrived just before a drop settles its turn instead of being failed.
async fn forward_push(
    actor: SessionActorHandle,
    events: Option<mpsc::Receiver<PushEvent>>,
    mut connection: watch::Receiver<bool>,
) {
    let Some(mut events) = events else {
        return;
    };
    let mut watching = true;

    loop {
        tokio::select! {
            biased;

            event = events.recv() => {
                let Some(event) = event else {
                    // Channel task ended; make sure the final state is seen.
                    let connected = *connection.borrow();
                    actor.notify(Input::ConnectionChanged(connected)).await;
                    break;
                };
                if !actor.notify(push_input(event)).await {
                    break;
                }
            }
            changed = connection.changed(), if watching => match changed {
                Ok(()) => {
                    let connected = *connection.borrow_and_update();
                    while let Ok(event) = events.try_recv() {
                        if !actor.notify(push_input(event)).await {
                            return;
                        }
                    }
                    if !actor.notify(Input::ConnectionChanged(connected)).await {
                        break;
                    }
                }
                Err(_) => watching = false,
            },
        }
    }
}

fn push_input(event: PushEvent) -> Input {
    match event {
        PushEvent::Reply(reply) => Input::PushReply(reply),
        PushEvent::Error { message } => Input::PushError(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use dispatchsim_protocol::rest::HealthStatus;
    use dispatchsim_protocol::{
        CallerReply, ClientMessage, SessionDescriptor, SessionStatus, SpeakerRole, TerminationAck,
    };
    use dispatchsim_transport::{ChannelDriver, PushChannel};
    use tokio::sync::Notify;

    fn location_reply() -> CallerReply {
        CallerReply {
            caller_response: "123 Main St".to_string(),
            emotional_state: "anxious".to_string(),
            intensity: 0.6,
            scenario_progress: 0.2,
            key_details_revealed: vec!["location".to_string()],
        }
    }

    #[derive(Default)]
    struct MockApi {
        created: AtomicUsize,
        sends: AtomicUsize,
        ends: AtomicUsize,
        fetches: AtomicUsize,
        greeting: Option<String>,
        fail_create: bool,
        end_status: Option<u16>,
        send_results: Mutex<VecDeque<Result<CallerReply, TransportError>>>,
        send_gate: Option<Arc<Notify>>,
        fetch_gate: Option<Arc<Notify>>,
        fetch_result: Mutex<Option<Result<SessionDescriptor, TransportError>>>,
    }

    impl MockApi {
        fn queue_send(&self, result: Result<CallerReply, TransportError>) {
            self.send_results.lock().unwrap().push_back(result);
        }
    }

    #[async_trait]
    impl SimulationApi for MockApi {
        async fn create_remote_session(
            &self,
            _trainee_id: &str,
            scenario_code: &str,
            subtype: Option<&str>,
        ) -> Result<SessionDescriptor, TransportError> {
            if self.fail_create {
                return Err(TransportError::Status {
                    status: 500,
                    message: "Internal server error".to_string(),
                });
            }
            let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(SessionDescriptor {
                session_id: format!("sess-{n}"),
                scenario_type: scenario_code.to_string(),
                selected_subtype: subtype.map(str::to_string),
                status: Some("created".to_string()),
                initial_caller_message: self.greeting.clone(),
                ..Default::default()
            })
        }

        async fn send_utterance(
            &self,
            _session_id: &str,
            _text: &str,
        ) -> Result<CallerReply, TransportError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.send_gate {
                gate.notified().await;
            }
            let queued = self.send_results.lock().unwrap().pop_front();
            queued.unwrap_or_else(|| Ok(location_reply()))
        }

        async fn terminate_remote_session(
            &self,
            _session_id: &str,
        ) -> Result<TerminationAck, TransportError> {
            self.ends.fetch_add(1, Ordering::SeqCst);
            match self.end_status {
                Some(status) => Err(TransportError::Status {
                    status,
                    message: "Internal server error".to_string(),
                }),
                None => Ok(TerminationAck {
                    status: "terminated".to_string(),
                }),
            }
        }

        async fn fetch_remote_session(
            &self,
            session_id: &str,
        ) -> Result<SessionDescriptor, TransportError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.fetch_gate {
                gate.notified().await;
            }
            let result = self.fetch_result.lock().unwrap().take();
            result.unwrap_or_else(|| {
                Ok(SessionDescriptor {
                    session_id: session_id.to_string(),
                    scenario_type: "10-11".to_string(),
                    emotional_state: Some("distressed".to_string()),
                    scenario_progress: Some(0.4),
                    is_active: Some(true),
                    key_details_revealed: vec!["weapon".to_string()],
                    ..Default::default()
                })
            })
        }

        async fn health(&self) -> Result<HealthStatus, TransportError> {
            Ok(HealthStatus {
                status: "healthy".to_string(),
                timestamp: None,
                active_sessions: None,
            })
        }
    }

    #[derive(Default)]
    struct FakePush {
        drivers: Mutex<Vec<ChannelDriver>>,
    }

    impl FakePush {
        fn take_driver(&self) -> ChannelDriver {
            self.drivers.lock().unwrap().pop().expect("subscribed")
        }
    }

    #[async_trait]
    impl PushChannel for FakePush {
        async fn subscribe(&self, session_id: &str) -> Result<Subscription, TransportError> {
            let (subscription, driver) = Subscription::channel(session_id);
            self.drivers.lock().unwrap().push(driver);
            Ok(subscription)
        }
    }

    fn controller(api: Arc<MockApi>) -> SessionController {
        let store = SessionStore::open_in_memory().unwrap();
        SessionController::new(Identity::new("trainee-1"), api, Delivery::Polling, store)
    }

    fn domestic() -> ScenarioSelection {
        ScenarioSelection::new("10-11", Some("Domestic".to_string()))
    }

    async fn answered_call(controller: &SessionController) -> String {
        let id = controller.create(&domestic()).await.unwrap();
        controller.answer(&id).await.unwrap();
        id
    }

    async fn wait_for_sends(api: &MockApi, n: usize) {
        while api.sends.load(Ordering::SeqCst) < n {
            tokio::task::yield_now().await;
        }
    }

    async fn next_caller_entry(events: &mut broadcast::Receiver<SessionEvent>) -> TranscriptEntry {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let SessionEvent::EntryAppended(entry) = events.recv().await.unwrap() {
                    if entry.role != SpeakerRole::CallTaker {
                        return entry;
                    }
                }
            }
        })
        .await
        .expect("entry in time")
    }

    #[tokio::test]
    async fn domestic_call_round_trip() {
        let api = Arc::new(MockApi::default());
        let controller = controller(api.clone())
            .with_catalog(Arc::new(ScenarioCatalog::embedded().unwrap()));

        let id = controller.create(&domestic()).await.unwrap();
        assert_eq!(
            controller.snapshot(&id).unwrap().phase,
            LifecyclePhase::WaitingPickup
        );
        let stored = controller
            .store()
            .get_active("trainee-1", &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, SessionStatus::Active);
        assert!(stored.transcript.is_empty());

        controller.answer(&id).await.unwrap();
        let outcome = controller
            .send_turn(&id, "What's your location?")
            .await
            .unwrap();
        match outcome {
            TurnOutcome::Replied(entry) => assert_eq!(entry.content, "123 Main St"),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let snap = controller.snapshot(&id).unwrap();
        assert_eq!(snap.session.transcript.len(), 2);
        assert_eq!(snap.session.scenario_progress, 0.2);
        assert_eq!(snap.session.emotional_state, "anxious");
        assert!(!snap.is_caller_responding());

        let stored = controller
            .store()
            .get_active("trainee-1", &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.transcript.len(), 2);
    }

    #[tokio::test]
    async fn blank_text_never_reaches_transport() {
        let api = Arc::new(MockApi::default());
        let controller = controller(api.clone());
        let id = answered_call(&controller).await;

        let err = controller.send_turn(&id, "  \t ").await.unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
        assert_eq!(api.sends.load(Ordering::SeqCst), 0);
        assert!(controller.snapshot(&id).unwrap().session.transcript.is_empty());
    }

    #[tokio::test]
    async fn second_send_while_outstanding_is_rejected() {
        let gate = Arc::new(Notify::new());
        let api = Arc::new(MockApi {
            send_gate: Some(gate.clone()),
            ..Default::default()
        });
        let controller = controller(api.clone());
        let id = answered_call(&controller).await;

        let first = controller.send_turn(&id, "What's your location?");
        let second = async {
            wait_for_sends(&api, 1).await;
            assert!(controller.snapshot(&id).unwrap().is_caller_responding());
            let result = controller.send_turn(&id, "Hello?").await;
            gate.notify_one();
            result
        };
        let (first, second) = tokio::join!(first, second);

        assert!(matches!(first.unwrap(), TurnOutcome::Replied(_)));
        assert!(matches!(second.unwrap_err(), SessionError::TurnInFlight(_)));
        assert_eq!(api.sends.load(Ordering::SeqCst), 1);
        assert_eq!(controller.snapshot(&id).unwrap().session.transcript.len(), 2);
    }

    #[tokio::test]
    async fn failed_send_is_recoverable() {
        let api = Arc::new(MockApi::default());
        api.queue_send(Err(TransportError::Connection(
            "connection refused".to_string(),
        )));
        let controller = controller(api.clone());
        let id = answered_call(&controller).await;

        let outcome = controller.send_turn(&id, "Where are you?").await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Failed { .. }));
        let snap = controller.snapshot(&id).unwrap();
        assert_eq!(snap.phase, LifecyclePhase::Active);
        assert_eq!(snap.session.transcript.count_role(SpeakerRole::System), 1);

        let outcome = controller.send_turn(&id, "Where are you?").await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Replied(_)));

        let roles: Vec<_> = controller
            .snapshot(&id)
            .unwrap()
            .session
            .transcript
            .iter()
            .map(|e| e.role)
            .collect();
        assert_eq!(
            roles,
            vec![
                SpeakerRole::CallTaker,
                SpeakerRole::System,
                SpeakerRole::CallTaker,
                SpeakerRole::Caller,
            ]
        );
    }

    #[tokio::test]
    async fn turns_alternate_in_submission_order() {
        let api = Arc::new(MockApi::default());
        let controller = controller(api.clone());
        let id = answered_call(&controller).await;

        for text in ["one", "two", "three"] {
            controller.send_turn(&id, text).await.unwrap();
        }

        let transcript = controller.snapshot(&id).unwrap().session.transcript.clone();
        assert_eq!(transcript.len(), 6);
        for (i, pair) in transcript.entries().chunks(2).enumerate() {
            assert_eq!(pair[0].role, SpeakerRole::CallTaker);
            assert_eq!(pair[0].content, ["one", "two", "three"][i]);
            assert_eq!(pair[1].role, SpeakerRole::Caller);
        }
    }

    #[tokio::test]
    async fn terminate_finalizes_even_when_remote_end_fails() {
        let api = Arc::new(MockApi {
            end_status: Some(500),
            ..Default::default()
        });
        let controller = controller(api.clone());
        let id = answered_call(&controller).await;
        controller.send_turn(&id, "What's your location?").await.unwrap();

        let session = controller.terminate(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.end_time.is_some());
        assert_eq!(api.ends.load(Ordering::SeqCst), 1);

        let store = controller.store();
        assert!(store.list_active("trainee-1").await.unwrap().is_empty());
        let history = store.list_history("trainee-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].session_id, id);
        assert_eq!(history[0].status, SessionStatus::Completed);
        assert_eq!(history[0].transcript.len(), 2);
        assert!(controller.snapshot(&id).is_none());
    }

    #[tokio::test]
    async fn terminate_works_for_stored_session_that_is_not_open() {
        let api = Arc::new(MockApi::default());
        let controller = controller(api.clone());
        let id = answered_call(&controller).await;
        controller.detach(&id).await.unwrap();

        controller.terminate(&id).await.unwrap();
        assert_eq!(
            controller.store().list_history("trainee-1").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn create_failure_stores_nothing() {
        let api = Arc::new(MockApi {
            fail_create: true,
            ..Default::default()
        });
        let controller = controller(api.clone());

        let err = controller.create(&domestic()).await.unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert!(controller
            .store()
            .list_active("trainee-1")
            .await
            .unwrap()
            .is_empty());
        assert!(controller.open_sessions().is_empty());
    }

    #[tokio::test]
    async fn unknown_scenario_is_a_validation_error() {
        let api = Arc::new(MockApi::default());
        let controller = controller(api.clone())
            .with_catalog(Arc::new(ScenarioCatalog::embedded().unwrap()));

        let err = controller
            .create(&ScenarioSelection::new("99-99", None))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
        let err = controller
            .create(&ScenarioSelection::new("  ", None))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
        assert_eq!(api.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn greeting_becomes_first_caller_entry() {
        let api = Arc::new(MockApi {
            greeting: Some("911? My neighbor is screaming!".to_string()),
            ..Default::default()
        });
        let controller = controller(api.clone());
        let id = controller.create(&domestic()).await.unwrap();

        let snap = controller.answer(&id).await.unwrap();
        let first = &snap.session.transcript.entries()[0];
        assert_eq!(first.role, SpeakerRole::Caller);
        assert_eq!(first.content, "911? My neighbor is screaming!");
    }

    #[tokio::test]
    async fn concurrent_loads_fetch_once() {
        let gate = Arc::new(Notify::new());
        let api = Arc::new(MockApi {
            fetch_gate: Some(gate.clone()),
            ..Default::default()
        });
        let controller = controller(api.clone());

        let release = async {
            while api.fetches.load(Ordering::SeqCst) < 1 {
                tokio::task::yield_now().await;
            }
            for _ in 0..5 {
                tokio::task::yield_now().await;
            }
            gate.notify_one();
        };
        let (a, b, _) = tokio::join!(
            controller.load_existing("remote-1"),
            controller.load_existing("remote-1"),
            release
        );

        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.session.session_id, "remote-1");
        assert_eq!(b.phase, LifecyclePhase::Active);
        assert_eq!(a.session.emotional_state, "distressed");
        assert_eq!(a.session.key_details_revealed, vec!["weapon"]);

        controller.load_existing("remote-1").await.unwrap();
        assert_eq!(api.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn loading_unknown_session_is_not_found() {
        let api = Arc::new(MockApi::default());
        *api.fetch_result.lock().unwrap() = Some(Err(TransportError::NotFound {
            session_id: "ghost".to_string(),
        }));
        let controller = controller(api.clone());

        let err = controller.load_existing("ghost").await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
        assert!(controller.snapshot("ghost").is_none());
    }

    #[tokio::test]
    async fn retry_discards_empty_call_and_keeps_used_one() {
        let api = Arc::new(MockApi::default());
        let controller = controller(api.clone());

        let first = answered_call(&controller).await;
        let second = controller.retry(&first).await.unwrap();
        assert_ne!(first, second);
        assert!(controller
            .store()
            .list_history("trainee-1")
            .await
            .unwrap()
            .is_empty());

        controller.answer(&second).await.unwrap();
        controller.send_turn(&second, "Hello?").await.unwrap();
        let third = controller.retry(&second).await.unwrap();

        let store = controller.store();
        let history = store.list_history("trainee-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].session_id, second);
        let active = store.list_active("trainee-1").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, third);
        assert_eq!(active[0].scenario_subtype.as_deref(), Some("Domestic"));
    }

    #[tokio::test]
    async fn reply_after_detach_is_discarded() {
        let gate = Arc::new(Notify::new());
        let api = Arc::new(MockApi {
            send_gate: Some(gate.clone()),
            ..Default::default()
        });
        let controller = controller(api.clone());
        let id = answered_call(&controller).await;

        let send = controller.send_turn(&id, "What's your location?");
        let teardown = async {
            wait_for_sends(&api, 1).await;
            let detached = controller.detach(&id).await;
            gate.notify_one();
            detached
        };
        let (outcome, detached) = tokio::join!(send, teardown);

        assert_eq!(outcome.unwrap(), TurnOutcome::Discarded);
        assert_eq!(detached.unwrap().transcript.len(), 1);
        let stored = controller
            .store()
            .get_active("trainee-1", &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.transcript.len(), 1);
    }

    #[tokio::test]
    async fn streaming_reply_arrives_as_push_event() {
        let api = Arc::new(MockApi::default());
        let push = Arc::new(FakePush::default());
        let store = SessionStore::open_in_memory().unwrap();
        let controller = SessionController::new(
            Identity::new("trainee-1"),
            api.clone(),
            Delivery::Streaming(push.clone()),
            store,
        );

        let id = answered_call(&controller).await;
        let mut driver = push.take_driver();
        let mut events = controller.events(&id).unwrap();
        driver.connected.send_replace(true);

        let outcome = controller.send_turn(&id, "What's your location?").await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Pending { .. }));
        assert_eq!(api.sends.load(Ordering::SeqCst), 0);
        assert_eq!(
            driver.outbound.recv().await.unwrap(),
            ClientMessage::CallTakerMessage {
                session_id: id.clone(),
                message: "What's your location?".to_string(),
            }
        );

        driver
            .events
            .send(PushEvent::Reply(location_reply()))
            .await
            .unwrap();
        let entry = next_caller_entry(&mut events).await;
        assert_eq!(entry.content, "123 Main St");

        let snap = controller.snapshot(&id).unwrap();
        assert_eq!(snap.session.transcript.len(), 2);
        assert_eq!(snap.session.emotional_state, "anxious");
        assert!(!snap.is_caller_responding());
    }

    #[tokio::test]
    async fn streaming_disconnect_fails_outstanding_send() {
        let api = Arc::new(MockApi::default());
        let push = Arc::new(FakePush::default());
        let controller = SessionController::new(
            Identity::new("trainee-1"),
            api.clone(),
            Delivery::Streaming(push.clone()),
            SessionStore::open_in_memory().unwrap(),
        );

        let id = answered_call(&controller).await;
        let driver = push.take_driver();
        let mut events = controller.events(&id).unwrap();

        // Not connected yet: the send fails immediately and is recorded.
        let outcome = controller.send_turn(&id, "Hello?").await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Failed { .. }));
        let entry = next_caller_entry(&mut events).await;
        assert_eq!(entry.role, SpeakerRole::System);

        driver.connected.send_replace(true);
        while !controller.snapshot(&id).unwrap().connected {
            tokio::task::yield_now().await;
        }
        let outcome = controller.send_turn(&id, "Hello again?").await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Pending { .. }));

        driver.connected.send_replace(false);
        let entry = next_caller_entry(&mut events).await;
        assert_eq!(entry.role, SpeakerRole::System);
        assert!(entry.content.contains("Connection to server lost"));

        let snap = controller.snapshot(&id).unwrap();
        assert!(!snap.is_caller_responding());
        assert!(!snap.connected);
        assert_eq!(snap.phase, LifecyclePhase::Active);
    }

    #[tokio::test]
    async fn detach_releases_push_channel() {
        let api = Arc::new(MockApi::default());
        let push = Arc::new(FakePush::default());
        let controller = SessionController::new(
            Identity::new("trainee-1"),
            api.clone(),
            Delivery::Streaming(push.clone()),
            SessionStore::open_in_memory().unwrap(),
        );

        let id = answered_call(&controller).await;
        let driver = push.take_driver();
        controller.detach(&id).await.unwrap();

        assert!(driver.shutdown.await.is_ok());
        assert!(controller.snapshot(&id).is_none());
        assert_eq!(
            controller.store().list_active("trainee-1").await.unwrap().len(),
            1
        );
    }

    struct RefusingPush;

    #[async_trait]
    impl PushChannel for RefusingPush {
        async fn subscribe(&self, _session_id: &str) -> Result<Subscription, TransportError> {
            Err(TransportError::Connection("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn create_rolls_back_when_push_channel_cannot_subscribe() {
        let api = Arc::new(MockApi::default());
        let controller = SessionController::new(
            Identity::new("trainee-1"),
            api.clone(),
            Delivery::Streaming(Arc::new(RefusingPush)),
            SessionStore::open_in_memory().unwrap(),
        );

        let err = controller.create(&domestic()).await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        assert!(controller
            .store()
            .list_active("trainee-1")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(api.ends.load(Ordering::SeqCst), 1);
        assert!(controller.open_sessions().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reply_queued_before_disconnect_settles_the_turn() {
        for _ in 0..50 {
            let api = Arc::new(MockApi::default());
            let push = Arc::new(FakePush::default());
            let controller = SessionController::new(
                Identity::new("trainee-1"),
                api.clone(),
                Delivery::Streaming(push.clone()),
                SessionStore::open_in_memory().unwrap(),
            );

            let id = answered_call(&controller).await;
            let driver = push.take_driver();
            driver.connected.send_replace(true);
            while !controller.snapshot(&id).unwrap().connected {
                tokio::task::yield_now().await;
            }

            let outcome = controller.send_turn(&id, "What's your location?").await.unwrap();
            assert!(matches!(outcome, TurnOutcome::Pending { .. }));
            driver.events.try_send(PushEvent::Reply(location_reply())).unwrap();
            driver.connected.send_replace(false);

            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let snap = controller.snapshot(&id).unwrap();
                    if !snap.connected && !snap.is_caller_responding() {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            })
            .await
            .expect("settled in time");

            let roles: Vec<_> = controller
                .snapshot(&id)
                .unwrap()
                .session
                .transcript
                .iter()
                .map(|e| e.role)
                .collect();
            assert_eq!(roles, vec![SpeakerRole::CallTaker, SpeakerRole::Caller]);
        }
    }
}
