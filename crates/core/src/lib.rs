//! DispatchSim Core
//!
//! Session lifecycle for the call-taker training client: the controller and
//! its per-session actors, transcript reconciliation, the local session store,
//! and the scenario catalog.

pub mod controller;
pub mod error;
pub mod history;
pub mod migration_runner;
pub mod scenarios;
pub mod session_actor;
pub mod session_command;
pub mod store;
pub mod transcript;
pub mod transition;

pub use controller::{Identity, ScenarioSelection, SessionController, TurnOutcome};
pub use error::{CatalogError, SessionError, StoreError};
pub use history::UserStats;
pub use scenarios::ScenarioCatalog;
pub use session_actor::{SessionActorHandle, SessionSnapshot};
pub use store::SessionStore;
pub use transcript::{TranscriptReconciler, TurnPhase, TurnRejection, TurnTicket};
pub use transition::{LifecyclePhase, SessionEvent};
