//! DispatchSim Protocol
//!
//! Shared types for the training client and the simulation service.
//! REST bodies travel as JSON over HTTP, push messages as JSON over WebSocket.

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod rest;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use server::ServerMessage;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
