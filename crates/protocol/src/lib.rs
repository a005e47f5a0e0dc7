//! Mirrorline Protocol
//!
//! Shared envelopes for communication between the Mirrorline server and
//! clients. These types are serialized as JSON text frames over WebSocket,
//! one envelope per frame.

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use server::{rpc_outcome, ServerMessage};
pub use types::*;

/// Generate a new unique request ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
