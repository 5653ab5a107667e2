//! API server for the Shipyard job orchestrator.
//!
//! Receives repository webhooks, exposes runs over HTTP and streams run
//! events over a WebSocket.

pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

#[cfg(test)]
pub(crate) mod testing;

pub use state::AppState;
