//! The `transport` module is the network ingress of `relaymq`.
//!
//! It defines the JSON protocol spoken over WebSockets and the server that
//! turns client requests into message submissions, inbound route requests
//! and stats queries.

pub mod message;
pub mod websocket;

#[cfg(test)]
mod websocket_tests;

pub use message::{ClientMessage, ServerMessage};
pub use websocket::{Ingress, handle_request, serve, start_websocket_server};
