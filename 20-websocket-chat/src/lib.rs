//! Real-time chat relay.
//!
//! Clients connect, register a display name and exchange broadcast text
//! messages plus typing-presence signals. Each module focuses on a concrete
//! responsibility:
//!
//! - [`registry`] keeps the per-connection session state (username, typing flag).
//! - [`dispatch`] decides which connections receive which outbound events for
//!   every inbound event, without touching the network.
//! - [`welcome`] fetches the one-off welcome message on a cancellable task.
//! - [`broker`] shares the registry between connections, publishes dispatch
//!   results over a Tokio `broadcast` channel and drives each connection's
//!   lifecycle.
//! - [`message`] defines the JSON wire contract plus line-framing helpers.
//! - [`server`] serves the browser page and WebSocket endpoint with axum.
//! - [`tcp`] is a newline-delimited JSON front end for terminal clients.
//! - [`cli`] and [`client`] make up the command-line interface.
//!
//! Integration tests drive the server over real sockets.

pub mod broker;
pub mod cli;
pub mod client;
pub mod dispatch;
pub mod message;
pub mod registry;
pub mod server;
pub mod tcp;
pub mod welcome;
