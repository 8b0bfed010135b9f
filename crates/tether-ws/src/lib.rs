//! # tether-ws
//!
//! WebSocket implementations of the transport capabilities consumed by
//! the tether RPC roles: [`WsTransport`] for one duplex connection and
//! [`WsListener`] as the server-side acceptor, both over
//! `tokio-tungstenite`.

#![deny(unsafe_code)]

pub mod listener;
pub mod socket;

pub use listener::WsListener;
pub use socket::{ClientTransport, ServerTransport, WsTransport, connect};
