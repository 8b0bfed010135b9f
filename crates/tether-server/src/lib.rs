//! # tether-server
//!
//! Multi-connection server role: one [`Server`] owns an acceptor, the
//! live-connection table, and a shared dispatch engine. Each accepted
//! connection carries its own session state and can be called or notified
//! individually; events can also be broadcast to every live connection.

#![deny(unsafe_code)]

pub mod server;

pub use server::{PeerContext, Server, ServerConfig};
