//! # tether-client
//!
//! Single-connection client role: one [`Client`] owns one WebSocket
//! connection and one shared dispatch engine, and can both issue calls to
//! the server and serve calls the server issues back.

#![deny(unsafe_code)]

pub mod client;

pub use client::{Client, ClientConfig, ClientContext, ClientState, ConnectError};
