//! # tether-rpc
//!
//! Symmetric RPC and event-notification protocol over a persistent duplex
//! message connection. Either endpoint can call methods on the other,
//! receive calls, and emit one-way events through the same dispatch
//! engine.
//!
//! This crate is the shared core both roles build on:
//! - Wire model: numeric-tagged [`Envelope`] carrying a [`CallRequest`],
//!   [`CallResponse`], or [`EventRecord`]
//! - Validation: [`PayloadSchema`] as a decode-or-fail capability, with
//!   the serde-backed [`SerdeSchema`] and the typed
//!   [`MethodDef`]/[`EventDef`] definitions
//! - Engine: [`Side`], generic over the role-supplied [`SideContext`]
//!   (connection context plus callback-index strategy)
//! - Capabilities: [`Transport`]/[`Acceptor`] consumed by the roles
//!
//! The single-connection client role lives in `tether-client`, the
//! multi-connection server role in `tether-server`, and the WebSocket
//! transport in `tether-ws`.

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod schema;
pub mod side;
pub mod transport;

pub use envelope::{CallRequest, CallResponse, Envelope, EventRecord, MessageKind};
pub use errors::{CallError, ProtocolFault, RpcFault, SendError};
pub use schema::{EventDef, MethodDef, PayloadSchema, SchemaError, SerdeSchema};
pub use side::{
    DEFAULT_METHOD_TIMEOUT, DiagnosticHook, FaultHook, Side, SideConfig, SideContext,
};
pub use transport::{
    Accepted, AcceptInfo, Acceptor, ConnectionId, Link, Transport, TransportError, TransportEvent,
};
