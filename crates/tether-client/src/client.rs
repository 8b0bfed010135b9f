//! The single-connection client role.
//!
//! A [`Client`] wraps one [`Side`] engine and one WebSocket connection.
//! It runs with safe mode off: a trusted peer that sends malformed input
//! indicates a real bug, so protocol faults terminate the read loop loudly
//! instead of being swallowed.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use tether_rpc::errors::{CallError, RpcFault, SendError};
use tether_rpc::schema::{EventDef, MethodDef};
use tether_rpc::side::{
    DEFAULT_METHOD_TIMEOUT, DiagnosticHook, FaultHook, Side, SideConfig, SideContext,
};
use tether_rpc::transport::{ConnectionId, Link, TransportError, TransportEvent};

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint to dial, e.g. `ws://127.0.0.1:4000`.
    pub endpoint: String,
    /// How long an issued call may wait for its response.
    pub method_timeout: Duration,
    /// Observes the raw text of every outbound message.
    pub log_send: Option<DiagnosticHook>,
    /// Observes the raw text of every inbound message.
    pub log_receive: Option<DiagnosticHook>,
    /// Observes every protocol fault before it is raised.
    pub fault_hook: Option<FaultHook>,
}

impl ClientConfig {
    /// Configuration with the default method timeout and no hooks.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method_timeout: DEFAULT_METHOD_TIMEOUT,
            log_send: None,
            log_receive: None,
            fault_hook: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("endpoint", &self.endpoint)
            .field("method_timeout", &self.method_timeout)
            .finish_non_exhaustive()
    }
}

/// Connect lifecycle. There is no transition back to `NotConnected`; a
/// client is single-use for its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    /// `connect` has not been called yet.
    NotConnected,
    /// `connect` is in flight (or failed; the client stays here).
    Connecting,
    /// The connection is established.
    Connected,
}

/// Why `connect` was refused or failed.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The client is already connected.
    #[error("already connected")]
    AlreadyConnected,
    /// A connect is already in flight.
    #[error("already connecting")]
    AlreadyConnecting,
    /// The transport could not be opened.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Context handed to handlers for messages on the client's connection.
/// One connection needs no disambiguation, so pending calls are keyed by
/// bare sequence number.
#[derive(Clone, Debug)]
pub struct ClientContext {
    /// The client's single connection.
    pub link: Link,
}

impl SideContext for ClientContext {
    type Key = u64;

    fn link(&self) -> &Link {
        &self.link
    }

    fn callback_key(_link: &Link, sequence: u64) -> u64 {
        sequence
    }
}

/// Single-connection endpoint: dials a server, then issues calls, serves
/// calls, and exchanges events over that one connection.
pub struct Client {
    config: ClientConfig,
    side: Arc<Side<ClientContext>>,
    state: Mutex<ClientState>,
    link: Mutex<Option<Link>>,
}

impl Client {
    /// Client for an endpoint with the default configuration.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_config(ClientConfig::new(endpoint))
    }

    /// Client with explicit configuration.
    pub fn with_config(config: ClientConfig) -> Self {
        let side_config = SideConfig {
            method_timeout: config.method_timeout,
            safe_mode: false,
            log_send: config.log_send.clone(),
            log_receive: config.log_receive.clone(),
            fault_hook: config.fault_hook.clone(),
        };
        Self {
            config,
            side: Arc::new(Side::new(side_config)),
            state: Mutex::new(ClientState::NotConnected),
            link: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    /// Dial the endpoint. Valid only once, from `NotConnected`; a second
    /// call is refused with a distinguished error and touches nothing.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        {
            let mut state = self.state.lock();
            match *state {
                ClientState::Connected => return Err(ConnectError::AlreadyConnected),
                ClientState::Connecting => return Err(ConnectError::AlreadyConnecting),
                ClientState::NotConnected => *state = ClientState::Connecting,
            }
        }

        let (transport, events) = tether_ws::connect(&self.config.endpoint).await?;
        let link = Link::new(ConnectionId::new(0), Arc::new(transport));
        *self.link.lock() = Some(link.clone());

        let side = Arc::clone(&self.side);
        let ctx = ClientContext { link };
        let _ = tokio::spawn(read_loop(side, events, ctx));

        *self.state.lock() = ClientState::Connected;
        debug!(endpoint = %self.config.endpoint, "connected");
        Ok(())
    }

    /// Register the handler serving `def` on this connection.
    pub fn on_method<Req, Resp, F, Fut>(&self, def: &MethodDef<Req, Resp>, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req, ClientContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcFault>> + Send + 'static,
    {
        self.side.register_method(def, handler);
    }

    /// Register the handler observing `def` on this connection.
    pub fn on_event<D, F, Fut>(&self, def: &EventDef<D>, handler: F)
    where
        D: DeserializeOwned + Send + 'static,
        F: Fn(D, ClientContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.side.register_event(def, handler);
    }

    /// Call a method on the connected server.
    pub async fn call<Req, Resp>(
        &self,
        def: &MethodDef<Req, Resp>,
        request: Req,
    ) -> Result<Resp, CallError>
    where
        Req: Serialize + Send,
        Resp: DeserializeOwned + Send + 'static,
    {
        let link = self.link.lock().clone().ok_or(CallError::NotConnected)?;
        self.side.call(&link, def, request).await
    }

    /// Emit a fire-and-forget event to the connected server.
    pub async fn send_event<D>(&self, def: &EventDef<D>, data: D) -> Result<(), SendError>
    where
        D: Serialize + Send,
    {
        let link = self
            .link
            .lock()
            .clone()
            .ok_or(SendError::Transport(TransportError::Closed))?;
        self.side.emit_event(&link, def, data).await
    }

    /// Close the connection. The lifecycle state does not reset; the
    /// client cannot be reconnected.
    pub async fn close(&self) {
        let link = self.link.lock().clone();
        if let Some(link) = link {
            link.close().await;
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.config.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Feed inbound traffic into the engine. With safe mode off a protocol
/// fault surfaces here; the loop reports it and stops reading, leaving the
/// misbehaving connection effectively dead.
async fn read_loop(
    side: Arc<Side<ClientContext>>,
    mut events: mpsc::Receiver<TransportEvent>,
    ctx: ClientContext,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(text) => {
                if let Err(fault) = side.dispatch_inbound(&text, &ctx).await {
                    error!(%fault, "protocol fault from server, abandoning connection");
                    break;
                }
            }
            TransportEvent::Error(err) => warn!(error = %err, "transport error"),
            TransportEvent::Closed => {
                debug!("connection closed");
                break;
            }
        }
    }
}
