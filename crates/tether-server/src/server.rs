//! The multi-connection server role.
//!
//! A [`Server`] wraps one [`Side`] engine and an acceptor. Every accepted
//! connection gets a monotonic identity, an entry in the live-connection
//! table, and a session produced by the injected factory; all connections
//! share one engine, whose pending calls are keyed by connection identity
//! plus sequence number. The engine runs with safe mode on: no connection
//! can take the process down with malformed input.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tether_rpc::errors::{CallError, RpcFault, SendError};
use tether_rpc::schema::{EventDef, MethodDef};
use tether_rpc::side::{
    DEFAULT_METHOD_TIMEOUT, DiagnosticHook, FaultHook, Side, SideConfig, SideContext,
};
use tether_rpc::transport::{
    AcceptInfo, Acceptor, ConnectionId, Link, TransportEvent,
};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// How long an issued call may wait for its response.
    pub method_timeout: Duration,
    /// Observes the raw text of every outbound message.
    pub log_send: Option<DiagnosticHook>,
    /// Observes the raw text of every inbound message.
    pub log_receive: Option<DiagnosticHook>,
    /// Observes every swallowed protocol fault.
    pub fault_hook: Option<FaultHook>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            method_timeout: DEFAULT_METHOD_TIMEOUT,
            log_send: None,
            log_receive: None,
            fault_hook: None,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("method_timeout", &self.method_timeout)
            .finish_non_exhaustive()
    }
}

/// Context handed to handlers for messages on one server-side connection:
/// the connection's identity, its transport, and the session created for
/// it at accept time.
///
/// The session lock is synchronous; take it, mutate, and release before
/// awaiting. Messages on one connection are dispatched in order, so
/// handlers for the same connection never race on the session.
pub struct PeerContext<S> {
    /// Identity of the connection this message arrived on.
    pub id: ConnectionId,
    /// The connection itself.
    pub link: Link,
    /// Mutable application state owned by this connection.
    pub session: Arc<Mutex<S>>,
}

impl<S> Clone for PeerContext<S> {
    fn clone(&self) -> Self {
        Self { id: self.id, link: self.link.clone(), session: Arc::clone(&self.session) }
    }
}

impl<S: Send + 'static> SideContext for PeerContext<S> {
    type Key = (ConnectionId, u64);

    fn link(&self) -> &Link {
        &self.link
    }

    fn callback_key(link: &Link, sequence: u64) -> Self::Key {
        // One engine is shared by every connection, and two connections
        // may independently pick the same sequence number.
        (link.id(), sequence)
    }
}

/// Multi-connection endpoint: accepts connections, serves calls from any
/// of them, and can call or notify each one individually or all at once.
pub struct Server<S: Send + 'static> {
    side: Arc<Side<PeerContext<S>>>,
    connections: Arc<RwLock<BTreeMap<ConnectionId, Link>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Send + 'static> Server<S> {
    /// Server over an acceptor with the default configuration. The session
    /// factory runs once per accepted connection.
    pub fn new<A, F>(acceptor: A, session_init: F) -> Self
    where
        A: Acceptor,
        F: Fn(ConnectionId, &Link, &AcceptInfo) -> S + Send + Sync + 'static,
    {
        Self::with_config(acceptor, session_init, ServerConfig::default())
    }

    /// Server with explicit configuration.
    pub fn with_config<A, F>(acceptor: A, session_init: F, config: ServerConfig) -> Self
    where
        A: Acceptor,
        F: Fn(ConnectionId, &Link, &AcceptInfo) -> S + Send + Sync + 'static,
    {
        let side_config = SideConfig {
            method_timeout: config.method_timeout,
            safe_mode: true,
            log_send: config.log_send.clone(),
            log_receive: config.log_receive.clone(),
            fault_hook: config.fault_hook.clone(),
        };
        let side = Arc::new(Side::new(side_config));
        let connections = Arc::new(RwLock::new(BTreeMap::new()));
        let accept_task = tokio::spawn(accept_loop(
            acceptor,
            session_init,
            Arc::clone(&side),
            Arc::clone(&connections),
        ));
        Self { side, connections, accept_task: Mutex::new(Some(accept_task)) }
    }

    /// Register the handler serving `def` for every connection.
    pub fn on_method<Req, Resp, F, Fut>(&self, def: &MethodDef<Req, Resp>, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req, PeerContext<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcFault>> + Send + 'static,
    {
        self.side.register_method(def, handler);
    }

    /// Register the handler observing `def` for every connection.
    pub fn on_event<D, F, Fut>(&self, def: &EventDef<D>, handler: F)
    where
        D: DeserializeOwned + Send + 'static,
        F: Fn(D, PeerContext<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.side.register_event(def, handler);
    }

    /// Call a method on one specific connection.
    pub async fn call<Req, Resp>(
        &self,
        link: &Link,
        def: &MethodDef<Req, Resp>,
        request: Req,
    ) -> Result<Resp, CallError>
    where
        Req: Serialize + Send,
        Resp: DeserializeOwned + Send + 'static,
    {
        self.side.call(link, def, request).await
    }

    /// Emit a fire-and-forget event to one specific connection.
    pub async fn send_event<D>(&self, link: &Link, def: &EventDef<D>, data: D) -> Result<(), SendError>
    where
        D: Serialize + Send,
    {
        self.side.emit_event(link, def, data).await
    }

    /// Emit an event to every connection present in the table right now.
    /// The recipient set is a snapshot: connections added or removed while
    /// the broadcast is in flight are unaffected.
    pub async fn broadcast_event<D>(&self, def: &EventDef<D>, data: D)
    where
        D: Serialize + Clone + Send,
    {
        let targets: Vec<Link> = self.connections.read().values().cloned().collect();
        debug!(event = def.name(), recipients = targets.len(), "broadcast event");
        for link in targets {
            if let Err(err) = self.side.emit_event(&link, def, data.clone()).await {
                warn!(conn = %link.id(), error = %err, "failed to broadcast event");
            }
        }
    }

    /// Look up one live connection.
    pub fn connection(&self, id: ConnectionId) -> Option<Link> {
        self.connections.read().get(&id).cloned()
    }

    /// Snapshot of the live connections in accept order.
    pub fn connections(&self) -> Vec<Link> {
        self.connections.read().values().cloned().collect()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Stop accepting. Live connections stay open; their calls and events
    /// keep working until each connection closes on its own.
    pub fn close(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
    }
}

impl<S: Send + 'static> fmt::Debug for Server<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

/// Accept connections until the acceptor fails or the server is closed.
async fn accept_loop<S, A, F>(
    mut acceptor: A,
    session_init: F,
    side: Arc<Side<PeerContext<S>>>,
    connections: Arc<RwLock<BTreeMap<ConnectionId, Link>>>,
) where
    S: Send + 'static,
    A: Acceptor,
    F: Fn(ConnectionId, &Link, &AcceptInfo) -> S + Send + Sync + 'static,
{
    let mut next_id: u64 = 0;
    loop {
        match acceptor.accept().await {
            Ok(accepted) => {
                let id = ConnectionId::new(next_id);
                next_id += 1;
                let link = Link::new(id, Arc::new(accepted.transport));
                let session = Arc::new(Mutex::new(session_init(id, &link, &accepted.info)));
                let _ = connections.write().insert(id, link.clone());
                info!(%id, remote = ?accepted.info.remote_addr, "connection accepted");
                let ctx = PeerContext { id, link, session };
                let _ = tokio::spawn(connection_loop(
                    Arc::clone(&side),
                    Arc::clone(&connections),
                    ctx,
                    accepted.events,
                ));
            }
            Err(err) => {
                warn!(error = %err, "acceptor failed, no longer accepting");
                break;
            }
        }
    }
}

/// Drive one connection: messages dispatch in arrival order, errors are
/// diagnostic only, and the close event retires the connection (and with
/// it the session).
async fn connection_loop<S: Send + 'static>(
    side: Arc<Side<PeerContext<S>>>,
    connections: Arc<RwLock<BTreeMap<ConnectionId, Link>>>,
    ctx: PeerContext<S>,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(text) => {
                if let Err(fault) = side.dispatch_inbound(&text, &ctx).await {
                    error!(conn = %ctx.id, %fault, "protocol fault");
                }
            }
            TransportEvent::Error(err) => {
                warn!(conn = %ctx.id, error = %err, "transport error");
            }
            TransportEvent::Closed => break,
        }
    }
    let _ = connections.write().remove(&ctx.id);
    debug!(conn = %ctx.id, "connection closed");
}
