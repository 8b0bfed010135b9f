//! The shared dispatch engine used by both connection roles.
//!
//! A [`Side`] owns the method/event registries and the pending-call table
//! for one endpoint. The single-connection role keys pending calls by bare
//! sequence number; the multi-connection role keys them by connection
//! identity plus sequence, because two connections may independently pick
//! the same sequence. That difference is the only behavioral split between
//! roles and is supplied through the [`SideContext`] implementation.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::envelope::{CallRequest, CallResponse, Envelope, EventRecord, MessageKind};
use crate::errors::{CallError, ProtocolFault, RpcFault, SendError};
use crate::schema::{EventDef, MethodDef, PayloadSchema, SerdeSchema};
use crate::transport::Link;

/// Default time a pending call waits for its response.
pub const DEFAULT_METHOD_TIMEOUT: Duration = Duration::from_secs(60);

/// Hook invoked with the raw wire text of every sent or received message.
pub type DiagnosticHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Hook invoked with every protocol fault, including swallowed ones.
pub type FaultHook = Arc<dyn Fn(&ProtocolFault) + Send + Sync>;

/// Engine configuration, fixed at construction.
#[derive(Clone)]
pub struct SideConfig {
    /// How long an issued call may wait for its response.
    pub method_timeout: Duration,
    /// When enabled, protocol faults are swallowed (logged and reported to
    /// the fault hook) instead of raised out of dispatch. The
    /// multi-connection role runs with this on so no peer can take the
    /// process down with malformed input; the single-connection role runs
    /// with it off because a misbehaving trusted peer is a bug worth
    /// surfacing.
    pub safe_mode: bool,
    /// Observes the raw text of every outbound message.
    pub log_send: Option<DiagnosticHook>,
    /// Observes the raw text of every inbound message.
    pub log_receive: Option<DiagnosticHook>,
    /// Observes every protocol fault.
    pub fault_hook: Option<FaultHook>,
}

impl SideConfig {
    /// Configuration with the default method timeout and no hooks.
    pub fn new(safe_mode: bool) -> Self {
        Self {
            method_timeout: DEFAULT_METHOD_TIMEOUT,
            safe_mode,
            log_send: None,
            log_receive: None,
            fault_hook: None,
        }
    }
}

impl fmt::Debug for SideConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SideConfig")
            .field("method_timeout", &self.method_timeout)
            .field("safe_mode", &self.safe_mode)
            .field("log_send", &self.log_send.is_some())
            .field("log_receive", &self.log_receive.is_some())
            .field("fault_hook", &self.fault_hook.is_some())
            .finish()
    }
}

/// Role-supplied context type. A value of this type travels with every
/// inbound message into the registered handlers; the associated `Key` and
/// derivation function define how outbound calls are correlated with the
/// responses that come back.
pub trait SideContext: Clone + Send + Sync + 'static {
    /// Callback-index type keying the pending-call table.
    type Key: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static;

    /// The connection this context belongs to.
    fn link(&self) -> &Link;

    /// Derive the callback index for a call issued on `link` under
    /// `sequence`.
    fn callback_key(link: &Link, sequence: u64) -> Self::Key;
}

/// One outstanding call awaiting its response or timeout. Removed from the
/// pending table before any resolution, which is what makes resolution
/// happen at most once.
struct PendingCall {
    response_schema: Arc<dyn PayloadSchema>,
    tx: oneshot::Sender<Result<Value, CallError>>,
    issued_at: Instant,
}

type MethodFuture = BoxFuture<'static, Result<Value, RpcFault>>;
type ErasedMethodHandler<C> = Arc<dyn Fn(Value, C) -> MethodFuture + Send + Sync>;

type EventFuture = BoxFuture<'static, ()>;
type ErasedEventHandler<C> = Arc<dyn Fn(Value, C) -> EventFuture + Send + Sync>;

struct MethodEntry<C> {
    schema: Arc<dyn PayloadSchema>,
    handler: ErasedMethodHandler<C>,
}

impl<C> Clone for MethodEntry<C> {
    fn clone(&self) -> Self {
        Self { schema: Arc::clone(&self.schema), handler: Arc::clone(&self.handler) }
    }
}

struct EventEntry<C> {
    schema: Arc<dyn PayloadSchema>,
    handler: ErasedEventHandler<C>,
}

impl<C> Clone for EventEntry<C> {
    fn clone(&self) -> Self {
        Self { schema: Arc::clone(&self.schema), handler: Arc::clone(&self.handler) }
    }
}

/// Shared RPC dispatch engine: call issuance, correlation, registration,
/// and inbound routing for one endpoint.
pub struct Side<C: SideContext> {
    methods: RwLock<HashMap<String, MethodEntry<C>>>,
    events: RwLock<HashMap<String, EventEntry<C>>>,
    pending: Arc<Mutex<HashMap<C::Key, PendingCall>>>,
    next_sequence: AtomicU64,
    config: SideConfig,
}

impl<C: SideContext> Side<C> {
    /// Engine with the given configuration and empty registries.
    pub fn new(config: SideConfig) -> Self {
        Self {
            methods: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_sequence: AtomicU64::new(0),
            config,
        }
    }

    /// The configuration this engine runs with.
    pub fn config(&self) -> &SideConfig {
        &self.config
    }

    /// Number of calls currently awaiting a response or timeout.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Register the handler serving `def`. Registering the same name again
    /// replaces the previous handler.
    pub fn register_method<Req, Resp, F, Fut>(&self, def: &MethodDef<Req, Resp>, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcFault>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ErasedMethodHandler<C> = Arc::new(move |raw: Value, ctx: C| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let request: Req =
                    Req::deserialize(&raw).map_err(|_| RpcFault::new("malformed payload"))?;
                let response = handler(request, ctx).await?;
                serde_json::to_value(response)
                    .map_err(|err| RpcFault::new(format!("response encoding failed: {err}")))
            })
        });
        let entry = MethodEntry { schema: def.request_schema(), handler: erased };
        let _ = self.methods.write().insert(def.name().to_owned(), entry);
    }

    /// Register the handler observing `def`. Same overwrite rule as
    /// [`Side::register_method`].
    pub fn register_event<D, F, Fut>(&self, def: &EventDef<D>, handler: F)
    where
        D: DeserializeOwned + Send + 'static,
        F: Fn(D, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ErasedEventHandler<C> = Arc::new(move |raw: Value, ctx: C| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                // The data already passed the registered schema.
                if let Ok(data) = D::deserialize(&raw) {
                    handler(data, ctx).await;
                }
            })
        });
        let entry = EventEntry { schema: def.data_schema(), handler: erased };
        let _ = self.events.write().insert(def.name().to_owned(), entry);
    }

    /// Issue a typed call on `link` and wait for the typed response.
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
        let payload = serde_json::to_value(request)
            .map_err(|err| SendError::Encode(err.to_string()))?;
        let resolved = self
            .issue_call(link, def.name(), payload, def.response_schema())
            .await?;
        Resp::deserialize(&resolved).map_err(|err| CallError::Decode(err.to_string()))
    }

    /// Issue a raw call: allocate the next sequence number, send a method
    /// envelope, and park a pending entry until the matching response,
    /// the timeout, or a send failure resolves it — whichever comes first.
    pub async fn issue_call(
        &self,
        link: &Link,
        name: &str,
        payload: Value,
        response_schema: Arc<dyn PayloadSchema>,
    ) -> Result<Value, CallError> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let key = C::callback_key(link, sequence);
        let request = CallRequest { sequence, name: name.to_owned(), payload };
        let text = Envelope::encode(MessageKind::Method, &request)
            .map_err(|err| SendError::Encode(err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            // Sequence numbers are never reused, so the key is fresh.
            let _ = pending.insert(
                key.clone(),
                PendingCall { response_schema, tx, issued_at: Instant::now() },
            );
        }

        if let Some(hook) = &self.config.log_send {
            hook(&text);
        }
        if let Err(err) = link.send(text).await {
            // Reject immediately and take the entry back out so no timer
            // is left watching it.
            let _ = self.pending.lock().remove(&key);
            return Err(SendError::Transport(err).into());
        }

        self.arm_timeout(key, sequence);

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(CallError::Abandoned),
        }
    }

    fn arm_timeout(&self, key: C::Key, sequence: u64) {
        let pending = Arc::clone(&self.pending);
        let timeout = self.config.method_timeout;
        let _ = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = pending.lock().remove(&key);
            if let Some(call) = expired {
                debug!(sequence, elapsed = ?call.issued_at.elapsed(), "pending call timed out");
                let _ = call.tx.send(Err(CallError::Timeout));
            }
        });
    }

    /// Emit a typed fire-and-forget event on `link`.
    pub async fn emit_event<D>(
        &self,
        link: &Link,
        def: &EventDef<D>,
        data: D,
    ) -> Result<(), SendError>
    where
        D: Serialize + Send,
    {
        let record = EventRecord {
            name: def.name().to_owned(),
            data: serde_json::to_value(data).map_err(|err| SendError::Encode(err.to_string()))?,
        };
        let text = Envelope::encode(MessageKind::Event, &record)
            .map_err(|err| SendError::Encode(err.to_string()))?;
        if let Some(hook) = &self.config.log_send {
            hook(&text);
        }
        link.send(text).await?;
        Ok(())
    }

    /// Route one inbound message. In safe mode every protocol fault is
    /// swallowed and `Ok(())` returned; otherwise the fault is raised to
    /// the caller.
    pub async fn dispatch_inbound(&self, raw: &str, ctx: &C) -> Result<(), ProtocolFault> {
        if let Some(hook) = &self.config.log_receive {
            hook(raw);
        }

        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            return self.protocol_fault(ProtocolFault::MalformedJson);
        };
        let Ok(envelope) = Envelope::deserialize(&value) else {
            return self.protocol_fault(ProtocolFault::MalformedEnvelope);
        };

        match MessageKind::from_wire(envelope.kind) {
            Some(MessageKind::Method) => {
                let Ok(request) = CallRequest::deserialize(&envelope.content) else {
                    return self.protocol_fault(ProtocolFault::MalformedMethodRecord);
                };
                self.handle_method(request, ctx).await;
                Ok(())
            }
            Some(MessageKind::Response) => {
                let Ok(response) = CallResponse::deserialize(&envelope.content) else {
                    return self.protocol_fault(ProtocolFault::MalformedResponseRecord);
                };
                self.handle_response(response, ctx)
            }
            Some(MessageKind::Event) => {
                let Ok(record) = EventRecord::deserialize(&envelope.content) else {
                    return self.protocol_fault(ProtocolFault::MalformedEventRecord);
                };
                self.handle_event(record, ctx).await
            }
            None => self.protocol_fault(ProtocolFault::UnimplementedKind { kind: envelope.kind }),
        }
    }

    /// Serve one inbound call and answer on the same connection it arrived
    /// on. Every non-fatal outcome, including an unknown method or a
    /// malformed payload, is reported to the peer as an error code.
    async fn handle_method(&self, request: CallRequest, ctx: &C) {
        let entry = self.methods.read().get(&request.name).cloned();

        let (payload, error_code) = match entry {
            None => (None, Some(format!("method not implemented: {}", request.name))),
            Some(entry) => match entry.schema.check(&request.payload) {
                Err(_) => (None, Some("malformed payload".to_owned())),
                Ok(()) => match (entry.handler)(request.payload, ctx.clone()).await {
                    Ok(value) if value.is_null() => (None, None),
                    Ok(value) => (Some(value), None),
                    Err(fault) => (None, Some(fault.code)),
                },
            },
        };

        let response = CallResponse { sequence: request.sequence, payload, error_code };
        match Envelope::encode(MessageKind::Response, &response) {
            Ok(text) => {
                if let Some(hook) = &self.config.log_send {
                    hook(&text);
                }
                if let Err(err) = ctx.link().send(text).await {
                    warn!(sequence = request.sequence, error = %err, "failed to send call response");
                }
            }
            Err(err) => {
                warn!(sequence = request.sequence, error = %err, "failed to encode call response");
            }
        }
    }

    /// Resolve the pending call a response correlates to. The entry leaves
    /// the table before any resolution; a concurrent timeout finds nothing
    /// and becomes a no-op.
    fn handle_response(&self, response: CallResponse, ctx: &C) -> Result<(), ProtocolFault> {
        let key = C::callback_key(ctx.link(), response.sequence);
        let Some(call) = self.pending.lock().remove(&key) else {
            return self.protocol_fault(ProtocolFault::UnknownCallback {
                sequence: response.sequence,
            });
        };

        if let Some(code) = response.error_code {
            let _ = call.tx.send(Err(CallError::Fault(RpcFault::new(code))));
            return Ok(());
        }

        let payload = response.payload.unwrap_or(Value::Null);
        if call.response_schema.check(&payload).is_err() {
            // The entry is gone; the caller observes an abandoned call.
            return self.protocol_fault(ProtocolFault::MalformedResponseBody);
        }
        let _ = call.tx.send(Ok(payload));
        Ok(())
    }

    /// Deliver an inbound event to its handler. An event nobody registered
    /// for is dropped without a fault.
    async fn handle_event(&self, record: EventRecord, ctx: &C) -> Result<(), ProtocolFault> {
        let entry = self.events.read().get(&record.name).cloned();
        let Some(entry) = entry else {
            debug!(event = %record.name, "no handler for event, dropping");
            return Ok(());
        };
        if entry.schema.check(&record.data).is_err() {
            return self.protocol_fault(ProtocolFault::MalformedEventBody);
        }
        (entry.handler)(record.data, ctx.clone()).await;
        Ok(())
    }

    fn protocol_fault(&self, fault: ProtocolFault) -> Result<(), ProtocolFault> {
        if let Some(hook) = &self.config.fault_hook {
            hook(&fault);
        }
        if self.config.safe_mode {
            warn!(%fault, "protocol fault swallowed");
            Ok(())
        } else {
            Err(fault)
        }
    }
}

impl<C: SideContext> fmt::Debug for Side<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Side")
            .field("methods", &self.methods.read().len())
            .field("events", &self.events.read().len())
            .field("pending", &self.pending.lock().len())
            .field("config", &self.config)
            .finish()
    }
}
