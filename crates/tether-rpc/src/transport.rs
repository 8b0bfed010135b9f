//! Transport and acceptor capabilities consumed by the engine.
//!
//! A [`Transport`] is one duplex connection: the engine pushes outbound
//! text through [`Transport::send`], while inbound traffic arrives on the
//! [`TransportEvent`] channel handed out alongside the transport at
//! connect/accept time. A successful connect or accept *is* the open
//! signal; after that the channel yields messages, errors, and finally a
//! close.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Transport-level failure.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection is closed.
    #[error("connection closed")]
    Closed,
    /// The underlying socket reported a failure.
    #[error("transport failure: {0}")]
    Io(String),
}

/// Inbound notification from one connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete text message arrived.
    Message(String),
    /// The connection reported an error but may still deliver traffic.
    Error(TransportError),
    /// The connection is gone; no further events follow.
    Closed,
}

/// Outbound half of one duplex connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one text message. Resolves once the message is handed to the
    /// socket; fails if the connection is gone.
    async fn send(&self, text: String) -> Result<(), TransportError>;

    /// Close the connection. Best-effort; the close is also observable as
    /// a [`TransportEvent::Closed`] on the event channel.
    async fn close(&self);
}

/// Connection acceptor for the multi-connection role. Closing is dropping:
/// the listener socket is released when the acceptor goes away.
#[async_trait]
pub trait Acceptor: Send + 'static {
    /// Concrete transport this acceptor produces.
    type Transport: Transport + 'static;

    /// Wait for the next inbound connection.
    async fn accept(&mut self) -> Result<Accepted<Self::Transport>, TransportError>;
}

/// One freshly accepted connection.
pub struct Accepted<T> {
    /// Outbound half.
    pub transport: T,
    /// Inbound event stream.
    pub events: mpsc::Receiver<TransportEvent>,
    /// Metadata captured at accept time.
    pub info: AcceptInfo,
}

/// Metadata about an accepted connection, handed to the session factory.
#[derive(Clone, Debug, Default)]
pub struct AcceptInfo {
    /// Remote socket address, when the transport knows it.
    pub remote_addr: Option<SocketAddr>,
}

/// Identity of one connection within its owning endpoint. Monotonic,
/// never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw connection number.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw connection number.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// A tagged handle to one live connection: the transport plus the identity
/// the owning endpoint assigned to it. Cheap to clone; clones address the
/// same connection.
#[derive(Clone)]
pub struct Link {
    id: ConnectionId,
    transport: Arc<dyn Transport>,
}

impl Link {
    /// Tag a transport with its connection identity.
    pub fn new(id: ConnectionId, transport: Arc<dyn Transport>) -> Self {
        Self { id, transport }
    }

    /// The identity the owning endpoint assigned.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Send one text message over this connection.
    pub async fn send(&self, text: String) -> Result<(), TransportError> {
        self.transport.send(text).await
    }

    /// Close this connection.
    pub async fn close(&self) {
        self.transport.close().await;
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link").field("id", &self.id).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingTransport {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, text: String) -> Result<(), TransportError> {
            self.sent.lock().push(text);
            Ok(())
        }

        async fn close(&self) {}
    }

    #[test]
    fn connection_id_display() {
        assert_eq!(ConnectionId::new(3).to_string(), "conn_3");
    }

    #[test]
    fn connection_id_orders_by_raw_value() {
        assert!(ConnectionId::new(1) < ConnectionId::new(2));
        assert_eq!(ConnectionId::new(5).raw(), 5);
    }

    #[tokio::test]
    async fn link_forwards_send() {
        let transport = Arc::new(RecordingTransport { sent: Mutex::new(Vec::new()) });
        let link = Link::new(ConnectionId::new(0), transport.clone());
        link.send("hello".into()).await.unwrap();
        assert_eq!(transport.sent.lock().as_slice(), ["hello"]);
    }

    #[test]
    fn link_clones_share_identity() {
        let transport = Arc::new(RecordingTransport { sent: Mutex::new(Vec::new()) });
        let link = Link::new(ConnectionId::new(4), transport);
        let clone = link.clone();
        assert_eq!(link.id(), clone.id());
    }

    #[test]
    fn transport_error_display() {
        assert_eq!(TransportError::Closed.to_string(), "connection closed");
        assert_eq!(
            TransportError::Io("refused".into()).to_string(),
            "transport failure: refused"
        );
    }
}
