//! WebSocket connection acceptor over a TCP listener.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::debug;

use tether_rpc::transport::{Accepted, AcceptInfo, Acceptor, TransportError};

use crate::socket::{ServerTransport, WsTransport};

/// Accepts inbound WebSocket connections. Dropping the listener closes the
/// listening socket; connections already accepted stay alive.
pub struct WsListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl WsListener {
    /// Bind a listening socket. Use port `0` to let the OS pick one.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, "websocket listener bound");
        Ok(Self { listener, local_addr })
    }

    /// The address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Acceptor for WsListener {
    type Transport = ServerTransport;

    async fn accept(&mut self) -> Result<Accepted<ServerTransport>, TransportError> {
        // A failed handshake spends one peer, not the listener.
        loop {
            let (stream, remote_addr) = self
                .listener
                .accept()
                .await
                .map_err(|err| TransportError::Io(err.to_string()))?;
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => {
                    let (transport, events) = WsTransport::start(ws);
                    return Ok(Accepted {
                        transport,
                        events,
                        info: AcceptInfo { remote_addr: Some(remote_addr) },
                    });
                }
                Err(err) => {
                    debug!(%remote_addr, error = %err, "websocket handshake failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_rpc::transport::{Transport, TransportEvent};

    async fn next_message(events: &mut tokio::sync::mpsc::Receiver<TransportEvent>) -> String {
        loop {
            match events.recv().await.expect("event stream ended") {
                TransportEvent::Message(text) => return text,
                TransportEvent::Error(err) => panic!("transport error: {err}"),
                TransportEvent::Closed => panic!("connection closed early"),
            }
        }
    }

    #[tokio::test]
    async fn accepts_and_exchanges_text() {
        let mut listener = WsListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr());

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let (client, mut client_events) = crate::socket::connect(&endpoint).await.unwrap();
        let mut accepted = accept.await.unwrap();

        assert!(accepted.info.remote_addr.is_some());

        client.send("ping from client".into()).await.unwrap();
        assert_eq!(next_message(&mut accepted.events).await, "ping from client");

        accepted.transport.send("pong from server".into()).await.unwrap();
        assert_eq!(next_message(&mut client_events).await, "pong from server");
    }

    #[tokio::test]
    async fn close_is_observed_by_the_peer() {
        let mut listener = WsListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr());

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let (client, _client_events) = crate::socket::connect(&endpoint).await.unwrap();
        let mut accepted = accept.await.unwrap();

        client.close().await;
        loop {
            match accepted.events.recv().await.expect("event stream ended") {
                TransportEvent::Closed => break,
                TransportEvent::Message(_) | TransportEvent::Error(_) => {}
            }
        }
    }

    #[tokio::test]
    async fn bind_reports_local_addr() {
        let listener = WsListener::bind("127.0.0.1:0").await.unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn connect_to_unbound_port_fails() {
        // Bind then drop to get a port that is very likely closed.
        let probe = WsListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", probe.local_addr());
        drop(probe);

        let result = crate::socket::connect(&endpoint).await;
        assert!(result.is_err());
    }
}
