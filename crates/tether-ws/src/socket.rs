//! One WebSocket connection as a [`Transport`].
//!
//! The socket is split at construction: the write half sits behind an
//! async mutex and serves [`Transport::send`] directly, so send failures
//! surface to the caller; the read half is pumped by a spawned task into
//! the [`TransportEvent`] channel handed back alongside the transport.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use tether_rpc::transport::{Transport, TransportError, TransportEvent};

/// Transport produced by dialing out.
pub type ClientTransport = WsTransport<MaybeTlsStream<TcpStream>>;

/// Transport produced by the accept side.
pub type ServerTransport = WsTransport<TcpStream>;

/// Inbound events buffered per connection before backpressure applies.
const EVENT_BUFFER: usize = 256;

/// Outbound half of one WebSocket connection.
pub struct WsTransport<IO> {
    sink: Mutex<SplitSink<WebSocketStream<IO>, Message>>,
}

impl<IO> WsTransport<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Split a completed WebSocket stream into a transport and its inbound
    /// event channel, spawning the read pump.
    pub fn start(ws: WebSocketStream<IO>) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (sink, stream) = ws.split();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let _ = tokio::spawn(pump_inbound(stream, events_tx));
        (Self { sink: Mutex::new(sink) }, events_rx)
    }
}

/// Dial a WebSocket endpoint. A successful return is the open signal; the
/// returned channel carries everything that happens afterwards.
pub async fn connect(
    endpoint: &str,
) -> Result<(ClientTransport, mpsc::Receiver<TransportEvent>), TransportError> {
    let (ws, _response) = connect_async(endpoint)
        .await
        .map_err(|err| TransportError::Io(err.to_string()))?;
    Ok(WsTransport::start(ws))
}

async fn pump_inbound<IO>(
    mut stream: SplitStream<WebSocketStream<IO>>,
    events: mpsc::Sender<TransportEvent>,
) where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if events.send(TransportEvent::Message(text.to_string())).await.is_err() {
                    return;
                }
            }
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => {
                    if events.send(TransportEvent::Message(text.to_owned())).await.is_err() {
                        return;
                    }
                }
                Err(_) => debug!(len = data.len(), "dropping non-UTF8 binary frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(err) => {
                let failure = TransportError::Io(err.to_string());
                if events.send(TransportEvent::Error(failure)).await.is_err() {
                    return;
                }
                break;
            }
        }
    }
    let _ = events.send(TransportEvent::Closed).await;
}

#[async_trait]
impl<IO> Transport for WsTransport<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, text: String) -> Result<(), TransportError> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.send(Message::Close(None)).await;
    }
}
