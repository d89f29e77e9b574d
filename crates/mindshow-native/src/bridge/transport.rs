//! Message transports to LED controllers.
//!
//! A [`Transport`] is one open, ordered, bidirectional text-frame channel to a
//! single controller. A [`Connector`] opens transports by address. The
//! production pair is [`WebSocketConnector`] / [`WebSocketTransport`]; tests
//! substitute an in-memory connector.

use std::net::SocketAddr;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Could not open the connection
    #[error("Connection to {addr} failed: {reason}")]
    Connect {
        /// Target address
        addr: SocketAddr,
        /// Underlying failure
        reason: String,
    },

    /// Peer closed the connection
    #[error("Connection closed")]
    Closed,

    /// Writing a frame failed
    #[error("Send failed: {0}")]
    Send(String),

    /// Reading a frame failed
    #[error("Receive failed: {0}")]
    Receive(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

// ============================================================================
// Traits
// ============================================================================

/// An open connection to one controller.
///
/// Implementations must make [`Transport::recv_text`] cancel-safe: a link
/// waits on it inside `select!` while idle.
#[async_trait]
pub trait Transport: Send {
    /// Write one text frame.
    async fn send_text(&mut self, text: String) -> TransportResult<()>;

    /// Read the next text frame. `Ok(None)` means the peer closed.
    async fn recv_text(&mut self) -> TransportResult<Option<String>>;

    /// Close the connection.
    async fn close(&mut self) -> TransportResult<()>;
}

/// Opens transports to controllers by address.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new transport to `addr`.
    async fn connect(&self, addr: SocketAddr) -> TransportResult<Box<dyn Transport>>;
}

// ============================================================================
// WebSocket Transport
// ============================================================================

/// WebSocket connection to a controller at `ws://<addr>`.
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send_text(&mut self, text: String) -> TransportResult<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| match e {
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                    TransportError::Closed
                }
                other => TransportError::Send(other.to_string()),
            })
    }

    async fn recv_text(&mut self) -> TransportResult<Option<String>> {
        loop {
            let Some(message) = self.stream.next().await else {
                return Ok(None);
            };
            match message {
                Ok(Message::Text(text)) => return Ok(Some(text)),
                // Some firmware sends the pattern list as binary frames
                Ok(Message::Binary(bytes)) => {
                    return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
                }
                Ok(Message::Close(_)) => return Ok(None),
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return Ok(None);
                }
                Err(e) => return Err(TransportError::Receive(e.to_string())),
            }
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        match self.stream.close(None).await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(TransportError::Send(e.to_string())),
        }
    }
}

/// Opens [`WebSocketTransport`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a new connector.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, addr: SocketAddr) -> TransportResult<Box<dyn Transport>> {
        let url = format!("ws://{addr}");
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                addr,
                reason: e.to_string(),
            })?;
        tracing::debug!(%addr, "websocket open");
        Ok(Box::new(WebSocketTransport { stream }))
    }
}
