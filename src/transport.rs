//! Transport abstraction over WebSocket-like byte streams.
//!
//! Rooms and providers only need three things from a connection: send
//! bytes, receive bytes, and the URL path the peer connected to. The
//! host supplies whatever WebSocket implementation it has behind this
//! trait; an axum adapter ships with the crate.

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// A bidirectional byte-frame connection.
///
/// Sends on one transport are serialized: at most one send is in flight
/// at a time. Any receive error means the connection is gone.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The URL path the peer connected to, including the leading `/`.
    fn path(&self) -> &str;

    async fn send(&self, data: Vec<u8>) -> Result<()>;

    async fn recv(&self) -> Result<Vec<u8>>;
}

/// [`Transport`] over an axum WebSocket.
pub struct AxumWebSocket {
    path: String,
    sink: Mutex<SplitSink<WebSocket, WsMessage>>,
    stream: Mutex<SplitStream<WebSocket>>,
}

impl AxumWebSocket {
    pub fn new(socket: WebSocket, path: String) -> Self {
        let (sink, stream) = socket.split();
        Self {
            path,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

#[async_trait]
impl Transport for AxumWebSocket {
    fn path(&self) -> &str {
        &self.path
    }

    async fn send(&self, data: Vec<u8>) -> Result<()> {
        // the sink lock keeps frames whole and ordered per transport
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Binary(data))
            .await
            .map_err(|_| Error::TransportClosed)
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Binary(data))) => return Ok(data),
                Some(Ok(WsMessage::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Close(_))) | None => return Err(Error::TransportClosed),
                Some(Err(_)) => return Err(Error::TransportClosed),
            }
        }
    }
}
