//! WebSocket Socket Session
//!
//! Owns one WebSocket peer. Each application-level message is one bridge
//! frame; control frames are handled here and never surface to the session.

use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::error::BridgeError;

/// Run the server handshake, letting `admit` inspect the upgrade request.
///
/// `admit` runs before the handshake response is written. An error from it
/// refuses the upgrade: `MalformedRequest` answers 400, anything else 503.
pub async fn accept<S, T, F>(
    stream: S,
    peer: SocketAddr,
    config: WebSocketConfig,
    admit: F,
) -> Result<(SocketSession<S>, T), BridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(&Request) -> Result<T, BridgeError> + Unpin,
{
    let mut admitted: Option<T> = None;
    let mut refused: Option<BridgeError> = None;

    let callback = |request: &Request, response: Response| match admit(request) {
        Ok(value) => {
            admitted = Some(value);
            Ok(response)
        }
        Err(err) => {
            let status = match &err {
                BridgeError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            };
            let mut response = ErrorResponse::new(Some(err.to_string()));
            *response.status_mut() = status;
            refused = Some(err);
            Err(response)
        }
    };

    let result =
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(config)).await;

    match result {
        Ok(ws) => {
            let value = admitted.ok_or_else(|| {
                BridgeError::Socket("handshake completed without admission".to_string())
            })?;
            Ok((SocketSession::new(ws, peer), value))
        }
        Err(e) => Err(refused
            .unwrap_or_else(|| BridgeError::Socket(format!("handshake failed: {}", e)))),
    }
}

/// One WebSocket peer
pub struct SocketSession<S> {
    ws: WebSocketStream<S>,
    peer: SocketAddr,
}

impl<S> SocketSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(ws: WebSocketStream<S>, peer: SocketAddr) -> Self {
        Self { ws, peer }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Separate the read and write halves so each direction runs on its own
    pub fn split(self) -> (SocketReader<S>, SocketWriter<S>) {
        let (sink, stream) = self.ws.split();
        (
            SocketReader {
                stream,
                peer: self.peer,
                closed: false,
            },
            SocketWriter {
                sink,
                peer: self.peer,
                closed: false,
            },
        )
    }
}

/// Read half of a socket session
pub struct SocketReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
    peer: SocketAddr,
    closed: bool,
}

impl<S> SocketReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Next frame from the peer; `None` once the peer closed.
    pub async fn recv(&mut self) -> Option<Result<Bytes, BridgeError>> {
        if self.closed {
            return None;
        }

        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(tungstenite::Error::ConnectionClosed))
                | Some(Err(tungstenite::Error::AlreadyClosed))
                | None => {
                    self.closed = true;
                    return None;
                }
                Some(Err(e)) => {
                    self.closed = true;
                    return Some(Err(e.into()));
                }
            };

            match message {
                Message::Text(text) => return Some(Ok(Bytes::from(text))),
                Message::Binary(data) => return Some(Ok(Bytes::from(data))),
                Message::Close(frame) => {
                    debug!(peer = %self.peer, frame = ?frame, "Peer sent close");
                    self.closed = true;
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Write half of a socket session
pub struct SocketWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    peer: SocketAddr,
    closed: bool,
}

impl<S> SocketWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send one frame; UTF-8 frames go out as text, everything else as binary
    pub async fn send(&mut self, frame: Bytes) -> Result<(), BridgeError> {
        if self.closed {
            return Err(BridgeError::Socket("socket is closed".to_string()));
        }

        let message = match String::from_utf8(Vec::from(frame)) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };

        self.sink.send(message).await.map_err(|e| {
            self.closed = true;
            BridgeError::from(e)
        })
    }

    /// Send a close frame. Calling it again is a no-op.
    pub async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), BridgeError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        debug!(peer = %self.peer, code = ?code, reason, "Closing socket");

        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        match self.sink.send(Message::Close(Some(frame))).await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
