//! Transport Layer
//!
//! TCP tuning for accepted streams and the WebSocket socket session that
//! carries bridge frames.

mod websocket;

#[cfg(test)]
mod tests;

pub use websocket::{accept, SocketReader, SocketSession, SocketWriter};

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// TCP nodelay
    pub tcp_nodelay: bool,
    /// TCP keepalive idle time
    pub tcp_keepalive: Option<Duration>,
    /// Largest WebSocket message accepted from a peer (0 = unlimited)
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_keepalive: Some(Duration::from_secs(60)),
            max_frame_size: 64 * 1024,
        }
    }
}

impl TransportConfig {
    /// WebSocket protocol limits derived from this configuration
    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        if self.max_frame_size > 0 {
            config.max_message_size = Some(self.max_frame_size);
            config.max_frame_size = Some(self.max_frame_size);
        }
        config
    }
}

/// Configure a TCP stream
pub fn configure_stream(stream: &TcpStream, config: &TransportConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if let Some(idle) = config.tcp_keepalive {
        SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
    }

    Ok(())
}
