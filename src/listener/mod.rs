//! WebSocket Listener
//!
//! Accepts TCP (optionally TLS) connections, performs the WebSocket upgrade,
//! and hands each admitted peer to its own [`Session`] task. The listener
//! owns the [`SessionRegistry`]; on shutdown it stops accepting, asks every
//! session to close, and waits up to `shutdown.drain_timeout` for them.

mod registry;
mod tls;

pub use registry::{Registration, Reservation, SessionRegistry};
pub use tls::{load_acceptor, TlsError};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerTransport;
use crate::config::Config;
use crate::error::BridgeError;
use crate::metrics::Metrics;
use crate::session::{Session, SessionContext};
use crate::topic;
use crate::transport::{self, configure_stream, TransportConfig};

/// The bridge's socket listener
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    ctx: SessionContext,
    registry: Arc<SessionRegistry>,
    transport_config: TransportConfig,
}

impl Listener {
    /// Bind the configured address. TLS material that is missing or does not
    /// parse is logged and the listener serves plaintext.
    pub async fn bind(
        config: Arc<Config>,
        broker: Arc<dyn BrokerTransport>,
    ) -> Result<Self, BridgeError> {
        let addr = config.server.bind;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BridgeError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| BridgeError::Bind { addr, source })?;

        let tls = match (&config.server.tls, config.tls_paths()) {
            (_, Some((cert, key))) => match load_acceptor(cert, key) {
                Ok(acceptor) => Some(acceptor),
                Err(e) => {
                    warn!(error = %e, "TLS disabled, serving plaintext");
                    None
                }
            },
            (Some(_), None) => {
                warn!("TLS needs both cert and key, serving plaintext");
                None
            }
            (None, None) => None,
        };

        let transport_config = TransportConfig {
            max_frame_size: config.limits.max_frame_size,
            ..TransportConfig::default()
        };

        info!(
            "Bridge listening on {} ({})",
            local_addr,
            if tls.is_some() { "wss" } else { "ws" }
        );

        Ok(Self {
            listener,
            local_addr,
            tls,
            ctx: SessionContext::new(config, broker),
            registry: Arc::new(SessionRegistry::new()),
            transport_config,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.ctx = self.ctx.with_metrics(metrics);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Accept connections until `shutdown` resolves, then drain sessions
    pub async fn run<F>(self, shutdown: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()>,
    {
        let Listener {
            listener,
            tls,
            ctx,
            registry,
            transport_config,
            ..
        } = self;

        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        debug!("Starting accept loop");
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "New connection");
                        if let Err(e) = configure_stream(&stream, &transport_config) {
                            debug!(peer = %peer, error = %e, "Failed to tune socket");
                        }
                        connections.spawn(handle_connection(
                            stream,
                            peer,
                            tls.clone(),
                            ctx.clone(),
                            registry.clone(),
                            transport_config.clone(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },

                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        let live = registry.close_all();
        info!("Shutting down, closing {} sessions", live);

        let drain_timeout = ctx.config.shutdown.drain_timeout;
        if !registry.wait_empty(drain_timeout).await {
            warn!(
                "{} sessions still open after {:?}, aborting",
                registry.len(),
                drain_timeout
            );
        }

        connections.abort_all();
        while connections.join_next().await.is_some() {}

        info!("Listener stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    ctx: SessionContext,
    registry: Arc<SessionRegistry>,
    transport_config: TransportConfig,
) {
    let handshake_timeout = ctx.config.server.handshake_timeout;

    match tls {
        Some(acceptor) => {
            match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                Ok(Ok(stream)) => serve(stream, peer, ctx, registry, transport_config).await,
                Ok(Err(e)) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                Err(_) => debug!(peer = %peer, "TLS handshake timed out"),
            }
        }
        None => serve(stream, peer, ctx, registry, transport_config).await,
    }
}

async fn serve<S>(
    stream: S,
    peer: SocketAddr,
    ctx: SessionContext,
    registry: Arc<SessionRegistry>,
    transport_config: TransportConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let limit = ctx.config.limits.max_connections;
    let admit = |request: &Request| -> Result<_, BridgeError> {
        let resolved = topic::resolve_request(request)?;
        let reservation = registry.reserve(limit)?;
        Ok((reservation, resolved))
    };

    let handshake = transport::accept(stream, peer, transport_config.websocket_config(), admit);
    let (socket, (reservation, resolved)) =
        match tokio::time::timeout(ctx.config.server.handshake_timeout, handshake).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                match &e {
                    BridgeError::MalformedRequest(_) | BridgeError::Overloaded(_) => {
                        warn!(peer = %peer, kind = e.kind(), error = %e, "Rejected connection");
                        if let Some(metrics) = &ctx.metrics {
                            metrics.connection_rejected(e.kind());
                        }
                    }
                    _ => debug!(peer = %peer, error = %e, "WebSocket handshake failed"),
                }
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "WebSocket handshake timed out");
                return;
            }
        };

    let registration = reservation.register(peer, &resolved.topic);
    let session = Session::new(
        registration.handle().clone(),
        resolved.options,
        socket,
        ctx,
    );
    let summary = session.run().await;
    debug!(
        session = summary.id,
        peer = %peer,
        topic = %registration.handle().topic(),
        broker_to_socket = summary.broker_to_socket,
        socket_to_broker = summary.socket_to_broker,
        dropped = summary.dropped,
        "Session finished"
    );
    drop(registration);
}
