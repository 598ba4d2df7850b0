//! Bridge Session
//!
//! Pairs one socket peer with one broker connection for one topic. Three
//! tasks share the work:
//!
//! ```text
//!  socket ──▶ uplink task ──publish──▶ broker
//!  socket ◀── writer task ◀──Outbound── session task ◀──BrokerEvent── broker
//! ```
//!
//! The session task drives the state machine from a closed set of
//! [`SessionEvent`]s and never waits on the socket. Broker messages go to
//! the writer through a bounded queue; when a slow peer lets it fill up,
//! further messages are dropped and counted. The uplink only waits on the
//! broker, so neither direction stalls the other.
//!
//! Frames that arrive before the subscription is acknowledged are held by
//! the uplink (up to `limits.pending_frames`) and published in order once
//! the session opens its gate.

mod state;


pub use state::{SessionCounters, SessionState, StateCell};

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::{Fuse, FusedFuture, FutureExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::broker::{BrokerClient, BrokerEvent, BrokerPublisher, BrokerTarget, BrokerTransport};
use crate::codec;
use crate::config::Config;
use crate::error::BridgeError;
use crate::metrics::{Metrics, BROKER_TO_SOCKET, SOCKET_TO_BROKER};
use crate::topic::{validate_topic_name, ConnectionOptions};
use crate::transport::{SocketReader, SocketSession, SocketWriter};

/// Shared view of a live session, held by the listener registry
#[derive(Debug)]
pub struct SessionHandle {
    id: u64,
    peer: SocketAddr,
    topic: String,
    state: StateCell,
    counters: SessionCounters,
    close: Notify,
}

impl SessionHandle {
    pub fn new(id: u64, peer: SocketAddr, topic: impl Into<String>) -> Self {
        Self {
            id,
            peer,
            topic: topic.into(),
            state: StateCell::new(),
            counters: SessionCounters::default(),
            close: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    /// Ask the session to close. Safe to call any number of times.
    pub fn request_close(&self) {
        if !self.state.get().is_closing() {
            self.close.notify_one();
        }
    }
}

/// Everything a session needs from the process around it
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<Config>,
    pub transport: Arc<dyn BrokerTransport>,
    pub metrics: Option<Arc<Metrics>>,
}

impl SessionContext {
    pub fn new(config: Arc<Config>, transport: Arc<dyn BrokerTransport>) -> Self {
        Self {
            config,
            transport,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Why a session ended
#[derive(Debug)]
pub enum CloseCause {
    /// The socket peer closed
    SocketClosed,
    /// The broker closed the connection
    BrokerClosed,
    /// The listener asked the session to close
    Shutdown,
    /// A session-fatal error
    Error(BridgeError),
}

impl CloseCause {
    fn close_frame(&self) -> (CloseCode, String) {
        match self {
            CloseCause::SocketClosed => (CloseCode::Normal, String::new()),
            CloseCause::BrokerClosed => (CloseCode::Normal, "broker closed".to_string()),
            CloseCause::Shutdown => (CloseCode::Away, "bridge shutting down".to_string()),
            CloseCause::Error(e) => (CloseCode::Error, e.kind().to_string()),
        }
    }
}

/// Final report of a finished session
#[derive(Debug)]
pub struct SessionSummary {
    pub id: u64,
    pub cause: CloseCause,
    pub broker_to_socket: u64,
    pub socket_to_broker: u64,
    /// Broker messages dropped because the peer read too slowly
    pub dropped: u64,
}

/// Discrete inputs to the state machine
#[derive(Debug)]
enum SessionEvent {
    Connected,
    Subscribed,
    Message { topic: String, payload: Bytes },
    Closed(Side),
    Error(BridgeError),
    Timeout,
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Socket,
    Broker,
}

/// Work for the socket writer task
#[derive(Debug)]
enum Outbound {
    Frame(Bytes),
    Close(CloseCode, String),
}

/// What the uplink does with socket frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    /// Queue them until the subscription is acknowledged
    Hold,
    /// Publish them
    Open,
    /// Discard them while the session closes
    Drain,
}

/// How the uplink task ended
#[derive(Debug)]
enum UplinkEnd {
    SocketClosed,
    Error(BridgeError),
}

/// One socket peer paired with one broker connection
pub struct Session<S> {
    handle: Arc<SessionHandle>,
    options: ConnectionOptions,
    socket: SocketSession<S>,
    ctx: SessionContext,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        handle: Arc<SessionHandle>,
        options: ConnectionOptions,
        socket: SocketSession<S>,
        ctx: SessionContext,
    ) -> Self {
        Self {
            handle,
            options,
            socket,
            ctx,
        }
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    /// Run until both sides are closed
    pub async fn run(self) -> SessionSummary {
        let span = info_span!(
            "session",
            id = self.handle.id,
            peer = %self.handle.peer,
            topic = %self.handle.topic,
        );
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> SessionSummary {
        let Session {
            handle,
            options,
            socket,
            ctx,
        } = self;

        if let Some(metrics) = &ctx.metrics {
            metrics.session_opened();
        }
        info!("Session started");

        let started = Instant::now();
        let (reader, writer) = socket.split();
        let (outbound, outbound_rx) =
            mpsc::channel(ctx.config.limits.outbound_channel_capacity.max(1));
        let writer_task = tokio::spawn(
            write_loop(writer, outbound_rx, handle.clone(), ctx.metrics.clone())
                .in_current_span(),
        );
        let (gate, gate_rx) = watch::channel(Gate::Hold);

        let mut broker = None;
        let (cause, socket_side) = match connect_broker(&ctx, &handle, &options).await {
            Ok(client) => {
                let client = broker.insert(client);
                let uplink = Uplink {
                    publisher: client.publisher(),
                    gate: gate_rx,
                    pending: VecDeque::new(),
                    pending_limit: ctx.config.limits.pending_frames,
                    handle: handle.clone(),
                    metrics: ctx.metrics.clone(),
                };
                let task = tokio::spawn(uplink.run(reader).in_current_span());
                let abort = task.abort_handle();
                let mut task = task.fuse();

                let relay = Relay {
                    handle: &handle,
                    ctx: &ctx,
                    broker: client,
                    uplink: &mut task,
                    outbound: &outbound,
                    gate: &gate,
                    dropping: false,
                    deadline: Some(started + ctx.config.broker.connect_timeout),
                    started,
                };
                (relay.run().await, SocketSide::Uplink { task, abort })
            }
            Err(e) => (CloseCause::Error(e), SocketSide::Reader(reader)),
        };

        handle.state.begin_closing();
        gate.send_replace(Gate::Drain);
        match &cause {
            CloseCause::Error(e) => {
                warn!(error = %e, kind = e.kind(), "Session closing on error");
                if let Some(metrics) = &ctx.metrics {
                    metrics.session_error(e.kind());
                }
            }
            other => debug!(cause = ?other, "Session closing"),
        }

        teardown(&ctx, &cause, broker, socket_side, outbound, writer_task).await;
        handle.state.finish();

        if let Some(metrics) = &ctx.metrics {
            metrics.session_closed();
        }
        info!(
            broker_to_socket = handle.counters.broker_to_socket(),
            socket_to_broker = handle.counters.socket_to_broker(),
            dropped = handle.counters.dropped(),
            "Session closed"
        );

        SessionSummary {
            id: handle.id,
            cause,
            broker_to_socket: handle.counters.broker_to_socket(),
            socket_to_broker: handle.counters.socket_to_broker(),
            dropped: handle.counters.dropped(),
        }
    }
}

async fn connect_broker(
    ctx: &SessionContext,
    handle: &SessionHandle,
    options: &ConnectionOptions,
) -> Result<BrokerClient, BridgeError> {
    let default_client_id = format!("{}_{}", ctx.config.broker.client_id_prefix, handle.id);
    let target = BrokerTarget::from_options(&ctx.config.broker, default_client_id, options)?;
    BrokerClient::connect(ctx.transport.as_ref(), target).await
}

/// Reading half of the socket: still owned by the session if the broker
/// never connected, otherwise by the uplink task
enum SocketSide<S> {
    Reader(SocketReader<S>),
    Uplink {
        task: Fuse<JoinHandle<UplinkEnd>>,
        abort: AbortHandle,
    },
}

/// The running state machine, borrowed pieces of one session
struct Relay<'a> {
    handle: &'a SessionHandle,
    ctx: &'a SessionContext,
    broker: &'a mut BrokerClient,
    uplink: &'a mut Fuse<JoinHandle<UplinkEnd>>,
    outbound: &'a mpsc::Sender<Outbound>,
    gate: &'a watch::Sender<Gate>,
    /// Whether the writer queue was full at the last delivery
    dropping: bool,
    /// Deadline of the current setup phase
    deadline: Option<Instant>,
    started: Instant,
}

impl Relay<'_> {
    async fn run(mut self) -> CloseCause {
        loop {
            let deadline = self.deadline;
            let event = tokio::select! {
                _ = self.handle.close.notified() => SessionEvent::Shutdown,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() => SessionEvent::Timeout,
                event = self.broker.recv() => match event {
                    Some(BrokerEvent::Connected) => SessionEvent::Connected,
                    Some(BrokerEvent::Subscribed) => SessionEvent::Subscribed,
                    Some(BrokerEvent::Message { topic, payload }) => {
                        SessionEvent::Message { topic, payload }
                    }
                    Some(BrokerEvent::Error(e)) => SessionEvent::Error(e),
                    Some(BrokerEvent::Closed) | None => SessionEvent::Closed(Side::Broker),
                },
                end = &mut *self.uplink, if !self.uplink.is_terminated() => match end {
                    Ok(UplinkEnd::SocketClosed) => SessionEvent::Closed(Side::Socket),
                    Ok(UplinkEnd::Error(e)) => SessionEvent::Error(e),
                    Err(e) => SessionEvent::Error(BridgeError::Socket(format!(
                        "socket reader stopped: {}",
                        e
                    ))),
                },
            };

            if let Some(cause) = self.on_event(event).await {
                return cause;
            }
        }
    }

    async fn on_event(&mut self, event: SessionEvent) -> Option<CloseCause> {
        let state = self.handle.state.get();

        match event {
            SessionEvent::Connected if state == SessionState::Connecting => {
                debug!(client_id = self.broker.client_id(), "Broker connected");
                self.handle.state.advance(SessionState::Subscribing);
                if let Err(e) = self.broker.subscribe(&self.handle.topic).await {
                    return Some(CloseCause::Error(e));
                }
                self.deadline = Some(Instant::now() + self.ctx.config.broker.subscribe_timeout);
            }
            SessionEvent::Subscribed if state == SessionState::Subscribing => {
                self.handle.state.advance(SessionState::Relaying);
                self.deadline = None;
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.session_ready(self.started.elapsed());
                }
                info!("Session relaying");
                self.gate.send_replace(Gate::Open);
            }
            SessionEvent::Connected | SessionEvent::Subscribed => {
                debug!(state = %state, event = ?event, "Ignoring unexpected broker event");
            }
            SessionEvent::Message { topic, payload } => {
                if state != SessionState::Relaying {
                    debug!(state = %state, topic = %topic, "Broker message before relaying");
                    return None;
                }
                return self.deliver(codec::encode(&topic, &payload));
            }
            SessionEvent::Closed(Side::Socket) => return Some(CloseCause::SocketClosed),
            SessionEvent::Closed(Side::Broker) => return Some(CloseCause::BrokerClosed),
            SessionEvent::Error(e) if e.closes_session() => return Some(CloseCause::Error(e)),
            SessionEvent::Error(e) => warn!(error = %e, "Non-fatal session error"),
            SessionEvent::Timeout => {
                let phase = match state {
                    SessionState::Connecting => "broker did not acknowledge connect",
                    _ => "broker did not acknowledge subscribe",
                };
                return Some(CloseCause::Error(BridgeError::BrokerTimeout(phase.to_string())));
            }
            SessionEvent::Shutdown => return Some(CloseCause::Shutdown),
        }

        None
    }

    /// Queue one frame for the writer without waiting on the socket
    fn deliver(&mut self, frame: Bytes) -> Option<CloseCause> {
        match self.outbound.try_send(Outbound::Frame(frame)) {
            Ok(()) => {
                if std::mem::take(&mut self.dropping) {
                    debug!("Socket writer caught up");
                }
                None
            }
            Err(TrySendError::Full(_)) => {
                self.handle.counters.record_dropped();
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.message_dropped(BROKER_TO_SOCKET);
                }
                if !self.dropping {
                    warn!("Peer is not keeping up, dropping broker messages");
                    self.dropping = true;
                }
                None
            }
            Err(TrySendError::Closed(_)) => Some(CloseCause::Error(BridgeError::Socket(
                "socket writer stopped".to_string(),
            ))),
        }
    }
}

/// Socket-to-broker direction
struct Uplink {
    publisher: BrokerPublisher,
    gate: watch::Receiver<Gate>,
    pending: VecDeque<Bytes>,
    pending_limit: usize,
    handle: Arc<SessionHandle>,
    metrics: Option<Arc<Metrics>>,
}

impl Uplink {
    /// Read frames until the peer closes. Only a socket or broker failure
    /// ends it early; malformed frames are dropped.
    async fn run<S>(mut self, mut reader: SocketReader<S>) -> UplinkEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut gate_alive = true;

        loop {
            tokio::select! {
                changed = self.gate.changed(), if gate_alive => {
                    if changed.is_err() {
                        gate_alive = false;
                    } else if let Err(e) = self.sync_gate().await {
                        return UplinkEnd::Error(e);
                    }
                }
                frame = reader.recv() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => return UplinkEnd::Error(e),
                        None => return UplinkEnd::SocketClosed,
                    };

                    // Flush anything queued before this frame so order holds
                    let gate = match self.sync_gate().await {
                        Ok(gate) => gate,
                        Err(e) => return UplinkEnd::Error(e),
                    };
                    match gate {
                        Gate::Open => {
                            if let Err(e) = self.relay(frame).await {
                                return UplinkEnd::Error(e);
                            }
                        }
                        Gate::Hold if self.pending.len() < self.pending_limit => {
                            self.pending.push_back(frame);
                        }
                        Gate::Hold => warn!("Pending frame limit reached, dropping frame"),
                        Gate::Drain => trace!("Discarding frame while closing"),
                    }
                }
            }
        }
    }

    /// Apply the latest gate position. Opening flushes the queue in order.
    async fn sync_gate(&mut self) -> Result<Gate, BridgeError> {
        let gate = *self.gate.borrow_and_update();
        match gate {
            Gate::Open => {
                while let Some(frame) = self.pending.pop_front() {
                    self.relay(frame).await?;
                }
            }
            Gate::Drain => self.pending.clear(),
            Gate::Hold => {}
        }
        Ok(gate)
    }

    /// Publish one socket frame. Malformed frames are dropped here; only a
    /// broker failure is returned.
    async fn relay(&self, frame: Bytes) -> Result<(), BridgeError> {
        let frame = match codec::decode(frame) {
            Ok(frame) => frame,
            Err(e) => {
                self.malformed(BridgeError::from(e));
                return Ok(());
            }
        };

        if let Err(reason) = validate_topic_name(&frame.topic) {
            self.malformed(BridgeError::MalformedMessage(format!(
                "topic '{}': {}",
                frame.topic, reason
            )));
            return Ok(());
        }

        let len = frame.payload.len();
        self.publisher.publish(&frame.topic, frame.payload).await?;

        self.handle.counters.record_socket_to_broker();
        if let Some(metrics) = &self.metrics {
            metrics.message_relayed(SOCKET_TO_BROKER, len);
        }
        Ok(())
    }

    fn malformed(&self, error: BridgeError) {
        warn!(error = %error, "Dropping socket frame");
        if let Some(metrics) = &self.metrics {
            metrics.frame_malformed();
        }
    }
}

async fn write_loop<S>(
    mut writer: SocketWriter<S>,
    mut outbound: mpsc::Receiver<Outbound>,
    handle: Arc<SessionHandle>,
    metrics: Option<Arc<Metrics>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(frame) => {
                let len = frame.len();
                if let Err(e) = writer.send(frame).await {
                    debug!(error = %e, "Socket write failed");
                    return;
                }
                handle.counters.record_broker_to_socket();
                if let Some(metrics) = &metrics {
                    metrics.message_relayed(BROKER_TO_SOCKET, len);
                }
            }
            Outbound::Close(code, reason) => {
                if let Err(e) = writer.close(code, &reason).await {
                    debug!(error = %e, "Socket close failed");
                }
                return;
            }
        }
    }
}

/// Close the side that is still open and wait for both to finish
async fn teardown<S>(
    ctx: &SessionContext,
    cause: &CloseCause,
    broker: Option<BrokerClient>,
    socket_side: SocketSide<S>,
    outbound: mpsc::Sender<Outbound>,
    writer_task: JoinHandle<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let close_timeout = ctx.config.shutdown.close_timeout;
    let writer_abort = writer_task.abort_handle();
    let uplink_abort = match &socket_side {
        SocketSide::Uplink { abort, .. } => Some(abort.clone()),
        SocketSide::Reader(_) => None,
    };
    let (code, reason) = cause.close_frame();

    let socket_done = async move {
        let _ = outbound.send(Outbound::Close(code, reason)).await;
        drop(outbound);
        let _ = writer_task.await;

        // Wait for the peer to answer our close frame
        match socket_side {
            SocketSide::Reader(mut reader) => {
                while let Some(frame) = reader.recv().await {
                    if frame.is_err() {
                        break;
                    }
                }
            }
            SocketSide::Uplink { task, .. } => {
                if !task.is_terminated() {
                    let _ = task.await;
                }
            }
        }
    };

    let broker_done = async move {
        if let Some(mut client) = broker {
            client.shutdown(close_timeout).await;
        }
    };

    let finished = tokio::time::timeout(close_timeout, async {
        tokio::join!(socket_done, broker_done);
    })
    .await;

    if finished.is_err() {
        warn!("Session teardown exceeded {:?}", close_timeout);
        writer_abort.abort();
        if let Some(abort) = uplink_abort {
            abort.abort();
        }
    }
}
