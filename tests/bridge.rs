//! End-to-end tests for the bridge
//!
//! A real listener on loopback, real WebSocket clients, and the in-process
//! broker standing in for MQTT.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use mqttws::config::{Config, ServerTlsConfig};
use mqttws::listener::SessionRegistry;
use mqttws::{BridgeError, Listener, MemoryBroker, SessionState};

// Atomic port counter to avoid port conflicts between tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19800);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const WAIT: Duration = Duration::from_secs(3);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config(port: u16) -> Config {
    let mut config = Config::default();
    config.server.bind = SocketAddr::from(([127, 0, 0, 1], port));
    config.broker.connect_timeout = Duration::from_millis(500);
    config.broker.subscribe_timeout = Duration::from_millis(500);
    config.shutdown.drain_timeout = Duration::from_secs(2);
    config.shutdown.close_timeout = Duration::from_millis(500);
    config
}

struct Bridge {
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), BridgeError>>,
}

impl Bridge {
    async fn start(broker: &MemoryBroker, config: Config) -> Self {
        let listener = Listener::bind(Arc::new(config), Arc::new(broker.clone()))
            .await
            .expect("Failed to bind listener");
        let addr = listener.local_addr();
        let registry = listener.registry();

        let (shutdown, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(listener.run(async move {
            let _ = rx.await;
        }));

        Self {
            addr,
            registry,
            shutdown: Some(shutdown),
            task,
        }
    }

    async fn connect(&self, path: &str) -> Result<Client, WsError> {
        let url = format!("ws://{}{}", self.addr, path);
        timeout(WAIT, tokio_tungstenite::connect_async(url))
            .await
            .expect("connect timed out")
            .map(|(ws, _)| ws)
    }

    /// Connect and wait until the session is relaying
    async fn connect_ready(&self, path: &str) -> Client {
        let before = self.relaying();
        let client = self.connect(path).await.expect("upgrade refused");
        timeout(WAIT, async {
            while self.relaying() <= before {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session never reached relaying");
        client
    }

    fn relaying(&self) -> usize {
        self.registry
            .handles()
            .iter()
            .filter(|handle| handle.state() == SessionState::Relaying)
            .count()
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        timeout(WAIT, self.task)
            .await
            .expect("listener did not stop")
            .expect("listener task panicked")
            .expect("listener failed");
    }
}

async fn next_data(client: &mut Client) -> Message {
    loop {
        let message = timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for socket message")
            .expect("socket stream ended")
            .expect("socket error");
        match message {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

fn expect_status(result: Result<Client, WsError>, status: StatusCode) {
    match result {
        Err(WsError::Http(response)) => assert_eq!(response.status(), status),
        Err(other) => panic!("expected HTTP {}, got error {:?}", status, other),
        Ok(_) => panic!("expected HTTP {}, upgrade succeeded", status),
    }
}

#[tokio::test]
async fn test_sensor_round_trip() {
    let broker = MemoryBroker::new();
    let bridge = Bridge::start(&broker, test_config(next_port())).await;

    let mut client = bridge.connect_ready("/sensors/1").await;

    broker.publish("sensors/1", r#"{"t":21.5}"#);
    assert_eq!(
        next_data(&mut client).await,
        Message::Text(r#"sensors/1|{"t":21.5}"#.to_string())
    );

    // Subscribed only now, so the first message it sees is the client's
    let mut subscriber = broker.subscribe("sensors/1");
    client
        .send(Message::Text("sensors/1|on".to_string()))
        .await
        .unwrap();
    let (topic, payload) = timeout(WAIT, subscriber.recv()).await.unwrap().unwrap();
    assert_eq!(topic, "sensors/1");
    assert_eq!(&payload[..], b"on");

    bridge.stop().await;
}

#[tokio::test]
async fn test_percent_encoded_topic() {
    let broker = MemoryBroker::new();
    let bridge = Bridge::start(&broker, test_config(next_port())).await;

    let mut client = bridge.connect_ready("/home%2Fliving%20room").await;
    broker.publish("home/living room", "21");
    assert_eq!(
        next_data(&mut client).await,
        Message::Text("home/living room|21".to_string())
    );

    bridge.stop().await;
}

#[tokio::test]
async fn test_empty_path_is_rejected() {
    let broker = MemoryBroker::new();
    let bridge = Bridge::start(&broker, test_config(next_port())).await;

    expect_status(bridge.connect("/").await, StatusCode::BAD_REQUEST);
    assert_eq!(broker.connect_attempts(), 0);
    assert!(bridge.registry.is_empty());

    bridge.stop().await;
}

/// Log output collected in memory
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// Single-threaded runtime, so every task logs through the scoped subscriber
#[tokio::test]
async fn test_rejection_is_logged_with_peer_field() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let broker = MemoryBroker::new();
    let bridge = Bridge::start(&broker, test_config(next_port())).await;
    expect_status(bridge.connect("/").await, StatusCode::BAD_REQUEST);

    timeout(WAIT, async {
        while !logs.contents().contains("Rejected connection") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("rejection was not logged");

    let line = logs
        .contents()
        .lines()
        .find(|line| line.contains("Rejected connection"))
        .map(str::to_string)
        .unwrap();
    assert!(line.contains("peer=127.0.0.1:"), "{}", line);
    assert!(line.contains("kind="), "{}", line);

    bridge.stop().await;
}

#[tokio::test]
async fn test_capacity_limit() {
    let broker = MemoryBroker::new();
    let mut config = test_config(next_port());
    config.limits.max_connections = 1;
    let bridge = Bridge::start(&broker, config).await;

    let mut first = bridge.connect_ready("/a").await;
    expect_status(bridge.connect("/b").await, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(broker.connect_attempts(), 1);

    // The slot frees up once the first session is gone
    first.close(None).await.unwrap();
    timeout(WAIT, async {
        while !bridge.registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    let _second = bridge.connect_ready("/b").await;

    bridge.stop().await;
}

#[tokio::test]
async fn test_topic_isolation() {
    let broker = MemoryBroker::new();
    let bridge = Bridge::start(&broker, test_config(next_port())).await;

    let mut a = bridge.connect_ready("/room/a").await;
    let mut b = bridge.connect_ready("/room/b").await;

    broker.publish("room/a", "for a");
    assert_eq!(
        next_data(&mut a).await,
        Message::Text("room/a|for a".to_string())
    );
    assert!(timeout(Duration::from_millis(100), b.next()).await.is_err());

    bridge.stop().await;
}

#[tokio::test]
async fn test_malformed_frame_keeps_session() {
    let broker = MemoryBroker::new();
    let bridge = Bridge::start(&broker, test_config(next_port())).await;

    let mut client = bridge.connect_ready("/t").await;
    client
        .send(Message::Text("no delimiter".to_string()))
        .await
        .unwrap();
    client.send(Message::Text("t|ok".to_string())).await.unwrap();

    // Only the valid frame comes back through the subscription
    assert_eq!(next_data(&mut client).await, Message::Text("t|ok".to_string()));
    assert_eq!(bridge.relaying(), 1);

    bridge.stop().await;
}

#[tokio::test]
async fn test_socket_close_disconnects_broker() {
    let broker = MemoryBroker::new();
    let bridge = Bridge::start(&broker, test_config(next_port())).await;

    let mut client = bridge.connect_ready("/t").await;
    assert_eq!(broker.active_clients(), 1);

    client.close(None).await.unwrap();
    timeout(WAIT, broker.wait_for_clients(0)).await.unwrap();

    bridge.stop().await;
}

#[tokio::test]
async fn test_broker_close_closes_socket() {
    let broker = MemoryBroker::new();
    let bridge = Bridge::start(&broker, test_config(next_port())).await;

    let mut client = bridge.connect_ready("/t").await;
    broker.disconnect_all();

    match next_data(&mut client).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
        other => panic!("expected close frame, got {:?}", other),
    }

    bridge.stop().await;
}

#[tokio::test]
async fn test_shutdown_drains_sessions() {
    let broker = MemoryBroker::new();
    let bridge = Bridge::start(&broker, test_config(next_port())).await;

    let mut a = bridge.connect_ready("/a").await;
    let mut b = bridge.connect_ready("/b").await;
    let addr = bridge.addr;
    let registry = bridge.registry.clone();

    let stopping = tokio::spawn(bridge.stop());

    for client in [&mut a, &mut b] {
        match next_data(client).await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    timeout(WAIT, stopping).await.unwrap().unwrap();
    assert!(registry.is_empty());
    timeout(WAIT, broker.wait_for_clients(0)).await.unwrap();
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_missing_tls_material_serves_plaintext() {
    let broker = MemoryBroker::new();
    let mut config = test_config(next_port());
    config.server.tls = Some(ServerTlsConfig {
        cert: "/nonexistent/cert.pem".to_string(),
        key: "/nonexistent/key.pem".to_string(),
    });

    let listener = Listener::bind(Arc::new(config.clone()), Arc::new(broker.clone()))
        .await
        .unwrap();
    assert!(!listener.is_tls());
    drop(listener);

    let bridge = Bridge::start(&broker, config).await;
    let _client = bridge.connect_ready("/t").await;
    bridge.stop().await;
}

#[tokio::test]
async fn test_bind_error() {
    let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = Config::default();
    config.server.bind = held.local_addr().unwrap();

    let result = Listener::bind(Arc::new(config), Arc::new(MemoryBroker::new())).await;
    match result {
        Err(BridgeError::Bind { addr, .. }) => assert_eq!(addr, held.local_addr().unwrap()),
        Err(other) => panic!("expected bind error, got {}", other),
        Ok(_) => panic!("bind unexpectedly succeeded"),
    }
}
