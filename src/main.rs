//! mqttws - MQTT to WebSocket session bridge
//!
//! Usage:
//!   mqttws [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>        Configuration file path
//!   -b, --bind <ADDR>          Listen address (default: 0.0.0.0:8080)
//!       --broker-host <HOST>   MQTT broker host (default: localhost)
//!       --broker-port <PORT>   MQTT broker port (default: 1883)
//!   -w, --workers <N>          Number of worker threads (default: CPU count)
//!       --tls-cert <FILE>      Server certificate chain (PEM)
//!       --tls-key <FILE>       Server private key (PEM)
//!   -l, --log-level            Log level (error, warn, info, debug, trace)
//!   -h, --help                 Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mqttws::config::{Config, ServerTlsConfig};
use mqttws::{Listener, Metrics, MetricsServer, MqttTransport};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// mqttws - MQTT to WebSocket session bridge
#[derive(Parser, Debug)]
#[command(name = "mqttws")]
#[command(version)]
#[command(about = "Bridges WebSocket peers to an MQTT broker, one session per socket")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket listen address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// MQTT broker host
    #[arg(long)]
    broker_host: Option<String>,

    /// MQTT broker port
    #[arg(long)]
    broker_port: Option<u16>,

    /// Number of worker threads (0 = auto)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Server certificate chain for wss (PEM)
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<String>,

    /// Server private key for wss (PEM)
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // A broken config file is reported once logging is up; defaults apply
    let (mut config, config_error) = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => (config, None),
            Err(e) => (Config::from_env().unwrap_or_default(), Some(e)),
        },
        None => match Config::from_env() {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        },
    };

    // CLI args override file config
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(host) = args.broker_host {
        config.broker.host = host;
    }
    if let Some(port) = args.broker_port {
        config.broker.port = port;
    }
    if let Some(workers) = args.workers {
        config.server.workers = workers;
    }
    if let (Some(cert), Some(key)) = (args.tls_cert, args.tls_key) {
        config.server.tls = Some(ServerTlsConfig { cert, key });
    }

    let log_level = args
        .log_level
        .or_else(|| LogLevel::parse(&config.log.level))
        .unwrap_or_default();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match (&config_error, &args.config) {
        (Some(e), _) => warn!("Configuration not loaded, using defaults: {}", e),
        (None, Some(path)) => info!("Loaded configuration from {:?}", path),
        (None, None) => {}
    }

    let workers = if config.server.workers == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    } else {
        config.server.workers
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()?;

    runtime.block_on(run(Arc::new(config), workers))
}

async fn run(config: Arc<Config>, workers: usize) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting mqttws bridge");
    info!("  Bind address: {}", config.server.bind);
    info!("  Broker: {}:{}", config.broker.host, config.broker.port);
    info!("  Workers: {}", workers);
    info!("  Max connections: {}", config.limits.max_connections);
    info!("  Max frame size: {} bytes", config.limits.max_frame_size);

    let mut listener = Listener::bind(config.clone(), Arc::new(MqttTransport::new())).await?;

    if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new());
        listener = listener.with_metrics(metrics.clone());

        let server = MetricsServer::bind(metrics, config.metrics.bind).await?;
        info!("  Metrics: enabled (http://{})", config.metrics.bind);
        tokio::spawn(async move {
            if let Err(e) = server.run(std::future::pending()).await {
                error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    listener.run(shutdown_signal()).await?;

    info!("Bridge stopped");
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
