//! Matchfeed - real-time match and commentary broadcast server
//!
//! Usage:
//!   matchfeed [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>          Configuration file path
//!   -b, --bind <ADDR>            Bind address (default: 0.0.0.0:8080)
//!   -w, --ws-path <PATH>         WebSocket upgrade path (default: /ws)
//!   --ping-interval <SECS>       Liveness probe interval (default: 30)
//!   --max-connections <N>        Maximum connections (default: 10000)
//!   -l, --log-level              Log level (error, warn, info, debug, trace)
//!   -h, --help                   Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use matchfeed::admission::{AdmissionGate, RateLimitPolicy};
use matchfeed::config::Config;
use matchfeed::server::{Server, ServerConfig};
use matchfeed::{Metrics, MetricsServer};

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
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// Matchfeed - real-time match and commentary broadcasts
#[derive(Parser, Debug)]
#[command(name = "matchfeed")]
#[command(version)]
#[command(about = "Real-time match and commentary broadcast server over WebSocket")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// WebSocket upgrade path
    #[arg(short, long)]
    ws_path: Option<String>,

    /// Liveness probe interval in seconds
    #[arg(long)]
    ping_interval: Option<u64>,

    /// Maximum connections (0 = unlimited)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Without a file, defaults plus MATCHFEED__* overrides
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config, config overrides default (info)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(ws_path) = args.ws_path {
        config.server.ws_path = ws_path;
    }
    if let Some(secs) = args.ping_interval {
        config.liveness.ping_interval = Duration::from_secs(secs);
    }
    if let Some(max) = args.max_connections {
        config.limits.max_connections = max;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let server_config = ServerConfig::from(&config);

    info!("Starting Matchfeed");
    info!("  Bind address: {}", server_config.bind_addr);
    info!("  WebSocket path: {}", server_config.ws_path);
    info!("  Max connections: {}", server_config.max_connections);
    info!("  Max message size: {} bytes", server_config.max_message_size);
    info!("  Ping interval: {:?}", server_config.ping_interval);

    let policy = if config.admission.enabled {
        info!(
            "  Admission: enabled ({:?}, {} per {:?})",
            config.admission.mode, config.admission.window.max, config.admission.window.interval
        );
        Some(Arc::new(RateLimitPolicy::new(&config.admission)?))
    } else {
        info!("  Admission: disabled");
        None
    };
    let gate = match &policy {
        Some(policy) => AdmissionGate::new(
            policy.clone(),
            config.admission.recheck_after_handshake,
        ),
        None => AdmissionGate::allow_all(),
    };
    info!(
        "  Admission recheck after handshake: {}",
        gate.rechecks_after_handshake()
    );

    let metrics = if config.metrics.enabled {
        info!("  Metrics: enabled (http://{})", config.metrics.bind);
        Some(Arc::new(Metrics::new()?))
    } else {
        info!("  Metrics: disabled");
        None
    };

    let server = Arc::new(Server::with_gate(server_config, gate, metrics.clone()));

    if let Some(metrics) = metrics {
        let metrics_server = MetricsServer::new(metrics, config.metrics.bind);
        let shutdown = server.subscribe_shutdown();
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run(shutdown).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    if let Some(policy) = policy {
        policy.spawn_cleanup(server.subscribe_shutdown());
    }

    let signal_server = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => signal_server.shutdown(),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    server.run().await?;

    Ok(())
}
