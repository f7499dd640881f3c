//! Matchfeed Server
//!
//! One HTTP/1.1 listener serves the WebSocket upgrade path and a small
//! health endpoint. Admission is decided on the raw upgrade request, so a
//! rejected client gets a plain HTTP status and never reaches the hub.

mod connection;
mod http;

use std::convert::Infallible;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::admission::AdmissionGate;
use crate::config::Config;
use crate::hub::{spawn_liveness_supervisor, Hub};
use crate::metrics::Metrics;
use crate::protocol::CloseReason;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP bind address
    pub bind_addr: SocketAddr,
    /// Path that accepts WebSocket upgrades
    pub ws_path: String,
    /// Maximum registered connections (0 = unlimited)
    pub max_connections: usize,
    /// Maximum inbound message and frame size
    pub max_message_size: usize,
    /// Per-connection outbound queue capacity
    pub outbound_queue_capacity: usize,
    /// Liveness probe interval
    pub ping_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            ws_path: "/ws".to_string(),
            max_connections: 10_000,
            max_message_size: 1024 * 1024,
            outbound_queue_capacity: 1024,
            ping_interval: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for ServerConfig {
    fn from(config: &Config) -> Self {
        Self {
            bind_addr: config.server.bind,
            ws_path: config.server.ws_path.clone(),
            max_connections: config.limits.max_connections,
            max_message_size: config.limits.max_message_size,
            outbound_queue_capacity: config.limits.outbound_queue_capacity,
            ping_interval: config.liveness.ping_interval,
        }
    }
}

/// Server error types
#[derive(Debug)]
pub enum ServerError {
    /// Binding the listener failed
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    Io(std::io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Bind { addr, source } => write!(f, "Failed to bind {}: {}", addr, source),
            ServerError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind { source, .. } => Some(source),
            ServerError::Io(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Io(e)
    }
}

/// State shared by every connection task
struct Shared {
    config: ServerConfig,
    hub: Arc<Hub>,
    gate: AdmissionGate,
    metrics: Option<Arc<Metrics>>,
    shutting_down: AtomicBool,
    /// Connections holding a [`ConnectionSlot`], upgrading or registered
    slots: AtomicUsize,
}

impl Shared {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn record_rejection(&self, stage: &str, reason: &str) {
        if let Some(ref m) = self.metrics {
            m.connection_rejected(stage, reason);
        }
    }
}

/// One unit of `max_connections`, taken before the upgrade is answered and
/// given back when the connection task ends.
struct ConnectionSlot(Arc<Shared>);

impl ConnectionSlot {
    /// Take a slot, or `None` if the server is at capacity
    fn reserve(shared: &Arc<Shared>) -> Option<Self> {
        let max = shared.config.max_connections;
        shared
            .slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                (max == 0 || held < max).then_some(held + 1)
            })
            .ok()
            .map(|_| ConnectionSlot(shared.clone()))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.slots.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The WebSocket notification server
pub struct Server {
    shared: Arc<Shared>,
    shutdown: broadcast::Sender<()>,
}

impl Server {
    /// Create a server that admits every connection
    pub fn new(config: ServerConfig) -> Self {
        Self::with_gate(config, AdmissionGate::allow_all(), None)
    }

    /// Create a server with an admission gate and optional metrics
    pub fn with_gate(
        config: ServerConfig,
        gate: AdmissionGate,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);

        let mut hub = Hub::new(config.outbound_queue_capacity);
        if let Some(ref m) = metrics {
            hub = hub.with_metrics(m.clone());
        }

        Self {
            shared: Arc::new(Shared {
                config,
                hub: Arc::new(hub),
                gate,
                metrics,
                shutting_down: AtomicBool::new(false),
                slots: AtomicUsize::new(0),
            }),
            shutdown,
        }
    }

    /// Hub used to publish events to connected clients
    pub fn hub(&self) -> Arc<Hub> {
        self.shared.hub.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Receiver that fires once [`shutdown`](Self::shutdown) is called
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Run the server until [`shutdown`](Self::shutdown) is called
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        if self.shared.is_shutting_down() {
            return Ok(());
        }

        let addr = self.shared.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        info!(
            "Listening on {} (WebSocket path: {})",
            listener.local_addr()?,
            self.shared.config.ws_path
        );

        let supervisor = spawn_liveness_supervisor(
            self.shared.hub.clone(),
            self.shared.config.ping_interval,
            self.shutdown.subscribe(),
        );

        debug!("Starting accept loop");
        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.recv() => {
                    match result {
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        _ => break,
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("New TCP connection from {}", peer);
                            self.handle_connection(stream, peer);
                        }
                        Err(e) => {
                            error!("Failed to accept TCP connection: {}", e);
                        }
                    }
                }
            }
        }

        let _ = supervisor.await;
        info!("Server stopped");
        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let shared = self.shared.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let shared = shared.clone();
                async move { Ok::<_, Infallible>(http::route(shared, req, peer).await) }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                debug!("HTTP connection error from {}: {}", peer, e);
            }
        });
    }

    /// Stop accepting, stop the liveness supervisor and close every
    /// registered connection with close code 1001.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down");
        let _ = self.shutdown.send(());
        self.shared.hub.close_all(CloseReason::Shutdown);
    }
}
