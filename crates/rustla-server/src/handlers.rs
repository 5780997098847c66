//! Connection handlers for the rustla server.
//!
//! This module handles the connection lifecycle, message processing, and
//! process startup for each cluster role.

use crate::config::{ClusterConfig, Config, ConfigError, Role, StoreBackend, StoreConfig};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use rustla_core::store::RedisStore;
use rustla_core::{ConnectionId, ConnectionRegistry, MemoryStore, PresenceEngine, PresenceStore};
use rustla_protocol::codec;
use rustla_relay::{Coordinator, NodeId, NoopRelay, Relay, RelayInbox, WorkerRelay};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The presence engine.
    pub engine: Arc<PresenceEngine>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(engine: Arc<PresenceEngine>, config: Config) -> Self {
        Self { engine, config }
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let websocket_path = state.config.transport.websocket_path.clone();

    Router::new()
        .route(&websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the process in the configured role until Ctrl-C.
///
/// A worker also stops when its link to the coordinator closes, since it can
/// no longer hear other processes.
///
/// # Errors
///
/// Returns an error if the server fails to start, or if a worker loses its
/// relay link.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let (relay, inbox): (Arc<dyn Relay>, Option<RelayInbox>) = match config.cluster.role {
        Role::Coordinator => return run_coordinator(&config.cluster).await,
        Role::Standalone => (Arc::new(NoopRelay), None),
        Role::Worker => {
            let (relay, inbox) = join_relay(&config.cluster).await?;
            (Arc::new(relay), Some(inbox))
        }
    };

    if config.cluster.role == Role::Worker && config.store.backend == StoreBackend::Memory {
        warn!("Worker is using the memory store; counts will not include other processes");
    }

    let store = build_store(&config.store).await?;
    let engine = Arc::new(PresenceEngine::new(
        store,
        Arc::new(ConnectionRegistry::new()),
        relay,
    ));

    let pump = inbox.map(|inbox| spawn_relay_pump(Arc::clone(&engine), inbox));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("rustla server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let coordinator_addr = config.cluster.coordinator_addr.clone();
    let (stop_tx, stop_rx) = oneshot::channel();
    let shutdown = async move {
        let reason = wait_for_shutdown(shutdown_signal(), pump).await;
        let _ = stop_tx.send(reason);
    };

    let state = Arc::new(AppState::new(Arc::clone(&engine), config));
    serve(listener, state, shutdown).await?;

    engine.shutdown().await;

    if matches!(stop_rx.await, Ok(ShutdownReason::RelayLost)) {
        anyhow::bail!("Lost the relay link to {}", coordinator_addr);
    }
    Ok(())
}

/// Why the server stopped accepting connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The shutdown signal fired.
    Signal,
    /// The relay pump ended because the coordinator link closed.
    RelayLost,
}

/// Wait for `signal`, or for the relay pump to end.
///
/// The pump is aborted when the signal wins.
pub async fn wait_for_shutdown<F>(signal: F, pump: Option<JoinHandle<()>>) -> ShutdownReason
where
    F: Future<Output = ()>,
{
    let Some(mut pump) = pump else {
        signal.await;
        return ShutdownReason::Signal;
    };

    tokio::select! {
        () = signal => {
            pump.abort();
            ShutdownReason::Signal
        }
        _ = &mut pump => {
            error!("Relay link closed; shutting down so the worker can be restarted");
            ShutdownReason::RelayLost
        }
    }
}

/// Serve HTTP and WebSocket traffic until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the listener fails.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn run_coordinator(cluster: &ClusterConfig) -> Result<()> {
    let coordinator = Coordinator::bind(cluster.coordinator_addr.as_str())
        .await
        .with_context(|| format!("Failed to bind relay on {}", cluster.coordinator_addr))?;

    tokio::select! {
        result = coordinator.serve() => result.context("Relay coordinator failed")?,
        () = shutdown_signal() => {}
    }

    info!("Relay coordinator stopped");
    Ok(())
}

async fn join_relay(cluster: &ClusterConfig) -> Result<(WorkerRelay, RelayInbox)> {
    let node = cluster
        .node_id
        .clone()
        .map(NodeId::from)
        .unwrap_or_else(NodeId::generate);

    WorkerRelay::connect(cluster.coordinator_addr.as_str(), node)
        .await
        .with_context(|| format!("Failed to join relay at {}", cluster.coordinator_addr))
}

async fn build_store(config: &StoreConfig) -> Result<Arc<dyn PresenceStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or(ConfigError::MissingRedisUrl)?;
            let store = RedisStore::connect_with_prefix(url, config.key_prefix.clone())
                .await
                .context("Failed to connect to redis")?;
            Ok(Arc::new(store))
        }
    }
}

/// Feed commands from other processes into the engine.
///
/// The task ends when the inbox closes.
pub fn spawn_relay_pump(engine: Arc<PresenceEngine>, mut inbox: RelayInbox) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = inbox.recv().await {
            metrics::record_relay_command(command.name());
            if let Err(e) = engine.apply_relay(command).await {
                error!(command = command.name(), error = %e, "Failed to apply relay command");
                metrics::record_error("relay");
            }
        }
        warn!("Relay inbox closed");
        metrics::record_error("relay");
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.engine.registry().len(),
        "relay": state.engine.relay_name(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    if state.engine.registry().len() >= state.config.limits.max_connections {
        warn!(
            limit = state.config.limits.max_connections,
            "Connection limit reached"
        );
        metrics::record_rejected_connection();
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    }

    let max_message_size = state.config.limits.max_message_size;
    ws.max_message_size(max_message_size)
        .max_frame_size(max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (outbox, mut queue) = mpsc::unbounded_channel();
    let connection_id = match state.engine.connect(outbox).await {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "Failed to register connection");
            metrics::record_error("store");
            let _ = socket.close().await;
            return;
        }
    };

    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let heartbeat_interval = state.config.heartbeat.interval();
    let idle_timeout = state.config.heartbeat.timeout();
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat_interval,
        heartbeat_interval,
    );
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            // Events pushed by the engine
            event = queue.recv() => {
                let Some(event) = event else {
                    debug!(connection = %connection_id, "Connection dropped from registry");
                    break;
                };
                match codec::encode_server(&event) {
                    Ok(text) => {
                        metrics::record_message(text.len(), "outbound");
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(connection = %connection_id, error = %e, "Failed to encode event");
                        metrics::record_error("encode");
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        metrics::record_message(text.len(), "inbound");
                        handle_text(&state, &connection_id, &text).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        last_seen = Instant::now();
                        metrics::record_message(data.len(), "inbound");
                        match std::str::from_utf8(&data) {
                            Ok(text) => handle_text(&state, &connection_id, text).await,
                            Err(_) => {
                                warn!(connection = %connection_id, "Binary message is not UTF-8");
                                metrics::record_error("decode");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > idle_timeout {
                    debug!(connection = %connection_id, "Idle timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Err(e) = state.engine.disconnect(&connection_id).await {
        error!(connection = %connection_id, error = %e, "Failed to remove rustler");
        metrics::record_error("store");
    }

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Decode and dispatch one text message.
///
/// Malformed messages are logged and dropped; the connection stays open.
async fn handle_text(state: &AppState, connection_id: &ConnectionId, text: &str) {
    let start = Instant::now();

    let event = match codec::decode_client(text) {
        Ok(Some(event)) => event,
        Ok(None) => return,
        Err(e) => {
            warn!(connection = %connection_id, error = %e, "Malformed message");
            metrics::record_error("decode");
            return;
        }
    };

    let name = event.name();
    metrics::record_event(name);

    if let Err(e) = state.engine.handle(connection_id, event).await {
        error!(connection = %connection_id, event = name, error = %e, "Event handling failed");
        metrics::record_error("store");
    }

    metrics::record_latency(start.elapsed().as_secs_f64());
}
