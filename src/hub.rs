//! Relay hub: HTTP/websocket surface and background tasks.
//!
//! Inbound RPC traffic enters over `POST /` (or `/rpc`) and is routed to a
//! connected cache node; nodes connect over `GET /ws` and speak the
//! [`crate::messages`] protocol. Observability endpoints are read-only and
//! have no side effects on the core.

use crate::auth::{self, SignatureVerifier};
use crate::chain::{self, RegistryVerifier};
use crate::config::HubConfig;
use crate::error::RelayError;
use crate::messages::WireMessage;
use crate::metrics;
use crate::registry::{ConnectedNode, ConnectionRegistry, RegistrationState, RpcOutcome};
use crate::router::Router as RpcRouter;
use crate::stats::StatsService;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// How long the hub waits for the register frame after socket open.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(15);
/// Cadence of the on-chain mirror refresh for connected nodes.
const CHAIN_REFRESH_SECS: u64 = 600;

pub struct HubState {
    pub config: HubConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<RpcRouter>,
    pub stats: Arc<StatsService>,
    pub verifier: Arc<dyn RegistryVerifier>,
    pub signature_verifier: Box<dyn SignatureVerifier>,
}

impl HubState {
    pub async fn build(config: HubConfig) -> anyhow::Result<Arc<Self>> {
        let stats = Arc::new(
            StatsService::open(
                std::path::Path::new(&config.stats_config.sled_path),
                std::path::Path::new(&config.stats_config.fallback_path),
                Utc::now().timestamp(),
            )
            .await?,
        );

        let registry = Arc::new(ConnectionRegistry::new(stats.clone()));
        let router = Arc::new(RpcRouter::new(
            registry.clone(),
            stats.clone(),
            config.require_registration,
            Duration::from_secs(config.call_deadline_secs),
        ));
        let verifier = chain::build_verifier(config.chain_config.as_ref());
        let signature_verifier = auth::verifier_for_mode(&config.signature_mode);

        Ok(Arc::new(Self {
            config,
            registry,
            router,
            stats,
            verifier,
            signature_verifier,
        }))
    }
}

pub fn app(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/", post(rpc_handler))
        .route("/rpc", post(rpc_handler))
        .route("/ws", get(ws_handler))
        .route("/nodes", get(list_nodes))
        .route("/nodes/{wallet}", get(wallet_detail))
        .route("/network", get(network_summary))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the hub to completion: bind, serve, flush stats on shutdown.
pub async fn run(config: HubConfig) -> anyhow::Result<()> {
    let state = HubState::build(config).await?;

    spawn_heartbeat_task(state.clone());
    spawn_chain_refresh_task(state.clone());
    spawn_stats_flush_tasks(state.clone());

    let bind_addr = format!("{}:{}", state.config.api_host, state.config.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("🌐 Relay hub listening on {}", bind_addr);

    axum::serve(
        listener,
        app(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Flush durable stats before exit: close out every live session (adds
    // uptime exactly once) and persist the global row.
    info!("Shutting down; flushing stats");
    for node in state.registry.all_nodes() {
        node.request_close();
        state.registry.disconnect(&node).await;
    }
    state.stats.flush_global().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

// ============================================================================
// Background tasks
// ============================================================================

fn spawn_heartbeat_task(state: Arc<HubState>) {
    let interval_secs = state.config.heartbeat_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.tick().await; // skip the immediate tick
        loop {
            interval.tick().await;
            for node in state.registry.all_nodes() {
                if node.send(WireMessage::Ping).is_err() {
                    debug!("Heartbeat send failed for {}", node.operator);
                }
            }
        }
    });
}

/// Refresh the on-chain mirror of every connected node and move nodes
/// between active/unbonded as their bond state changes. A lapsed bond stops
/// traffic without dropping the socket.
fn spawn_chain_refresh_task(state: Arc<HubState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(CHAIN_REFRESH_SECS));
        interval.tick().await;
        loop {
            interval.tick().await;
            if !state.config.require_registration {
                continue;
            }
            for node in state.registry.all_nodes() {
                match state.verifier.lookup(&node.operator).await {
                    Ok(info) => {
                        let eligible = info.as_ref().map(|i| i.is_eligible()).unwrap_or(false);
                        node.set_chain_info(info);
                        match (node.state(), eligible) {
                            (RegistrationState::RegisteredActive, false) => {
                                warn!("Operator {} no longer bonded; demoting", node.operator);
                                node.set_state(RegistrationState::RegisteredUnbonded);
                            }
                            (RegistrationState::RegisteredUnbonded, true) => {
                                info!("Operator {} now bonded; promoting", node.operator);
                                node.set_state(RegistrationState::RegisteredActive);
                            }
                            _ => {}
                        }
                    }
                    Err(e) => warn!("Chain refresh failed for {}: {}", node.operator, e),
                }
            }
            metrics::NODES_ACTIVE.set(state.registry.active_count() as i64);
        }
    });
}

fn spawn_stats_flush_tasks(state: Arc<HubState>) {
    let wallet_state = state.clone();
    let wallet_secs = state.config.stats_config.wallet_flush_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(wallet_secs));
        interval.tick().await;
        loop {
            interval.tick().await;
            wallet_state.registry.persist_all_sessions().await;
            debug!("Safety-net wallet stats flush complete");
        }
    });

    let global_secs = state.config.stats_config.global_flush_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(global_secs));
        interval.tick().await;
        loop {
            interval.tick().await;
            state.stats.flush_global().await;
        }
    });
}

// ============================================================================
// HTTP handlers
// ============================================================================

async fn rpc_handler(
    State(state): State<Arc<HubState>>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    match state.router.route(payload).await {
        Ok(response) => (StatusCode::OK, Json(serde_json::to_value(&response).unwrap_or_default())),
        Err(RelayError::NoCapacity) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no nodes available" })),
        ),
        Err(RelayError::DispatchTimeout { call_id, deadline_ms }) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({
                "error": "node did not respond in time",
                "call_id": call_id,
                "deadline_ms": deadline_ms,
            })),
        ),
        Err(RelayError::NodeDisconnected { .. }) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": "selected node disconnected" })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn list_nodes(State(state): State<Arc<HubState>>) -> impl IntoResponse {
    Json(serde_json::to_value(state.registry.views()).unwrap_or_default())
}

async fn wallet_detail(
    State(state): State<Arc<HubState>>,
    Path(wallet): Path<String>,
) -> impl IntoResponse {
    let live = state.registry.get(&wallet).map(|node| state.registry.view(&node));
    let stats = state.stats.load_wallet(&wallet).await;
    let chain = state.verifier.lookup(&wallet).await.ok().flatten();

    Json(json!({
        "wallet": wallet,
        "live": live,
        "stats": stats,
        "chain": chain,
    }))
}

async fn network_summary(State(state): State<Arc<HubState>>) -> impl IntoResponse {
    let global = state.stats.global_snapshot();
    Json(json!({
        "connected_nodes": state.registry.connected_count(),
        "active_nodes": state.registry.active_count(),
        "global": global,
    }))
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn metrics_handler() -> String {
    metrics::export_metrics()
}

// ============================================================================
// Websocket handling
// ============================================================================

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<HubState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state))
}

async fn handle_socket(socket: WebSocket, addr: SocketAddr, state: Arc<HubState>) {
    let (mut sender, mut receiver) = socket.split();

    // Single writer task; everything outbound goes through the channel.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WireMessage>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sender.send(Message::Text(frame.to_json().into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // The node speaks first: a register frame within the timeout.
    let register = match tokio::time::timeout(REGISTER_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => WireMessage::from_json(&text).ok(),
        _ => None,
    };

    let Some(WireMessage::Register { wallet, display_name, timestamp, signature, region }) =
        register
    else {
        debug!("Socket from {} closed before a valid register frame", addr);
        let _ = outbound_tx.send(WireMessage::AuthFailed {
            reason: "expected register frame".to_string(),
        });
        drop(outbound_tx);
        let _ = writer_task.await;
        return;
    };

    // Auth gate: reject before any state is created.
    if let Err(e) = auth::validate_register(
        &wallet,
        timestamp,
        &signature,
        Utc::now().timestamp(),
        state.signature_verifier.as_ref(),
    ) {
        info!("Rejected registration from {} ({}): {}", addr, wallet, e);
        metrics::REGISTRATIONS.with_label_values(&["auth_failed"]).inc();
        let _ = outbound_tx.send(WireMessage::AuthFailed { reason: e.to_string() });
        drop(outbound_tx);
        let _ = writer_task.await;
        return;
    }

    // Newest connection wins: a previous connection for this wallet is
    // closed and flushed inside admit() before this one becomes visible.
    // Source identity is the IP alone; ephemeral ports change on every
    // reconnect and must not trigger the counter-reset rule.
    let node = state
        .registry
        .admit(&wallet, &display_name, &addr.ip().to_string(), region, outbound_tx.clone())
        .await;

    verify_and_greet(&state, &node).await;
    metrics::NODES_ACTIVE.set(state.registry.active_count() as i64);

    // Socket loop: pongs and rpc responses until close or replacement.
    loop {
        tokio::select! {
            frame = receiver.next() => {
                match frame {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Text(text))) => {
                        match WireMessage::from_json(&text) {
                            Ok(message) => handle_node_frame(&node, message),
                            Err(e) => debug!("Unparseable frame from {}: {}", node.operator, e),
                        }
                    }
                    Some(Ok(_)) => {} // transport-level ping/pong/binary
                }
            }
            _ = node.closed() => {
                debug!("Connection for {} replaced by a newer one", node.operator);
                break;
            }
        }
    }

    state.registry.disconnect(&node).await;
    metrics::NODES_ACTIVE.set(state.registry.active_count() as i64);
    writer_task.abort();
    info!("Node {} disconnected", node.operator);
}

/// Query the on-chain registry for the freshly admitted wallet and tell the
/// node where it stands.
async fn verify_and_greet(state: &Arc<HubState>, node: &Arc<ConnectedNode>) {
    if !state.config.require_registration {
        node.set_state(RegistrationState::RegisteredActive);
        metrics::REGISTRATIONS.with_label_values(&["dev"]).inc();
        let _ = node.send(WireMessage::Registered {
            wallet: node.operator.clone(),
            bond_amount: 0.0,
        });
        info!("Node {} admitted without verification (dev mode)", node.operator);
        return;
    }

    match state.verifier.lookup(&node.operator).await {
        Ok(Some(info)) if info.is_eligible() => {
            let bond_amount = info.bond_amount;
            node.set_chain_info(Some(info));
            node.set_state(RegistrationState::RegisteredActive);
            metrics::REGISTRATIONS.with_label_values(&["active"]).inc();
            let _ = node.send(WireMessage::Registered {
                wallet: node.operator.clone(),
                bond_amount,
            });
            info!("Node {} registered (bond: {})", node.operator, bond_amount);
        }
        Ok(info) => {
            // Known-but-inactive or unknown wallet: socket stays open, no
            // routed traffic.
            node.set_chain_info(info);
            node.set_state(RegistrationState::RegisteredUnbonded);
            metrics::REGISTRATIONS.with_label_values(&["unbonded"]).inc();
            let _ = node.send(WireMessage::NotRegistered {
                reason: "wallet not bonded or inactive on-chain".to_string(),
            });
            info!("Node {} connected but not bonded", node.operator);
        }
        Err(e) => {
            warn!("Chain lookup failed for {}: {}", node.operator, e);
            node.set_state(RegistrationState::RegisteredUnbonded);
            metrics::REGISTRATIONS.with_label_values(&["lookup_failed"]).inc();
            let _ = node.send(WireMessage::NotRegistered {
                reason: "registry lookup failed; retrying periodically".to_string(),
            });
        }
    }
}

/// Frames from an admitted node.
fn handle_node_frame(node: &Arc<ConnectedNode>, message: WireMessage) {
    match message {
        WireMessage::Pong => node.touch_ping(),
        WireMessage::Ping => {
            // Node-initiated keepalive; answer and refresh liveness
            node.touch_ping();
            let _ = node.send(WireMessage::Pong);
        }
        WireMessage::RpcResponse { id, result, error, latency_ms, cached } => {
            // Exactly-once: whoever removes the pending entry resolves it
            if let Some(call) = node.take_pending(&id) {
                let _ = call.tx.send(Ok(RpcOutcome {
                    result,
                    error,
                    node_latency_ms: latency_ms,
                    cached,
                }));
            } else {
                debug!("Late or unknown rpc_response {} from {}", id, node.operator);
            }
        }
        other => debug!("Unexpected frame from {}: {:?}", node.operator, other),
    }
}
