//! Connection Registry
//!
//! Owns the operator → live-connection map and the per-connection pending
//! call maps. Enforces one active connection per operator wallet ("newest
//! connection wins"), seeds session counters from durable stats on connect,
//! and flushes session statistics exactly once on disconnect.

use crate::chain::OnChainInfo;
use crate::error::RelayError;
use crate::messages::WireMessage;
use crate::metrics;
use crate::stats::{SessionStats, StatsService, WalletStats, EMA_ALPHA};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info};

/// Sockets without a heartbeat inside this window are excluded from routing
/// eligibility even if still technically open.
pub const PING_STALE_SECS: i64 = 120;

/// Registration state machine per operator connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    Connecting,
    AwaitingVerification,
    /// Wallet known but not bonded/active: socket stays open, zero traffic.
    RegisteredUnbonded,
    /// Bonded and active: eligible for routed traffic.
    RegisteredActive,
    /// Terminal; session stats flushed.
    Disconnected,
}

/// What a node reported back for one routed call.
#[derive(Debug, Clone)]
pub struct RpcOutcome {
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub node_latency_ms: u64,
    pub cached: bool,
}

pub struct PendingCall {
    pub tx: oneshot::Sender<Result<RpcOutcome, RelayError>>,
    pub sent_at: Instant,
}

/// One live operator connection. Created on socket open, destroyed on socket
/// close; at most one instance is active per operator address.
pub struct ConnectedNode {
    pub operator: String,
    pub display_name: String,
    pub source_address: String,
    pub geo_label: Option<String>,
    pub connected_at: Instant,
    pub connected_at_unix: i64,
    outbound: mpsc::UnboundedSender<WireMessage>,
    state: RwLock<RegistrationState>,
    chain_info: RwLock<Option<OnChainInfo>>,
    last_ping_at: RwLock<DateTime<Utc>>,
    pending: DashMap<String, PendingCall>,
    perf: Mutex<SessionStats>,
    /// Set once when session stats are flushed; guards double counting when
    /// a replacement admit races the socket-close event.
    flushed: AtomicBool,
    /// Signals the socket task to shut the connection down.
    close: Notify,
}

impl ConnectedNode {
    pub fn state(&self) -> RegistrationState {
        *self.state.read().expect("state lock")
    }

    pub fn set_state(&self, state: RegistrationState) {
        *self.state.write().expect("state lock") = state;
    }

    pub fn chain_info(&self) -> Option<OnChainInfo> {
        self.chain_info.read().expect("chain lock").clone()
    }

    pub fn set_chain_info(&self, info: Option<OnChainInfo>) {
        *self.chain_info.write().expect("chain lock") = info;
    }

    pub fn touch_ping(&self) {
        *self.last_ping_at.write().expect("ping lock") = Utc::now();
    }

    pub fn last_ping_at(&self) -> DateTime<Utc> {
        *self.last_ping_at.read().expect("ping lock")
    }

    pub fn ping_is_fresh(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_ping_at()).num_seconds() < PING_STALE_SECS
    }

    /// Queue an outbound frame for the socket writer task.
    pub fn send(&self, message: WireMessage) -> Result<(), RelayError> {
        self.outbound
            .send(message)
            .map_err(|_| RelayError::NodeDisconnected { operator: self.operator.clone() })
    }

    /// Register a pending routed call. The caller owns the receiving end.
    pub fn insert_pending(&self, call_id: String, tx: oneshot::Sender<Result<RpcOutcome, RelayError>>) {
        self.pending.insert(call_id, PendingCall { tx, sent_at: Instant::now() });
    }

    /// Remove a pending call. Removal-then-send makes completion exactly
    /// once: whichever of response/timeout/disconnect removes the entry
    /// first is the one that resolves it.
    pub fn take_pending(&self, call_id: &str) -> Option<PendingCall> {
        self.pending.remove(call_id).map(|(_, call)| call)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Fold a completed call into the session counters. Latency is the
    /// hub-measured round trip, already capped by the router.
    pub fn record_success(&self, capped_latency_ms: f64, cached: bool) {
        let mut perf = self.perf.lock().expect("perf lock");
        perf.requests_handled += 1;
        if cached {
            perf.cache_hits += 1;
        } else {
            perf.cache_misses += 1;
        }
        if perf.ema_latency_ms == 0.0 {
            perf.ema_latency_ms = capped_latency_ms;
        } else {
            perf.ema_latency_ms =
                perf.ema_latency_ms * (1.0 - EMA_ALPHA) + capped_latency_ms * EMA_ALPHA;
        }
    }

    /// A timed-out or failed call still counts as an attempt.
    pub fn record_error(&self) {
        let mut perf = self.perf.lock().expect("perf lock");
        perf.requests_handled += 1;
        perf.errors += 1;
    }

    pub fn perf_snapshot(&self) -> SessionStats {
        self.perf.lock().expect("perf lock").clone()
    }

    fn seed_perf(&self, seed: SessionStats) {
        *self.perf.lock().expect("perf lock") = seed;
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::SeqCst)
    }

    /// Ask the owning socket task to close this connection.
    pub fn request_close(&self) {
        self.close.notify_waiters();
        self.close.notify_one();
    }

    pub async fn closed(&self) {
        self.close.notified().await;
    }

    /// Health figures used by the router.
    pub fn error_rate(&self) -> f64 {
        let perf = self.perf.lock().expect("perf lock");
        if perf.requests_handled == 0 {
            0.0
        } else {
            perf.errors as f64 / perf.requests_handled as f64
        }
    }
}

/// Read-only view of a connection for the observability endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub operator: String,
    pub display_name: String,
    pub state: RegistrationState,
    pub source_address: String,
    pub geo_label: Option<String>,
    pub connected_at: i64,
    pub last_ping_at: i64,
    pub pending_calls: usize,
    pub session: SessionStats,
    pub chain: Option<OnChainInfo>,
}

pub struct ConnectionRegistry {
    nodes: DashMap<String, Arc<ConnectedNode>>,
    stats: Arc<StatsService>,
}

impl ConnectionRegistry {
    pub fn new(stats: Arc<StatsService>) -> Self {
        Self { nodes: DashMap::new(), stats }
    }

    /// Admit a new connection for `operator`, closing and flushing any
    /// previous connection for the same wallet first so no session stats are
    /// lost. Session counters are pre-seeded from durable stats, subject to
    /// the source-address reset rule.
    pub async fn admit(
        &self,
        operator: &str,
        display_name: &str,
        source_address: &str,
        geo_label: Option<String>,
        outbound: mpsc::UnboundedSender<WireMessage>,
    ) -> Arc<ConnectedNode> {
        // Previous connection (if any) is closed and flushed before the new
        // one becomes visible.
        if let Some((_, previous)) = self.nodes.remove(operator) {
            info!("Operator {} reconnected; replacing previous connection", operator);
            metrics::CONNECTIONS_REPLACED.inc();
            previous.request_close();
            self.flush_session(&previous).await;
        }

        let now = Utc::now();
        let mut wallet_stats = self.stats.load_wallet(operator).await;
        let reset = wallet_stats.apply_reconnect(source_address, now.timestamp());
        if reset {
            info!(
                "Operator {} reconnected from new source {}; latency/error counters reset",
                operator, source_address
            );
        }
        self.stats.save_wallet(operator, &wallet_stats).await;

        let node = Arc::new(ConnectedNode {
            operator: operator.to_string(),
            display_name: display_name.to_string(),
            source_address: source_address.to_string(),
            geo_label,
            connected_at: Instant::now(),
            connected_at_unix: now.timestamp(),
            outbound,
            state: RwLock::new(RegistrationState::AwaitingVerification),
            chain_info: RwLock::new(None),
            last_ping_at: RwLock::new(now),
            pending: DashMap::new(),
            perf: Mutex::new(wallet_stats.seed_session()),
            flushed: AtomicBool::new(false),
            close: Notify::new(),
        });

        self.nodes.insert(operator.to_string(), node.clone());
        metrics::NODES_CONNECTED.set(self.nodes.len() as i64);
        node
    }

    pub fn get(&self, operator: &str) -> Option<Arc<ConnectedNode>> {
        self.nodes.get(operator).map(|entry| entry.clone())
    }

    /// Handle socket close for `node`: flush session stats exactly once,
    /// fail in-flight calls promptly, and drop the operator mapping (unless
    /// a newer connection already replaced it).
    pub async fn disconnect(&self, node: &Arc<ConnectedNode>) {
        // Only remove the mapping if it still points at this connection; a
        // replacement admitted concurrently must not be evicted.
        self.nodes
            .remove_if(&node.operator, |_, existing| Arc::ptr_eq(existing, node));
        metrics::NODES_CONNECTED.set(self.nodes.len() as i64);

        self.flush_session(node).await;
    }

    /// Merge and persist session stats for a closing connection. Guarded so
    /// uptime is added exactly once even when disconnect paths race.
    async fn flush_session(&self, node: &Arc<ConnectedNode>) {
        if node.flushed.swap(true, Ordering::SeqCst) {
            return;
        }
        node.set_state(RegistrationState::Disconnected);

        // In-flight calls on a closed socket fail now, not at their deadline.
        let pending: Vec<String> = node.pending.iter().map(|e| e.key().clone()).collect();
        for call_id in pending {
            if let Some(call) = node.take_pending(&call_id) {
                let _ = call.tx.send(Err(RelayError::NodeDisconnected {
                    operator: node.operator.clone(),
                }));
            }
        }

        let session_secs = node.connected_at.elapsed().as_secs();
        let snapshot = node.perf_snapshot();
        let now = Utc::now().timestamp();

        let mut wallet_stats = self.stats.load_wallet(&node.operator).await;
        wallet_stats.finish_session(&snapshot, session_secs, now);
        self.stats.save_wallet(&node.operator, &wallet_stats).await;

        debug!(
            "Flushed session for {} ({}s uptime, {} requests)",
            node.operator, session_secs, snapshot.requests_handled
        );
    }

    /// Persist the merged wallet record for a live session (after a routed
    /// request resolves, and from the safety-net timer). Does not touch
    /// uptime.
    pub async fn persist_session(&self, node: &ConnectedNode) {
        let snapshot = node.perf_snapshot();
        let mut wallet_stats = self.stats.load_wallet(&node.operator).await;
        wallet_stats.merge_session(&snapshot);
        self.stats.save_wallet(&node.operator, &wallet_stats).await;
    }

    /// Safety-net flush of every live session.
    pub async fn persist_all_sessions(&self) {
        let nodes: Vec<Arc<ConnectedNode>> = self.nodes.iter().map(|e| e.clone()).collect();
        for node in nodes {
            if !node.is_flushed() {
                self.persist_session(&node).await;
            }
        }
    }

    /// Candidate set for the router: registered-active (or any admitted
    /// connection when registration is not required) with a fresh heartbeat.
    pub fn eligible_nodes(&self, require_registration: bool) -> Vec<Arc<ConnectedNode>> {
        let now = Utc::now();
        self.nodes
            .iter()
            .filter(|entry| {
                let node = entry.value();
                if node.is_flushed() {
                    return false;
                }
                let state_ok = if require_registration {
                    node.state() == RegistrationState::RegisteredActive
                } else {
                    !matches!(node.state(), RegistrationState::Disconnected)
                };
                state_ok && node.ping_is_fresh(now)
            })
            .map(|entry| entry.clone())
            .collect()
    }

    pub fn all_nodes(&self) -> Vec<Arc<ConnectedNode>> {
        self.nodes.iter().map(|entry| entry.clone()).collect()
    }

    pub fn connected_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn active_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|e| e.state() == RegistrationState::RegisteredActive)
            .count()
    }

    pub fn view(&self, node: &ConnectedNode) -> NodeView {
        NodeView {
            operator: node.operator.clone(),
            display_name: node.display_name.clone(),
            state: node.state(),
            source_address: node.source_address.clone(),
            geo_label: node.geo_label.clone(),
            connected_at: node.connected_at_unix,
            last_ping_at: node.last_ping_at().timestamp(),
            pending_calls: node.pending_count(),
            session: node.perf_snapshot(),
            chain: node.chain_info(),
        }
    }

    pub fn views(&self) -> Vec<NodeView> {
        self.nodes.iter().map(|e| self.view(e.value())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatsService;
    use tempfile::TempDir;

    async fn test_registry() -> (ConnectionRegistry, Arc<StatsService>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(
            StatsService::open(&dir.path().join("sled"), &dir.path().join("fb.json"), 0)
                .await
                .unwrap(),
        );
        (ConnectionRegistry::new(stats.clone()), stats, dir)
    }

    fn outbound() -> (
        mpsc::UnboundedSender<WireMessage>,
        mpsc::UnboundedReceiver<WireMessage>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn test_single_active_connection_per_operator() {
        let (registry, _stats, _dir) = test_registry().await;

        let (tx1, _rx1) = outbound();
        let first = registry.admit("op1", "a", "1.1.1.1:10", None, tx1).await;
        first.set_state(RegistrationState::RegisteredActive);
        first.record_success(50.0, false);

        let (tx2, _rx2) = outbound();
        let second = registry.admit("op1", "a", "1.1.1.1:11", None, tx2).await;

        // Old connection flushed and replaced before the new one is visible
        assert!(first.is_flushed());
        assert_eq!(registry.connected_count(), 1);
        assert!(Arc::ptr_eq(&registry.get("op1").unwrap(), &second));
    }

    #[tokio::test]
    async fn test_counters_seeded_across_sessions() {
        let (registry, _stats, _dir) = test_registry().await;

        let (tx1, _rx1) = outbound();
        let first = registry.admit("op1", "a", "1.1.1.1:10", None, tx1).await;
        first.record_success(100.0, true);
        first.record_success(100.0, false);
        registry.disconnect(&first).await;

        let (tx2, _rx2) = outbound();
        let second = registry.admit("op1", "a", "1.1.1.1:10", None, tx2).await;
        let perf = second.perf_snapshot();
        assert_eq!(perf.requests_handled, 2);
        assert_eq!(perf.cache_hits, 1);
        assert_eq!(perf.cache_misses, 1);
        assert!(perf.ema_latency_ms > 0.0);
    }

    #[tokio::test]
    async fn test_source_change_resets_penalties() {
        let (registry, _stats, _dir) = test_registry().await;

        let (tx1, _rx1) = outbound();
        let first = registry.admit("op1", "a", "1.1.1.1:10", None, tx1).await;
        first.record_success(2_000.0, false);
        first.record_error();
        registry.disconnect(&first).await;

        // Same wallet, different physical node
        let (tx2, _rx2) = outbound();
        let second = registry.admit("op1", "a", "9.9.9.9:10", None, tx2).await;
        let perf = second.perf_snapshot();
        assert_eq!(perf.errors, 0);
        assert_eq!(perf.ema_latency_ms, 0.0);
        assert_eq!(perf.requests_handled, 2);
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_calls() {
        let (registry, _stats, _dir) = test_registry().await;

        let (tx, _rx) = outbound();
        let node = registry.admit("op1", "a", "1.1.1.1:10", None, tx).await;

        let (call_tx, call_rx) = oneshot::channel();
        node.insert_pending("call-1".to_string(), call_tx);

        registry.disconnect(&node).await;

        match call_rx.await.unwrap() {
            Err(RelayError::NodeDisconnected { operator }) => assert_eq!(operator, "op1"),
            other => panic!("expected disconnect error, got {:?}", other),
        }
        assert!(registry.get("op1").is_none());
    }

    #[tokio::test]
    async fn test_double_disconnect_flushes_once() {
        let (registry, stats, _dir) = test_registry().await;

        let (tx, _rx) = outbound();
        let node = registry.admit("op1", "a", "1.1.1.1:10", None, tx).await;
        node.record_success(10.0, false);

        registry.disconnect(&node).await;
        registry.disconnect(&node).await;

        let wallet = stats.load_wallet("op1").await;
        assert_eq!(wallet.requests_handled, 1);
        // Second disconnect did not add uptime again
        assert!(wallet.total_uptime_seconds <= 1);
    }

    #[tokio::test]
    async fn test_eligibility_requires_active_state() {
        let (registry, _stats, _dir) = test_registry().await;

        let (tx, _rx) = outbound();
        let node = registry.admit("op1", "a", "1.1.1.1:10", None, tx).await;

        // AwaitingVerification: not eligible when registration is required
        assert!(registry.eligible_nodes(true).is_empty());
        assert_eq!(registry.eligible_nodes(false).len(), 1);

        node.set_state(RegistrationState::RegisteredUnbonded);
        assert!(registry.eligible_nodes(true).is_empty());

        node.set_state(RegistrationState::RegisteredActive);
        assert_eq!(registry.eligible_nodes(true).len(), 1);
    }

    #[tokio::test]
    async fn test_pending_take_is_exactly_once() {
        let (registry, _stats, _dir) = test_registry().await;
        let (tx, _rx) = outbound();
        let node = registry.admit("op1", "a", "1.1.1.1:10", None, tx).await;

        let (call_tx, _call_rx) = oneshot::channel();
        node.insert_pending("c1".to_string(), call_tx);

        assert!(node.take_pending("c1").is_some());
        assert!(node.take_pending("c1").is_none());
    }
}
