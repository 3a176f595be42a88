//! Load-Balancing Router
//!
//! Selects a target node per inbound RPC call using health filters and
//! latency ranking, forwards the call over the node's socket, correlates the
//! asynchronous response, and enforces the dispatch deadline.
//!
//! Selection pipeline: eligible connections → health filter (with fallback
//! to the unfiltered set so health heuristics never block routing outright)
//! → latency ranking → fast pool → round-robin.

use crate::error::RelayError;
use crate::messages::WireMessage;
use crate::metrics;
use crate::registry::{ConnectedNode, ConnectionRegistry, RpcOutcome};
use crate::stats::StatsService;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Below this many lifetime requests a node's measured latency is considered
/// statistically unreliable and a neutral figure is used instead.
pub const HEALTH_MIN_REQUESTS: u64 = 5;
pub const HEALTH_MAX_ERROR_RATE: f64 = 0.30;
pub const HEALTH_MAX_EMA_MS: f64 = 3_000.0;
pub const NEUTRAL_LATENCY_MS: f64 = 500.0;
pub const FAST_POOL_MIN: usize = 3;
/// Per-sample cap before folding into the EMA, to resist outlier skew.
pub const LATENCY_CAP_MS: f64 = 5_000.0;

/// Router-added metadata returned alongside the node's result envelope.
#[derive(Debug, Clone, Serialize)]
pub struct RoutedResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub node: String,
    pub operator: String,
    pub latency_ms: u64,
    pub cached: bool,
}

pub struct Router {
    registry: Arc<ConnectionRegistry>,
    stats: Arc<StatsService>,
    require_registration: bool,
    call_deadline: Duration,
    /// Single rotating index shared across all calls, advanced by one per
    /// call and wrapped modulo fast-pool size.
    rr_index: AtomicUsize,
}

impl Router {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        stats: Arc<StatsService>,
        require_registration: bool,
        call_deadline: Duration,
    ) -> Self {
        Self {
            registry,
            stats,
            require_registration,
            call_deadline,
            rr_index: AtomicUsize::new(0),
        }
    }

    /// Effective latency used for ranking.
    fn effective_latency(node: &ConnectedNode) -> f64 {
        let perf = node.perf_snapshot();
        if perf.requests_handled < HEALTH_MIN_REQUESTS {
            NEUTRAL_LATENCY_MS
        } else {
            perf.ema_latency_ms
        }
    }

    /// A node fails the health filter once it has a meaningful sample size
    /// and either its error rate or its smoothed latency is out of bounds.
    fn is_healthy(node: &ConnectedNode) -> bool {
        let perf = node.perf_snapshot();
        if perf.requests_handled < HEALTH_MIN_REQUESTS {
            return true;
        }
        node.error_rate() <= HEALTH_MAX_ERROR_RATE && perf.ema_latency_ms <= HEALTH_MAX_EMA_MS
    }

    /// Pick the target node for one call, or fail fast with `NoCapacity`.
    pub fn select_node(&self) -> Result<Arc<ConnectedNode>, RelayError> {
        let candidates = self.registry.eligible_nodes(self.require_registration);
        if candidates.is_empty() {
            return Err(RelayError::NoCapacity);
        }

        let healthy: Vec<Arc<ConnectedNode>> = candidates
            .iter()
            .filter(|n| Self::is_healthy(n))
            .cloned()
            .collect();

        // Never block purely on health heuristics
        let mut ranked = if healthy.is_empty() { candidates } else { healthy };
        ranked.sort_by(|a, b| {
            Self::effective_latency(a)
                .partial_cmp(&Self::effective_latency(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let pool_size = (ranked.len() / 2).max(FAST_POOL_MIN).min(ranked.len());
        let pool = &ranked[..pool_size];

        let index = self.rr_index.fetch_add(1, Ordering::Relaxed) % pool.len();
        Ok(pool[index].clone())
    }

    /// Route one RPC call: select, forward, await the correlated response,
    /// fold the outcome into node and global statistics.
    pub async fn route(&self, payload: Value) -> Result<RoutedResponse, RelayError> {
        let node = match self.select_node() {
            Ok(node) => node,
            Err(e) => {
                metrics::NO_CAPACITY_TOTAL.inc();
                metrics::ROUTED_ERRORS.with_label_values(&["no_capacity"]).inc();
                return Err(e);
            }
        };

        metrics::ROUTED_REQUESTS.inc();
        let timer = metrics::Timer::new();

        let call_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        node.insert_pending(call_id.clone(), tx);

        if let Err(e) = node.send(WireMessage::RpcRequest {
            id: call_id.clone(),
            payload,
        }) {
            node.take_pending(&call_id);
            node.record_error();
            self.finish(&node, 0, true).await;
            metrics::ROUTED_ERRORS.with_label_values(&["disconnected"]).inc();
            return Err(e);
        }

        let sent_at = Instant::now();
        let outcome = match tokio::time::timeout(self.call_deadline, rx).await {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Ok(Err(e))) => {
                // Socket closed with the call in flight; failed promptly by
                // the registry rather than waiting out the deadline.
                node.record_error();
                self.finish(&node, 0, true).await;
                metrics::ROUTED_ERRORS.with_label_values(&["disconnected"]).inc();
                return Err(e);
            }
            Ok(Err(_)) => {
                node.take_pending(&call_id);
                node.record_error();
                self.finish(&node, 0, true).await;
                metrics::ROUTED_ERRORS.with_label_values(&["internal"]).inc();
                return Err(RelayError::Internal("pending call dropped".to_string()));
            }
            Err(_) => {
                // Deadline elapsed with no rpc_response. Still counts as an
                // attempt against the node; the socket stays open.
                node.take_pending(&call_id);
                node.record_error();
                self.finish(&node, 0, true).await;
                metrics::ROUTED_ERRORS.with_label_values(&["timeout"]).inc();
                warn!("Call {} to {} timed out", call_id, node.operator);
                return Err(RelayError::DispatchTimeout {
                    call_id,
                    deadline_ms: self.call_deadline.as_millis() as u64,
                });
            }
        };

        let latency_ms = sent_at.elapsed().as_millis() as u64;
        let is_error = outcome.error.is_some();

        if is_error {
            node.record_error();
            metrics::ROUTED_ERRORS.with_label_values(&["upstream"]).inc();
        } else {
            let capped = (latency_ms as f64).min(LATENCY_CAP_MS);
            node.record_success(capped, outcome.cached);
            if outcome.cached {
                metrics::CACHE_HITS.inc();
            } else {
                metrics::CACHE_MISSES.inc();
            }
        }

        let bytes = response_size(&outcome);
        self.finish(&node, bytes, is_error).await;
        timer.observe_duration_seconds(&metrics::ROUTE_LATENCY);

        debug!(
            "Routed call {} via {} in {}ms (cached: {})",
            call_id, node.operator, latency_ms, outcome.cached
        );

        Ok(RoutedResponse {
            result: outcome.result,
            error: outcome.error,
            node: node.display_name.clone(),
            operator: operator_prefix(&node.operator),
            latency_ms,
            cached: outcome.cached,
        })
    }

    /// Post-resolution bookkeeping shared by all exits: global counters and
    /// the merged wallet record.
    async fn finish(&self, node: &Arc<ConnectedNode>, bytes: u64, is_error: bool) {
        self.stats.record_request(bytes, is_error);
        self.registry.persist_session(node).await;
    }
}

fn operator_prefix(operator: &str) -> String {
    operator.chars().take(8).collect()
}

fn response_size(outcome: &RpcOutcome) -> u64 {
    let result_len = outcome
        .result
        .as_ref()
        .and_then(|v| serde_json::to_vec(v).ok())
        .map(|v| v.len())
        .unwrap_or(0);
    let error_len = outcome
        .error
        .as_ref()
        .and_then(|v| serde_json::to_vec(v).ok())
        .map(|v| v.len())
        .unwrap_or(0);
    (result_len + error_len) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistrationState;
    use crate::stats::StatsService;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    async fn test_router() -> (Router, Arc<ConnectionRegistry>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(
            StatsService::open(&dir.path().join("sled"), &dir.path().join("fb.json"), 0)
                .await
                .unwrap(),
        );
        let registry = Arc::new(ConnectionRegistry::new(stats.clone()));
        let router = Router::new(registry.clone(), stats, true, Duration::from_millis(200));
        (router, registry, dir)
    }

    async fn admit_active(
        registry: &ConnectionRegistry,
        operator: &str,
    ) -> (Arc<ConnectedNode>, mpsc::UnboundedReceiver<WireMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let node = registry
            .admit(operator, operator, "1.1.1.1:1", None, tx)
            .await;
        node.set_state(RegistrationState::RegisteredActive);
        (node, rx)
    }

    #[tokio::test]
    async fn test_empty_pool_fails_fast() {
        let (router, _registry, _dir) = test_router().await;
        let started = Instant::now();
        let err = router.route(serde_json::json!({"method": "getSlot"})).await;
        assert!(matches!(err, Err(RelayError::NoCapacity)));
        // No busy-wait: rejection is immediate
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_error_rate_filter_excludes_node() {
        let (router, registry, _dir) = test_router().await;

        // Node A: 10 requests, no errors, 50ms
        let (node_a, _rx_a) = admit_active(&registry, "operatorA").await;
        for _ in 0..10 {
            node_a.record_success(50.0, false);
        }

        // Node B: 10 requests, 4 errors, 40ms. Faster, but over the 30%
        // error-rate bound
        let (node_b, _rx_b) = admit_active(&registry, "operatorB").await;
        for _ in 0..6 {
            node_b.record_success(40.0, false);
        }
        for _ in 0..4 {
            node_b.record_error();
        }

        for _ in 0..20 {
            let selected = router.select_node().unwrap();
            assert_eq!(selected.operator, "operatorA");
        }
    }

    #[tokio::test]
    async fn test_latency_filter_excludes_slow_node() {
        let (router, registry, _dir) = test_router().await;

        let (fast, _rx1) = admit_active(&registry, "fast").await;
        for _ in 0..10 {
            fast.record_success(100.0, false);
        }

        let (slow, _rx2) = admit_active(&registry, "slow").await;
        for _ in 0..10 {
            slow.record_success(4_000.0, false);
        }

        for _ in 0..10 {
            assert_eq!(router.select_node().unwrap().operator, "fast");
        }
    }

    #[tokio::test]
    async fn test_all_unhealthy_falls_back_to_unfiltered() {
        let (router, registry, _dir) = test_router().await;

        let (node, _rx) = admit_active(&registry, "onlyone").await;
        for _ in 0..10 {
            node.record_error();
        }

        // 100% error rate, but it is the only node: never block purely on
        // health heuristics
        assert_eq!(router.select_node().unwrap().operator, "onlyone");
    }

    #[tokio::test]
    async fn test_round_robin_is_fair() {
        let (router, registry, _dir) = test_router().await;

        let mut receivers = Vec::new();
        for name in ["n1", "n2", "n3"] {
            let (_node, rx) = admit_active(&registry, name).await;
            receivers.push(rx);
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        let m = 30;
        for _ in 0..m {
            let node = router.select_node().unwrap();
            *counts.entry(node.operator.clone()).or_insert(0) += 1;
        }

        // K=3, M=30: each node gets exactly M/K selections
        assert_eq!(counts.len(), 3);
        for (_, count) in counts {
            assert_eq!(count, 10);
        }
    }

    #[tokio::test]
    async fn test_fast_pool_floor_of_three() {
        let (router, registry, _dir) = test_router().await;

        // Four nodes with distinct latencies; half would be 2, the floor
        // keeps 3 in rotation
        let latencies = [("a", 10.0), ("b", 20.0), ("c", 30.0), ("d", 4_500.0)];
        for (name, latency) in latencies {
            let (node, _rx) = admit_active(&registry, name).await;
            for _ in 0..10 {
                node.record_success(latency, false);
            }
        }

        let mut seen = std::collections::HashSet::new();
        for _ in 0..30 {
            seen.insert(router.select_node().unwrap().operator.clone());
        }
        assert_eq!(seen.len(), 3);
        assert!(!seen.contains("d"));
    }

    #[tokio::test]
    async fn test_route_timeout_counts_as_attempt() {
        let (router, registry, _dir) = test_router().await;
        let (node, mut rx) = admit_active(&registry, "silent").await;

        let started = Instant::now();
        let err = router.route(serde_json::json!({"method": "getSlot"})).await;
        let elapsed = started.elapsed();

        assert!(matches!(err, Err(RelayError::DispatchTimeout { .. })));
        // Deadline respected: not before, not long after
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(600));

        let perf = node.perf_snapshot();
        assert_eq!(perf.requests_handled, 1);
        assert_eq!(perf.errors, 1);

        // The request frame was actually sent
        assert!(matches!(rx.try_recv(), Ok(WireMessage::RpcRequest { .. })));
        // Pending entry was cleaned up
        assert_eq!(node.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_route_resolves_response() {
        let (router, registry, _dir) = test_router().await;
        let (node, mut rx) = admit_active(&registry, "operatorLongName").await;

        let node_clone = node.clone();
        tokio::spawn(async move {
            if let Some(WireMessage::RpcRequest { id, .. }) = rx.recv().await {
                if let Some(call) = node_clone.take_pending(&id) {
                    let _ = call.tx.send(Ok(RpcOutcome {
                        result: Some(serde_json::json!({"value": 42})),
                        error: None,
                        node_latency_ms: 5,
                        cached: true,
                    }));
                }
            }
        });

        let response = router
            .route(serde_json::json!({"method": "getBalance"}))
            .await
            .unwrap();

        assert_eq!(response.result, Some(serde_json::json!({"value": 42})));
        assert!(response.cached);
        assert_eq!(response.operator, "operator");

        let perf = node.perf_snapshot();
        assert_eq!(perf.requests_handled, 1);
        assert_eq!(perf.cache_hits, 1);
        assert_eq!(perf.errors, 0);
    }
}
