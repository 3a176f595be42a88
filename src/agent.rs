//! Node Agent Failover Engine
//!
//! Maintains one long-lived relay connection, serving forwarded RPC calls
//! from the local response cache with upstream fill. Relay endpoints are
//! tried nearest-first; reconnects use exponential backoff with endpoint
//! rotation, and a watchdog rotates away from a relay that has gone silent
//! even when no close event fired.
//!
//! The agent never terminates the process on an internal fault: every error
//! is logged and a reconnect is scheduled instead.

use crate::auth;
use crate::cache::{CacheSource, RequestLog, ResponseCache};
use crate::config::{AgentConfig, RelayEndpoint};
use crate::error::RelayError;
use crate::geo;
use crate::messages::WireMessage;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// No heartbeat for this long means the link is stale and the agent rotates
/// to the next relay proactively.
pub const PING_SILENCE_SECS: u64 = 60;
/// Disconnected with no activity for this long forces a fresh attempt
/// regardless of backoff state.
pub const STALL_SECS: u64 = 120;

/// Endpoint rotation and backoff state. Pure state machine, no I/O.
pub struct FailoverState {
    endpoints: Vec<RelayEndpoint>,
    current: usize,
    consecutive_failures: u32,
    max_failures: u32,
}

impl FailoverState {
    pub fn new(endpoints: Vec<RelayEndpoint>, max_failures: u32) -> Self {
        Self {
            endpoints,
            current: 0,
            consecutive_failures: 0,
            max_failures: max_failures.max(1),
        }
    }

    pub fn current_endpoint(&self) -> &RelayEndpoint {
        &self.endpoints[self.current]
    }

    /// Advance to the next endpoint (wrapping) and reset the failure
    /// counter for the new target.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.endpoints.len();
        self.consecutive_failures = 0;
    }

    /// Record a failed attempt against the current endpoint. Returns true
    /// when the failure budget was exhausted and the state advanced.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.max_failures {
            self.advance();
            true
        } else {
            false
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Exponential backoff: `min(base * 2^(failures-1), cap)`.
    pub fn backoff_delay(&self, base: Duration, cap: Duration) -> Duration {
        if self.consecutive_failures == 0 {
            return base;
        }
        let exponent = (self.consecutive_failures - 1).min(16);
        let delay = base.saturating_mul(1u32 << exponent);
        delay.min(cap)
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }
}

/// How a relay session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Socket closed by the relay or the network.
    Closed,
    /// Watchdog fired: connected but no ping for PING_SILENCE_SECS.
    Stale,
    /// Hub refused the register frame; retrying the same frame is pointless
    /// until configuration changes, so rotate away.
    AuthRejected,
}

pub struct Agent {
    config: AgentConfig,
    cache: Arc<ResponseCache>,
    request_log: Arc<RequestLog>,
    upstream: reqwest::Client,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let cache = Arc::new(ResponseCache::new(
            config.cache_config.max_entries,
            Duration::from_millis(config.cache_config.default_ttl_ms),
        ));
        let request_log = Arc::new(RequestLog::new(config.cache_config.request_log_size));
        Self {
            config,
            cache,
            request_log,
            upstream: reqwest::Client::new(),
        }
    }

    pub fn cache(&self) -> Arc<ResponseCache> {
        self.cache.clone()
    }

    pub fn request_log(&self) -> Arc<RequestLog> {
        self.request_log.clone()
    }

    /// Main loop: order endpoints by proximity, then connect/serve/reconnect
    /// forever.
    pub async fn run(&self) {
        let region = geo::fetch_and_set_node_region().await;
        let ordered = geo::order_endpoints(&region, &self.config.relay_endpoints);
        info!(
            "Relay endpoints ordered for region {}: {:?}",
            region,
            ordered.iter().map(|e| e.url.as_str()).collect::<Vec<_>>()
        );

        let mut failover = FailoverState::new(ordered, self.config.max_failures_per_endpoint);
        let mut last_activity = Instant::now();

        loop {
            let endpoint = failover.current_endpoint().clone();
            info!("Connecting to relay {} ({})", endpoint.url, endpoint.region);

            match self.serve_connection(&endpoint, &region).await {
                Ok(SessionEnd::Stale) => {
                    warn!("Relay {} went silent; rotating immediately", endpoint.url);
                    failover.advance();
                    last_activity = Instant::now();
                    continue;
                }
                Ok(SessionEnd::AuthRejected) => {
                    warn!("Relay {} rejected registration; rotating", endpoint.url);
                    failover.advance();
                }
                Ok(SessionEnd::Closed) => {
                    info!("Relay connection to {} closed", endpoint.url);
                    last_activity = Instant::now();
                    failover.record_success();
                    failover.record_failure();
                }
                Err(e) => {
                    warn!("Relay connection to {} failed: {}", endpoint.url, e);
                    let advanced = failover.record_failure();
                    if advanced {
                        info!("Advancing to relay {}", failover.current_endpoint().url);
                    }
                }
            }

            let mut delay =
                failover.backoff_delay(self.config.backoff_base, self.config.backoff_cap);

            // Permanent-stall guard: never sit disconnected past STALL_SECS.
            // Rearmed after firing so it caps the wait instead of disabling
            // backoff outright.
            let idle = last_activity.elapsed();
            let stall_budget = Duration::from_secs(STALL_SECS);
            if idle >= stall_budget {
                delay = Duration::ZERO;
                last_activity = Instant::now();
            } else if idle + delay > stall_budget {
                delay = stall_budget - idle;
            }

            debug!("Reconnecting in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// One relay session: connect, register, serve frames until the socket
    /// closes or the ping watchdog fires.
    async fn serve_connection(
        &self,
        endpoint: &RelayEndpoint,
        region: &str,
    ) -> Result<SessionEnd, RelayError> {
        let (socket, _) = connect_async(endpoint.url.as_str())
            .await
            .map_err(|e| RelayError::Transport(format!("connect {}: {}", endpoint.url, e)))?;
        let (mut writer, mut reader) = socket.split();

        // Single writer task; handlers queue frames through the channel.
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WireMessage>();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if writer.send(Message::Text(frame.to_json())).await.is_err() {
                    break;
                }
            }
            // Channel closed: flush and drop the writer half
            let _ = writer.close().await;
        });

        let timestamp = Utc::now().timestamp();
        let signature = match &self.config.secret_key {
            Some(secret) => auth::sign_register(secret, &self.config.wallet, timestamp)
                .map_err(|e| RelayError::Auth(e.to_string()))?,
            // Without a key, send a placeholder that passes the hub's
            // format-only policy.
            None => "0".repeat(128),
        };

        outbound_tx
            .send(WireMessage::Register {
                wallet: self.config.wallet.clone(),
                display_name: self.config.display_name.clone(),
                timestamp,
                signature,
                region: Some(region.to_string()),
            })
            .map_err(|_| RelayError::Transport("writer task gone".to_string()))?;

        // Shared with the watchdog: seconds-resolution time of last hub ping
        let last_ping = Arc::new(AtomicU64::new(now_secs()));
        let mut watchdog = tokio::time::interval(Duration::from_secs(5));
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                frame = reader.next() => {
                    match frame {
                        None => break SessionEnd::Closed,
                        Some(Err(e)) => {
                            warn!("Relay socket error: {}", e);
                            break SessionEnd::Closed;
                        }
                        Some(Ok(Message::Text(text))) => {
                            match WireMessage::from_json(&text) {
                                Ok(message) => {
                                    if let Some(end) = self.handle_frame(message, &outbound_tx, &last_ping) {
                                        break end;
                                    }
                                }
                                Err(e) => warn!("Unparseable frame from relay: {}", e),
                            }
                        }
                        Some(Ok(Message::Close(_))) => break SessionEnd::Closed,
                        Some(Ok(_)) => {} // binary/ping/pong frames: transport-level, ignore
                    }
                }
                _ = watchdog.tick() => {
                    let silent = now_secs().saturating_sub(last_ping.load(Ordering::Relaxed));
                    if silent > PING_SILENCE_SECS {
                        break SessionEnd::Stale;
                    }
                }
            }
        };

        drop(outbound_tx);
        writer_task.abort();
        Ok(end)
    }

    /// Dispatch one hub frame. Returns Some(end) when the session is over.
    fn handle_frame(
        &self,
        message: WireMessage,
        outbound: &mpsc::UnboundedSender<WireMessage>,
        last_ping: &Arc<AtomicU64>,
    ) -> Option<SessionEnd> {
        match message {
            WireMessage::Registered { bond_amount, .. } => {
                info!("Registered with relay (bond: {})", bond_amount);
                last_ping.store(now_secs(), Ordering::Relaxed);
                None
            }
            WireMessage::NotRegistered { reason } => {
                // Socket stays open; the hub routes nothing our way until
                // the wallet is bonded.
                warn!("Not eligible for traffic: {}", reason);
                last_ping.store(now_secs(), Ordering::Relaxed);
                None
            }
            WireMessage::AuthFailed { reason } => {
                error!("Registration refused: {}", reason);
                Some(SessionEnd::AuthRejected)
            }
            WireMessage::Ping => {
                last_ping.store(now_secs(), Ordering::Relaxed);
                let _ = outbound.send(WireMessage::Pong);
                None
            }
            WireMessage::RpcRequest { id, payload } => {
                // Serve concurrently; many cache fills may be in flight
                // while the reader keeps draining the socket.
                let cache = self.cache.clone();
                let request_log = self.request_log.clone();
                let upstream = self.upstream.clone();
                let upstream_url = self.config.upstream_url.clone();
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let response =
                        handle_rpc_request(id, payload, cache, request_log, upstream, upstream_url)
                            .await;
                    let _ = outbound.send(response);
                });
                None
            }
            // Frames the hub should not send to a node; ignore them.
            other => {
                debug!("Ignoring unexpected frame: {:?}", other);
                None
            }
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Serve one forwarded call: cache lookup, upstream fill on miss, cache
/// population on success only.
async fn handle_rpc_request(
    id: String,
    payload: Value,
    cache: Arc<ResponseCache>,
    request_log: Arc<RequestLog>,
    upstream: reqwest::Client,
    upstream_url: String,
) -> WireMessage {
    let started = Instant::now();
    let method = payload
        .get("method")
        .and_then(|m| m.as_str())
        .unwrap_or("")
        .to_string();
    let params = payload.get("params").cloned().unwrap_or(Value::Null);

    if let Some(cached) = cache.lookup(&method, &params) {
        let latency_ms = started.elapsed().as_millis() as u64;
        request_log.record(&method, latency_ms, CacheSource::Hit);
        return WireMessage::RpcResponse {
            id,
            result: Some(cached),
            error: None,
            latency_ms,
            cached: true,
        };
    }

    let (result, error) = match call_upstream(&upstream, &upstream_url, &payload).await {
        Ok(envelope) => {
            let result = envelope.get("result").cloned();
            let error = envelope.get("error").cloned();
            // Only successful responses populate the cache
            if error.is_none() {
                if let Some(ref value) = result {
                    cache.store(&method, &params, value.clone());
                }
            }
            (result, error)
        }
        Err(e) => {
            warn!("Upstream call for {} failed: {}", method, e);
            (None, Some(json!({"code": -32000, "message": e.to_string()})))
        }
    };

    let latency_ms = started.elapsed().as_millis() as u64;
    request_log.record(&method, latency_ms, CacheSource::Miss);
    WireMessage::RpcResponse { id, result, error, latency_ms, cached: false }
}

async fn call_upstream(
    client: &reqwest::Client,
    url: &str,
    payload: &Value,
) -> Result<Value, RelayError> {
    let response = client
        .post(url)
        .json(payload)
        .timeout(Duration::from_secs(25))
        .send()
        .await
        .map_err(|e| RelayError::Upstream(format!("request: {}", e)))?;

    if !response.status().is_success() {
        return Err(RelayError::Upstream(format!("status {}", response.status())));
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| RelayError::Upstream(format!("decode: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(n: usize) -> Vec<RelayEndpoint> {
        (0..n)
            .map(|i| RelayEndpoint {
                url: format!("ws://relay-{}.example/ws", i),
                region: "us-east-1".to_string(),
            })
            .collect()
    }

    #[test]
    fn test_backoff_doubles_with_cap() {
        let mut state = FailoverState::new(endpoints(2), 10);
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);

        assert_eq!(state.backoff_delay(base, cap), Duration::from_secs(1));

        state.record_failure();
        assert_eq!(state.backoff_delay(base, cap), Duration::from_secs(1));
        state.record_failure();
        assert_eq!(state.backoff_delay(base, cap), Duration::from_secs(2));
        state.record_failure();
        assert_eq!(state.backoff_delay(base, cap), Duration::from_secs(4));

        for _ in 0..6 {
            state.record_failure();
        }
        assert_eq!(state.backoff_delay(base, cap), cap);
    }

    #[test]
    fn test_endpoint_advance_after_budget() {
        let mut state = FailoverState::new(endpoints(3), 3);
        assert_eq!(state.current_endpoint().url, "ws://relay-0.example/ws");

        assert!(!state.record_failure());
        assert!(!state.record_failure());
        // Third consecutive failure advances and resets the counter
        assert!(state.record_failure());
        assert_eq!(state.current_endpoint().url, "ws://relay-1.example/ws");
        assert_eq!(state.failure_count(), 0);
    }

    #[test]
    fn test_advance_wraps() {
        let mut state = FailoverState::new(endpoints(2), 1);
        state.advance();
        assert_eq!(state.current_endpoint().url, "ws://relay-1.example/ws");
        state.advance();
        assert_eq!(state.current_endpoint().url, "ws://relay-0.example/ws");
    }

    #[test]
    fn test_success_resets_failures() {
        let mut state = FailoverState::new(endpoints(2), 5);
        state.record_failure();
        state.record_failure();
        state.record_success();
        assert_eq!(state.failure_count(), 0);
        assert_eq!(
            state.backoff_delay(Duration::from_secs(1), Duration::from_secs(60)),
            Duration::from_secs(1)
        );
    }
}
