use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Router metrics
    pub static ref ROUTED_REQUESTS: IntCounter = IntCounter::new(
        "routed_requests_total",
        "Total number of RPC calls routed to nodes"
    ).unwrap();

    pub static ref ROUTED_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("routed_errors_total", "Total routed call failures by kind"),
        &["kind"]
    ).unwrap();

    pub static ref ROUTE_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "route_duration_seconds",
            "End-to-end routed call latency in seconds"
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    ).unwrap();

    pub static ref NO_CAPACITY_TOTAL: IntCounter = IntCounter::new(
        "no_capacity_total",
        "Routed calls rejected because no eligible node was connected"
    ).unwrap();

    // Connection metrics
    pub static ref NODES_CONNECTED: IntGauge = IntGauge::new(
        "nodes_connected",
        "Current number of connected cache nodes"
    ).unwrap();

    pub static ref NODES_ACTIVE: IntGauge = IntGauge::new(
        "nodes_active",
        "Current number of registered, bonded nodes eligible for traffic"
    ).unwrap();

    pub static ref REGISTRATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("registrations_total", "Node registration outcomes"),
        &["outcome"]
    ).unwrap();

    pub static ref CONNECTIONS_REPLACED: IntCounter = IntCounter::new(
        "connections_replaced_total",
        "Connections closed because the same operator reconnected"
    ).unwrap();

    // Cache metrics (reported by nodes in rpc_response frames)
    pub static ref CACHE_HITS: IntCounter = IntCounter::new(
        "cache_hits_total",
        "Total number of node cache hits"
    ).unwrap();

    pub static ref CACHE_MISSES: IntCounter = IntCounter::new(
        "cache_misses_total",
        "Total number of node cache misses"
    ).unwrap();

    // Stats persistence metrics
    pub static ref STATS_FLUSHES: IntCounterVec = IntCounterVec::new(
        Opts::new("stats_flushes_total", "Durable stats flushes by table"),
        &["table"]
    ).unwrap();

    pub static ref STATS_FALLBACK_WRITES: IntCounter = IntCounter::new(
        "stats_fallback_writes_total",
        "Writes that went to the flat-file fallback store"
    ).unwrap();

    // Chain verifier metrics
    pub static ref CHAIN_LOOKUPS: IntCounterVec = IntCounterVec::new(
        Opts::new("chain_lookups_total", "On-chain registry lookups by source"),
        &["source"]
    ).unwrap();
}

/// Initialize metrics registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(ROUTED_REQUESTS.clone())).unwrap();
    REGISTRY.register(Box::new(ROUTED_ERRORS.clone())).unwrap();
    REGISTRY.register(Box::new(ROUTE_LATENCY.clone())).unwrap();
    REGISTRY.register(Box::new(NO_CAPACITY_TOTAL.clone())).unwrap();

    REGISTRY.register(Box::new(NODES_CONNECTED.clone())).unwrap();
    REGISTRY.register(Box::new(NODES_ACTIVE.clone())).unwrap();
    REGISTRY.register(Box::new(REGISTRATIONS.clone())).unwrap();
    REGISTRY.register(Box::new(CONNECTIONS_REPLACED.clone())).unwrap();

    REGISTRY.register(Box::new(CACHE_HITS.clone())).unwrap();
    REGISTRY.register(Box::new(CACHE_MISSES.clone())).unwrap();

    REGISTRY.register(Box::new(STATS_FLUSHES.clone())).unwrap();
    REGISTRY.register(Box::new(STATS_FALLBACK_WRITES.clone())).unwrap();

    REGISTRY.register(Box::new(CHAIN_LOOKUPS.clone())).unwrap();

    tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn observe_duration_seconds(&self, histogram: &Histogram) {
        let duration = self.start.elapsed();
        histogram.observe(duration.as_secs_f64());
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
