//! Health-Bucketed Cache
//!
//! Response cache for the node agent. Requests are keyed by method plus the
//! serialized parameter list; every method is classified before dispatch as
//! never-cacheable or cacheable with a per-method TTL tuned to how fast the
//! underlying data changes.
//!
//! Eviction is batched: once the entry count exceeds the ceiling the oldest
//! ~10% of entries (by insertion order) are dropped, which bounds memory at
//! O(1) amortized cost per insert instead of per-entry TTL sweeps.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Methods that are never cached regardless of TTL configuration.
/// Staleness on submission, simulation, signature-status and fee paths is
/// unacceptable.
pub static NEVER_CACHE: &[&str] = &[
    "sendTransaction",
    "simulateTransaction",
    "getSignatureStatuses",
    "getFeeForMessage",
    "getRecentPrioritizationFees",
    "requestAirdrop",
];

/// Per-method TTLs in milliseconds. Sub-second for slot/blockhash queries,
/// a few seconds for account state, minutes for slow-moving or immutable
/// data. Unlisted methods use the configured default.
static METHOD_TTLS_MS: Lazy<HashMap<&'static str, u64>> = Lazy::new(|| {
    [
        ("getSlot", 400),
        ("getBlockHeight", 400),
        ("getLatestBlockhash", 400),
        ("getBalance", 2_000),
        ("getAccountInfo", 2_000),
        ("getTokenAccountBalance", 2_000),
        ("getMultipleAccounts", 2_000),
        ("getProgramAccounts", 5_000),
        ("getTokenAccountsByOwner", 5_000),
        ("getEpochInfo", 30_000),
        ("getBlock", 60_000),
        ("getBlockTime", 60_000),
        ("getVersion", 300_000),
        ("getGenesisHash", 3_600_000),
    ]
    .iter()
    .copied()
    .collect()
});

/// Cacheability of one RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Never,
    Ttl(Duration),
}

/// Classify a method before dispatch.
pub fn classify_method(method: &str, default_ttl: Duration) -> CachePolicy {
    if NEVER_CACHE.contains(&method) {
        return CachePolicy::Never;
    }
    match METHOD_TTLS_MS.get(method) {
        Some(&ms) => CachePolicy::Ttl(Duration::from_millis(ms)),
        None => CachePolicy::Ttl(default_ttl),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    Hit,
    Miss,
}

/// One line of the local observability log.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLogEntry {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub latency_ms: u64,
    pub source: CacheSource,
}

struct CacheEntry {
    value: Value,
    inserted_at: Instant,
    bytes: usize,
    /// Insertion sequence; lets the eviction queue skip entries that were
    /// overwritten after being enqueued.
    seq: u64,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Insertion order as (key, seq) pairs.
    order: VecDeque<(String, u64)>,
    next_seq: u64,
}

/// Size-bounded response cache with per-method TTLs.
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    max_entries: usize,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_seq: 0,
            }),
            max_entries,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn key(method: &str, params: &Value) -> String {
        format!("{}:{}", method, params)
    }

    /// Look up a cached response. A hit requires an entry under the exact
    /// method+params key that is still inside its method TTL.
    pub fn lookup(&self, method: &str, params: &Value) -> Option<Value> {
        let ttl = match classify_method(method, self.default_ttl) {
            CachePolicy::Never => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            CachePolicy::Ttl(ttl) => ttl,
        };

        let key = Self::key(method, params);
        let inner = self.inner.lock().expect("cache lock");
        match inner.entries.get(&key) {
            Some(entry) if entry.inserted_at.elapsed() < ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a successful upstream response. Error responses must not be
    /// cached; callers only invoke this on success.
    pub fn store(&self, method: &str, params: &Value, value: Value) {
        if matches!(classify_method(method, self.default_ttl), CachePolicy::Never) {
            return;
        }

        let key = Self::key(method, params);
        let bytes = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);

        let mut inner = self.inner.lock().expect("cache lock");
        let seq = inner.next_seq;
        inner.next_seq += 1;

        inner.entries.insert(
            key.clone(),
            CacheEntry { value, inserted_at: Instant::now(), bytes, seq },
        );
        inner.order.push_back((key, seq));

        if inner.entries.len() > self.max_entries {
            Self::evict_oldest(&mut inner, self.max_entries);
        }
    }

    /// Drop the oldest ~10% of live entries by insertion order.
    fn evict_oldest(inner: &mut CacheInner, max_entries: usize) {
        let target = (max_entries / 10).max(1);
        let mut removed = 0;

        while removed < target {
            let Some((key, seq)) = inner.order.pop_front() else {
                break;
            };
            // Skip queue entries superseded by a later insert of the same key
            let is_live = inner.entries.get(&key).map(|e| e.seq == seq).unwrap_or(false);
            if is_live {
                inner.entries.remove(&key);
                removed += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        let inner = self.inner.lock().expect("cache lock");
        inner.entries.values().map(|e| e.bytes).sum()
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Fixed-size rolling window of recent requests, for local observability.
pub struct RequestLog {
    entries: Mutex<VecDeque<RequestLogEntry>>,
    capacity: usize,
}

impl RequestLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, method: &str, latency_ms: u64, source: CacheSource) {
        let mut entries = self.entries.lock().expect("request log lock");
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(RequestLogEntry {
            timestamp: Utc::now(),
            method: method.to_string(),
            latency_ms,
            source,
        });
    }

    pub fn snapshot(&self) -> Vec<RequestLogEntry> {
        self.entries.lock().expect("request log lock").iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("request log lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DEFAULT_TTL: Duration = Duration::from_secs(2);

    #[test]
    fn test_classification() {
        assert_eq!(classify_method("sendTransaction", DEFAULT_TTL), CachePolicy::Never);
        assert_eq!(classify_method("simulateTransaction", DEFAULT_TTL), CachePolicy::Never);
        assert_eq!(
            classify_method("getSlot", DEFAULT_TTL),
            CachePolicy::Ttl(Duration::from_millis(400))
        );
        assert_eq!(
            classify_method("getGenesisHash", DEFAULT_TTL),
            CachePolicy::Ttl(Duration::from_secs(3600))
        );
        // Unlisted methods take the default bucket
        assert_eq!(
            classify_method("getSomethingNew", DEFAULT_TTL),
            CachePolicy::Ttl(DEFAULT_TTL)
        );
    }

    #[test]
    fn test_hit_within_ttl() {
        let cache = ResponseCache::new(100, DEFAULT_TTL);
        let params = json!([ "addr1" ]);

        assert!(cache.lookup("getBalance", &params).is_none());
        cache.store("getBalance", &params, json!({"value": 10}));

        let hit = cache.lookup("getBalance", &params).unwrap();
        assert_eq!(hit, json!({"value": 10}));
        assert_eq!(cache.hit_count(), 1);
        assert_eq!(cache.miss_count(), 1);
    }

    #[test]
    fn test_distinct_params_are_distinct_keys() {
        let cache = ResponseCache::new(100, DEFAULT_TTL);
        cache.store("getBalance", &json!(["addr1"]), json!(1));
        cache.store("getBalance", &json!(["addr2"]), json!(2));

        assert_eq!(cache.lookup("getBalance", &json!(["addr1"])), Some(json!(1)));
        assert_eq!(cache.lookup("getBalance", &json!(["addr2"])), Some(json!(2)));
        assert!(cache.lookup("getBalance", &json!(["addr3"])).is_none());
    }

    #[test]
    fn test_expired_entry_misses() {
        let cache = ResponseCache::new(100, DEFAULT_TTL);
        let params = json!([]);
        cache.store("getSlot", &params, json!(100));

        // getSlot has a 400ms TTL
        std::thread::sleep(Duration::from_millis(450));
        assert!(cache.lookup("getSlot", &params).is_none());
    }

    #[test]
    fn test_never_cache_methods_never_hit() {
        let cache = ResponseCache::new(100, Duration::from_secs(3600));
        let params = json!(["signedtx"]);

        cache.store("sendTransaction", &params, json!("sig"));
        for _ in 0..5 {
            assert!(cache.lookup("sendTransaction", &params).is_none());
        }
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_eviction_removes_oldest_tenth() {
        let cache = ResponseCache::new(100, DEFAULT_TTL);
        for i in 0..101 {
            cache.store("getAccountInfo", &json!([i]), json!(i));
        }

        // Ceiling exceeded at 101 entries: the oldest 10 are dropped
        assert_eq!(cache.len(), 91);
        assert!(cache.lookup("getAccountInfo", &json!([0])).is_none());
        assert!(cache.lookup("getAccountInfo", &json!([9])).is_none());
        assert!(cache.lookup("getAccountInfo", &json!([10])).is_some());
        assert!(cache.lookup("getAccountInfo", &json!([100])).is_some());
    }

    #[test]
    fn test_eviction_skips_overwritten_entries() {
        let cache = ResponseCache::new(10, DEFAULT_TTL);
        // Insert key 0 then overwrite it; the stale queue slot must not
        // evict the refreshed entry ahead of genuinely older keys
        cache.store("getBalance", &json!([0]), json!("old"));
        for i in 1..10 {
            cache.store("getBalance", &json!([i]), json!(i));
        }
        cache.store("getBalance", &json!([0]), json!("new"));
        cache.store("getBalance", &json!([10]), json!(10));

        assert_eq!(cache.lookup("getBalance", &json!([0])), Some(json!("new")));
        // Key 1 was the oldest live entry and is gone
        assert!(cache.lookup("getBalance", &json!([1])).is_none());
    }

    #[test]
    fn test_request_log_rolls_over() {
        let log = RequestLog::new(3);
        for i in 0..5 {
            log.record("getSlot", i, CacheSource::Miss);
        }

        let entries = log.snapshot();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].latency_ms, 2);
        assert_eq!(entries[2].latency_ms, 4);
    }
}
