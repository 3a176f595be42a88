//! Stats Persistence Layer
//!
//! Durable, monotonic per-wallet counters and a single global counter row.
//! Writes happen immediately after every routed request, on a fixed timer as
//! a safety net, and at graceful shutdown.
//!
//! Two interchangeable backends sit behind [`StatsStore`]: sled (primary)
//! and a flat JSON file (fallback). [`StatsService`] selects sled at startup
//! and falls over to the file store on write failure so stats are never
//! silently lost.

use crate::error::RelayError;
use crate::metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// New-sample weight for every latency EMA fold in the hub. The source
/// implementation used 0.8/0.2 and 0.7/0.3 at different call sites; this
/// crate uses one constant throughout.
pub const EMA_ALPHA: f64 = 0.2;

/// Point-in-time snapshot of a connection's performance counters, produced
/// by the registry when merging a session into durable stats.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub requests_handled: u64,
    pub ema_latency_ms: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub errors: u64,
}

/// Cumulative per-operator statistics. Counters never decrease across the
/// wallet's lifetime; the only sanctioned exception is the source-address
/// reset of `ema_latency_ms` and `errors` (a change of physical node under
/// the same wallet must not inherit the old node's penalties).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletStats {
    pub requests_handled: u64,
    pub ema_latency_ms: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub errors: u64,
    pub total_uptime_seconds: u64,
    pub last_disconnect_at: Option<i64>,
    pub first_connect_at: Option<i64>,
    pub last_known_source_address: Option<String>,
}

impl WalletStats {
    /// Prepare the record for a new session. Returns true when the source
    /// address changed and the performance counters were reset.
    pub fn apply_reconnect(&mut self, source_address: &str, now: i64) -> bool {
        if self.first_connect_at.is_none() {
            self.first_connect_at = Some(now);
        }

        let address_changed = match self.last_known_source_address.as_deref() {
            Some(previous) => previous != source_address,
            None => false,
        };

        if address_changed {
            self.ema_latency_ms = 0.0;
            self.errors = 0;
        }
        self.last_known_source_address = Some(source_address.to_string());

        address_changed
    }

    /// Merge a live session snapshot. Counters take the maximum of existing
    /// vs. session values and never move downward. The latency EMA takes the
    /// session value: sessions are seeded from this record at connect, so the
    /// session figure is the continuation of the stored one.
    pub fn merge_session(&mut self, session: &SessionStats) {
        self.requests_handled = self.requests_handled.max(session.requests_handled);
        self.cache_hits = self.cache_hits.max(session.cache_hits);
        self.cache_misses = self.cache_misses.max(session.cache_misses);
        self.errors = self.errors.max(session.errors);
        self.ema_latency_ms = session.ema_latency_ms;
    }

    /// Close out a session: merge final counters and add the session's
    /// duration exactly once.
    pub fn finish_session(&mut self, session: &SessionStats, session_secs: u64, now: i64) {
        self.merge_session(session);
        self.total_uptime_seconds += session_secs;
        self.last_disconnect_at = Some(now);
    }

    /// Counters a new session starts from.
    pub fn seed_session(&self) -> SessionStats {
        SessionStats {
            requests_handled: self.requests_handled,
            ema_latency_ms: self.ema_latency_ms,
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            errors: self.errors,
        }
    }
}

/// Single durable global counter row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total_bytes_served: u64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub tracking_started_at: i64,
}

impl GlobalStats {
    pub fn new(now: i64) -> Self {
        Self {
            total_bytes_served: 0,
            total_requests: 0,
            total_errors: 0,
            tracking_started_at: now,
        }
    }
}

#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn load_wallet(&self, wallet: &str) -> Result<Option<WalletStats>, RelayError>;
    async fn save_wallet(&self, wallet: &str, stats: &WalletStats) -> Result<(), RelayError>;
    async fn list_wallets(&self) -> Result<Vec<(String, WalletStats)>, RelayError>;
    async fn load_global(&self) -> Result<Option<GlobalStats>, RelayError>;
    async fn save_global(&self, stats: &GlobalStats) -> Result<(), RelayError>;
}

// ============================================================================
// Sled backend (primary)
// ============================================================================

const GLOBAL_KEY: &[u8] = b"global";

pub struct SledStatsStore {
    wallet_tree: sled::Tree,
    global_tree: sled::Tree,
}

impl SledStatsStore {
    pub fn open(path: &Path) -> Result<Self, RelayError> {
        let db = sled::open(path)
            .map_err(|e| RelayError::Persistence(format!("sled open: {}", e)))?;
        let wallet_tree = db
            .open_tree("wallet_stats")
            .map_err(|e| RelayError::Persistence(format!("sled tree: {}", e)))?;
        let global_tree = db
            .open_tree("global_stats")
            .map_err(|e| RelayError::Persistence(format!("sled tree: {}", e)))?;
        Ok(Self { wallet_tree, global_tree })
    }
}

#[async_trait]
impl StatsStore for SledStatsStore {
    async fn load_wallet(&self, wallet: &str) -> Result<Option<WalletStats>, RelayError> {
        let value = self
            .wallet_tree
            .get(wallet.as_bytes())
            .map_err(|e| RelayError::Persistence(format!("sled get: {}", e)))?;
        match value {
            Some(bytes) => {
                let stats = bincode::deserialize(&bytes)
                    .map_err(|e| RelayError::Persistence(format!("decode wallet stats: {}", e)))?;
                Ok(Some(stats))
            }
            None => Ok(None),
        }
    }

    async fn save_wallet(&self, wallet: &str, stats: &WalletStats) -> Result<(), RelayError> {
        let bytes = bincode::serialize(stats)
            .map_err(|e| RelayError::Persistence(format!("encode wallet stats: {}", e)))?;
        self.wallet_tree
            .insert(wallet.as_bytes(), bytes)
            .map_err(|e| RelayError::Persistence(format!("sled insert: {}", e)))?;
        Ok(())
    }

    async fn list_wallets(&self) -> Result<Vec<(String, WalletStats)>, RelayError> {
        let mut wallets = Vec::new();
        for entry in self.wallet_tree.iter() {
            let (key, value) =
                entry.map_err(|e| RelayError::Persistence(format!("sled iter: {}", e)))?;
            let wallet = String::from_utf8_lossy(&key).to_string();
            let stats = bincode::deserialize(&value)
                .map_err(|e| RelayError::Persistence(format!("decode wallet stats: {}", e)))?;
            wallets.push((wallet, stats));
        }
        Ok(wallets)
    }

    async fn load_global(&self) -> Result<Option<GlobalStats>, RelayError> {
        let value = self
            .global_tree
            .get(GLOBAL_KEY)
            .map_err(|e| RelayError::Persistence(format!("sled get: {}", e)))?;
        match value {
            Some(bytes) => {
                let stats = bincode::deserialize(&bytes)
                    .map_err(|e| RelayError::Persistence(format!("decode global stats: {}", e)))?;
                Ok(Some(stats))
            }
            None => Ok(None),
        }
    }

    async fn save_global(&self, stats: &GlobalStats) -> Result<(), RelayError> {
        let bytes = bincode::serialize(stats)
            .map_err(|e| RelayError::Persistence(format!("encode global stats: {}", e)))?;
        self.global_tree
            .insert(GLOBAL_KEY, bytes)
            .map_err(|e| RelayError::Persistence(format!("sled insert: {}", e)))?;
        Ok(())
    }
}

// ============================================================================
// Flat-file backend (fallback)
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileState {
    wallets: HashMap<String, WalletStats>,
    global: Option<GlobalStats>,
}

/// JSON-file store with the same schema semantics as the sled backend. The
/// whole state is rewritten atomically (tmp file then rename) on every save.
pub struct FileStatsStore {
    path: PathBuf,
    state: Mutex<FileState>,
}

impl FileStatsStore {
    pub fn open(path: &Path) -> Result<Self, RelayError> {
        let state = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| RelayError::Persistence(format!("read {}: {}", path.display(), e)))?;
            serde_json::from_str(&text)
                .map_err(|e| RelayError::Persistence(format!("parse {}: {}", path.display(), e)))?
        } else {
            FileState::default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: &FileState) -> Result<(), RelayError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RelayError::Persistence(format!("mkdir: {}", e)))?;
        }
        let text = serde_json::to_string_pretty(state)
            .map_err(|e| RelayError::Persistence(format!("encode: {}", e)))?;

        // Atomic write: write to tmp file then rename
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, text)
            .map_err(|e| RelayError::Persistence(format!("write tmp: {}", e)))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| RelayError::Persistence(format!("rename: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl StatsStore for FileStatsStore {
    async fn load_wallet(&self, wallet: &str) -> Result<Option<WalletStats>, RelayError> {
        let state = self.state.lock().expect("stats file lock");
        Ok(state.wallets.get(wallet).cloned())
    }

    async fn save_wallet(&self, wallet: &str, stats: &WalletStats) -> Result<(), RelayError> {
        let mut state = self.state.lock().expect("stats file lock");
        state.wallets.insert(wallet.to_string(), stats.clone());
        self.persist(&state)
    }

    async fn list_wallets(&self) -> Result<Vec<(String, WalletStats)>, RelayError> {
        let state = self.state.lock().expect("stats file lock");
        Ok(state.wallets.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    async fn load_global(&self) -> Result<Option<GlobalStats>, RelayError> {
        let state = self.state.lock().expect("stats file lock");
        Ok(state.global.clone())
    }

    async fn save_global(&self, stats: &GlobalStats) -> Result<(), RelayError> {
        let mut state = self.state.lock().expect("stats file lock");
        state.global = Some(stats.clone());
        self.persist(&state)
    }
}

// ============================================================================
// StatsService: primary store with fallback
// ============================================================================

pub struct StatsService {
    primary: Box<dyn StatsStore>,
    fallback: FileStatsStore,
    global: Mutex<GlobalStats>,
}

impl StatsService {
    /// Open the sled primary, or run entirely on the flat file if sled is
    /// unavailable. The previously persisted global row is carried forward.
    pub async fn open(sled_path: &Path, fallback_path: &Path, now: i64) -> Result<Self, RelayError> {
        let fallback = FileStatsStore::open(fallback_path)?;

        let primary: Box<dyn StatsStore> = match SledStatsStore::open(sled_path) {
            Ok(store) => Box::new(store),
            Err(e) => {
                warn!("Primary stats store unavailable ({}); using flat-file store", e);
                Box::new(FileStatsStore::open(fallback_path)?)
            }
        };

        let global = match primary.load_global().await {
            Ok(Some(global)) => global,
            Ok(None) => match fallback.load_global().await? {
                Some(global) => global,
                None => GlobalStats::new(now),
            },
            Err(e) => {
                warn!("Failed to load global stats from primary: {}", e);
                fallback.load_global().await?.unwrap_or_else(|| GlobalStats::new(now))
            }
        };

        info!(
            "Stats service ready (tracking since {}, {} total requests)",
            global.tracking_started_at, global.total_requests
        );

        Ok(Self { primary, fallback, global: Mutex::new(global) })
    }

    pub async fn load_wallet(&self, wallet: &str) -> WalletStats {
        match self.primary.load_wallet(wallet).await {
            Ok(Some(stats)) => stats,
            Ok(None) => self
                .fallback
                .load_wallet(wallet)
                .await
                .ok()
                .flatten()
                .unwrap_or_default(),
            Err(e) => {
                warn!("Primary wallet-stats read failed for {}: {}", wallet, e);
                self.fallback
                    .load_wallet(wallet)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_default()
            }
        }
    }

    /// Persist a wallet record, falling back to the flat file on failure.
    /// Never returns an error to the hot path.
    pub async fn save_wallet(&self, wallet: &str, stats: &WalletStats) {
        metrics::STATS_FLUSHES.with_label_values(&["wallet"]).inc();
        if let Err(e) = self.primary.save_wallet(wallet, stats).await {
            warn!("Primary wallet-stats write failed for {}: {}", wallet, e);
            metrics::STATS_FALLBACK_WRITES.inc();
            if let Err(e) = self.fallback.save_wallet(wallet, stats).await {
                warn!("Fallback wallet-stats write failed for {}: {}", wallet, e);
            }
        }
    }

    pub async fn list_wallets(&self) -> Vec<(String, WalletStats)> {
        match self.primary.list_wallets().await {
            Ok(wallets) => wallets,
            Err(e) => {
                warn!("Primary wallet-stats list failed: {}", e);
                self.fallback.list_wallets().await.unwrap_or_default()
            }
        }
    }

    /// Fold one completed (or failed) routed request into the global row.
    pub fn record_request(&self, bytes: u64, is_error: bool) {
        let mut global = self.global.lock().expect("global stats lock");
        global.total_requests += 1;
        global.total_bytes_served += bytes;
        if is_error {
            global.total_errors += 1;
        }
    }

    pub fn global_snapshot(&self) -> GlobalStats {
        self.global.lock().expect("global stats lock").clone()
    }

    /// Persist the global row (interval timer and shutdown path).
    pub async fn flush_global(&self) {
        let snapshot = self.global_snapshot();
        metrics::STATS_FLUSHES.with_label_values(&["global"]).inc();
        if let Err(e) = self.primary.save_global(&snapshot).await {
            warn!("Primary global-stats write failed: {}", e);
            metrics::STATS_FALLBACK_WRITES.inc();
            if let Err(e) = self.fallback.save_global(&snapshot).await {
                warn!("Fallback global-stats write failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_never_decreases_counters() {
        let mut stats = WalletStats { requests_handled: 100, errors: 5, ..Default::default() };

        // A stale session snapshot cannot pull counters down
        stats.merge_session(&SessionStats { requests_handled: 40, errors: 2, ..Default::default() });
        assert_eq!(stats.requests_handled, 100);
        assert_eq!(stats.errors, 5);

        stats.merge_session(&SessionStats { requests_handled: 130, errors: 6, ..Default::default() });
        assert_eq!(stats.requests_handled, 130);
        assert_eq!(stats.errors, 6);
    }

    #[test]
    fn test_uptime_added_once_per_session() {
        let mut stats = WalletStats::default();
        let session = SessionStats::default();

        stats.finish_session(&session, 10, 1_000);
        stats.finish_session(&session, 25, 2_000);
        stats.finish_session(&session, 5, 3_000);

        assert_eq!(stats.total_uptime_seconds, 40);
        assert_eq!(stats.last_disconnect_at, Some(3_000));
    }

    #[test]
    fn test_reconnect_same_address_keeps_counters() {
        let mut stats = WalletStats {
            errors: 3,
            ema_latency_ms: 120.0,
            last_known_source_address: Some("1.2.3.4".to_string()),
            ..Default::default()
        };

        let reset = stats.apply_reconnect("1.2.3.4", 1_000);
        assert!(!reset);
        assert_eq!(stats.errors, 3);
        assert_eq!(stats.ema_latency_ms, 120.0);
    }

    #[test]
    fn test_reconnect_new_address_resets_penalties_only() {
        let mut stats = WalletStats {
            requests_handled: 500,
            cache_hits: 200,
            cache_misses: 300,
            errors: 9,
            ema_latency_ms: 4_000.0,
            total_uptime_seconds: 77,
            last_known_source_address: Some("1.2.3.4".to_string()),
            ..Default::default()
        };

        let reset = stats.apply_reconnect("5.6.7.8", 1_000);
        assert!(reset);
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.ema_latency_ms, 0.0);
        assert_eq!(stats.requests_handled, 500);
        assert_eq!(stats.cache_hits, 200);
        assert_eq!(stats.cache_misses, 300);
        assert_eq!(stats.total_uptime_seconds, 77);
        assert_eq!(stats.last_known_source_address.as_deref(), Some("5.6.7.8"));
    }

    #[tokio::test]
    async fn test_sled_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStatsStore::open(&dir.path().join("stats")).unwrap();

        assert!(store.load_wallet("w1").await.unwrap().is_none());

        let stats = WalletStats { requests_handled: 42, ..Default::default() };
        store.save_wallet("w1", &stats).await.unwrap();
        assert_eq!(store.load_wallet("w1").await.unwrap().unwrap().requests_handled, 42);

        let global = GlobalStats { total_requests: 7, ..GlobalStats::new(123) };
        store.save_global(&global).await.unwrap();
        assert_eq!(store.load_global().await.unwrap().unwrap().total_requests, 7);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");

        {
            let store = FileStatsStore::open(&path).unwrap();
            let stats = WalletStats { cache_hits: 11, ..Default::default() };
            store.save_wallet("w1", &stats).await.unwrap();
        }

        let store = FileStatsStore::open(&path).unwrap();
        assert_eq!(store.load_wallet("w1").await.unwrap().unwrap().cache_hits, 11);
    }

    #[tokio::test]
    async fn test_service_global_accumulation() {
        let dir = tempfile::tempdir().unwrap();
        let service = StatsService::open(
            &dir.path().join("sled"),
            &dir.path().join("fallback.json"),
            1_000,
        )
        .await
        .unwrap();

        service.record_request(100, false);
        service.record_request(250, true);

        let global = service.global_snapshot();
        assert_eq!(global.total_requests, 2);
        assert_eq!(global.total_bytes_served, 350);
        assert_eq!(global.total_errors, 1);

        service.flush_global().await;
    }
}
