//! On-Chain Registry Verifier.
//!
//! The chain itself is an external collaborator: the hub only consumes a
//! read-only "is this operator bonded and active" lookup. Lookups are cached
//! with a coarse TTL to bound RPC cost; bond state moves on the order of
//! epochs, not requests.

use crate::config::ChainConfig;
use crate::error::RelayError;
use crate::metrics;
use async_trait::async_trait;
use dashmap::DashMap;
use moka::future::Cache as MokaCache;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// On-chain mirror of an operator's registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnChainInfo {
    #[serde(rename = "bondAmount")]
    pub bond_amount: f64,
    #[serde(rename = "pendingEarnings", default)]
    pub pending_earnings: f64,
    #[serde(rename = "totalEarned", default)]
    pub total_earned: f64,
    #[serde(rename = "isActive")]
    pub is_active: bool,
}

impl OnChainInfo {
    /// Bonded and active: eligible for routed traffic.
    pub fn is_eligible(&self) -> bool {
        self.is_active && self.bond_amount > 0.0
    }
}

#[async_trait]
pub trait RegistryVerifier: Send + Sync {
    /// Look up an operator. `Ok(None)` means the wallet is unknown on-chain.
    async fn lookup(&self, operator: &str) -> Result<Option<OnChainInfo>, RelayError>;
}

/// HTTP implementation querying the registry service.
pub struct HttpRegistryVerifier {
    client: reqwest::Client,
    registry_url: String,
}

impl HttpRegistryVerifier {
    pub fn new(registry_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            registry_url,
        }
    }
}

#[async_trait]
impl RegistryVerifier for HttpRegistryVerifier {
    async fn lookup(&self, operator: &str) -> Result<Option<OnChainInfo>, RelayError> {
        let url = format!("{}/operators/{}", self.registry_url.trim_end_matches('/'), operator);
        debug!("Fetching on-chain registry entry for {}", operator);

        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| RelayError::Transport(format!("registry lookup failed: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("Operator not found in registry: {}", operator);
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(RelayError::Transport(format!(
                "registry returned status {}",
                response.status()
            )));
        }

        let info: OnChainInfo = response
            .json()
            .await
            .map_err(|e| RelayError::Transport(format!("registry response parse: {}", e)))?;

        Ok(Some(info))
    }
}

/// TTL-caching decorator around any verifier. A cached entry (including a
/// cached not-found) is served until the TTL lapses; lookup errors are not
/// cached so a flaky registry recovers on the next call.
pub struct CachedVerifier {
    inner: Arc<dyn RegistryVerifier>,
    cache: MokaCache<String, Option<OnChainInfo>>,
}

impl CachedVerifier {
    pub fn new(inner: Arc<dyn RegistryVerifier>, ttl: Duration) -> Self {
        Self {
            inner,
            cache: MokaCache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Drop a cached entry so the next lookup hits the chain.
    pub async fn invalidate(&self, operator: &str) {
        self.cache.invalidate(operator).await;
    }
}

#[async_trait]
impl RegistryVerifier for CachedVerifier {
    async fn lookup(&self, operator: &str) -> Result<Option<OnChainInfo>, RelayError> {
        if let Some(cached) = self.cache.get(operator) {
            metrics::CHAIN_LOOKUPS.with_label_values(&["cache"]).inc();
            return Ok(cached);
        }

        metrics::CHAIN_LOOKUPS.with_label_values(&["chain"]).inc();
        let result = self.inner.lookup(operator).await?;
        self.cache.insert(operator.to_string(), result.clone()).await;
        Ok(result)
    }
}

/// In-memory verifier for local/dev operation and tests.
#[derive(Default)]
pub struct StaticVerifier {
    entries: DashMap<String, OnChainInfo>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, operator: &str, info: OnChainInfo) {
        self.entries.insert(operator.to_string(), info);
    }

    pub fn remove(&self, operator: &str) {
        self.entries.remove(operator);
    }
}

#[async_trait]
impl RegistryVerifier for StaticVerifier {
    async fn lookup(&self, operator: &str) -> Result<Option<OnChainInfo>, RelayError> {
        Ok(self.entries.get(operator).map(|e| e.clone()))
    }
}

/// Build the verifier stack from hub configuration: HTTP behind a TTL cache
/// when a registry is configured, otherwise an empty static verifier (every
/// wallet resolves to not-found).
pub fn build_verifier(chain_config: Option<&ChainConfig>) -> Arc<dyn RegistryVerifier> {
    match chain_config {
        Some(config) => {
            let http = Arc::new(HttpRegistryVerifier::new(config.registry_url.clone()));
            Arc::new(CachedVerifier::new(
                http,
                Duration::from_secs(config.lookup_ttl_secs),
            ))
        }
        None => {
            warn!("No CHAIN_REGISTRY_URL configured; all wallets will resolve as unregistered");
            Arc::new(StaticVerifier::new())
        }
    }
}
