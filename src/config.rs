use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Relay hub configuration, loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub api_host: String,
    pub api_port: u16,
    /// When false, unverified wallets are admitted for local/dev operation.
    pub require_registration: bool,
    /// "hex" (format-only check) or "ed25519" (real verification).
    pub signature_mode: String,
    pub chain_config: Option<ChainConfig>,
    pub stats_config: StatsConfig,
    pub heartbeat_interval_secs: u64,
    pub call_deadline_secs: u64,
}

/// On-chain registry endpoint used by the hub's verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub registry_url: String,
    /// Coarse TTL on verifier lookups to bound RPC cost.
    pub lookup_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Sled database path for the primary stats store.
    pub sled_path: String,
    /// Flat-file fallback path used when sled is unavailable.
    pub fallback_path: String,
    pub wallet_flush_interval_secs: u64,
    pub global_flush_interval_secs: u64,
}

/// Cache-node agent configuration, loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub wallet: String,
    pub display_name: String,
    /// Hex-encoded Ed25519 secret key used to sign register frames.
    pub secret_key: Option<String>,
    /// Relay endpoints as `url#region` pairs; ordering is refined by geo
    /// proximity at startup.
    pub relay_endpoints: Vec<RelayEndpoint>,
    /// Upstream blockchain RPC the agent fills its cache from.
    pub upstream_url: String,
    pub cache_config: CacheConfig,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Consecutive failures against one endpoint before advancing.
    pub max_failures_per_endpoint: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEndpoint {
    pub url: String,
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_entries: usize,
    /// Default TTL in milliseconds for methods without an explicit bucket.
    pub default_ttl_ms: u64,
    pub request_log_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            default_ttl_ms: 2_000,
            request_log_size: 1_000,
        }
    }
}

impl HubConfig {
    pub fn load() -> Result<Self> {
        let api_host = env::var("HUB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let api_port = env::var("HUB_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let require_registration = env::var("HUB_REQUIRE_REGISTRATION")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);

        let signature_mode = env::var("HUB_SIGNATURE_MODE").unwrap_or_else(|_| "hex".to_string());

        // On-chain registry (optional; without it only dev mode admits nodes)
        let chain_config = if let Ok(registry_url) = env::var("CHAIN_REGISTRY_URL") {
            let lookup_ttl_secs = env::var("CHAIN_LOOKUP_TTL_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .unwrap_or(300);
            Some(ChainConfig { registry_url, lookup_ttl_secs })
        } else {
            None
        };

        let stats_config = StatsConfig {
            sled_path: env::var("STATS_SLED_PATH").unwrap_or_else(|_| "./data/stats_db".to_string()),
            fallback_path: env::var("STATS_FALLBACK_PATH")
                .unwrap_or_else(|_| "./data/stats_fallback.json".to_string()),
            wallet_flush_interval_secs: env::var("STATS_WALLET_FLUSH_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .unwrap_or(300),
            global_flush_interval_secs: env::var("STATS_GLOBAL_FLUSH_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .unwrap_or(60),
        };

        let heartbeat_interval_secs = env::var("HUB_HEARTBEAT_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        let call_deadline_secs = env::var("HUB_CALL_DEADLINE_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        Ok(Self {
            api_host,
            api_port,
            require_registration,
            signature_mode,
            chain_config,
            stats_config,
            heartbeat_interval_secs,
            call_deadline_secs,
        })
    }
}

impl AgentConfig {
    pub fn load() -> Result<Self> {
        let wallet = env::var("AGENT_WALLET")
            .map_err(|_| anyhow::anyhow!("AGENT_WALLET must be set"))?;

        let display_name = env::var("AGENT_NAME").unwrap_or_else(|_| "rpcmesh-node".to_string());

        let secret_key = env::var("AGENT_SECRET_KEY").ok();

        // Relay endpoints: comma separated `url#region` pairs
        let relay_endpoints: Vec<RelayEndpoint> = env::var("AGENT_RELAY_URLS")
            .unwrap_or_else(|_| "ws://127.0.0.1:8080/ws#unknown".to_string())
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| {
                let s = s.trim();
                match s.split_once('#') {
                    Some((url, region)) => RelayEndpoint {
                        url: url.to_string(),
                        region: region.to_string(),
                    },
                    None => RelayEndpoint {
                        url: s.to_string(),
                        region: "unknown".to_string(),
                    },
                }
            })
            .collect();

        if relay_endpoints.is_empty() {
            return Err(anyhow::anyhow!("AGENT_RELAY_URLS must list at least one endpoint"));
        }

        let upstream_url = env::var("AGENT_UPSTREAM_URL")
            .unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".to_string());

        let cache_config = CacheConfig {
            max_entries: env::var("AGENT_CACHE_MAX_ENTRIES")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()
                .unwrap_or(10_000),
            default_ttl_ms: env::var("AGENT_CACHE_DEFAULT_TTL_MS")
                .unwrap_or_else(|_| "2000".to_string())
                .parse()
                .unwrap_or(2_000),
            request_log_size: env::var("AGENT_REQUEST_LOG_SIZE")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1_000),
        };

        let backoff_base_ms: u64 = env::var("AGENT_BACKOFF_BASE_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .unwrap_or(1_000);

        let backoff_cap_ms: u64 = env::var("AGENT_BACKOFF_CAP_MS")
            .unwrap_or_else(|_| "60000".to_string())
            .parse()
            .unwrap_or(60_000);

        let max_failures_per_endpoint = env::var("AGENT_MAX_FAILURES_PER_ENDPOINT")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        Ok(Self {
            wallet,
            display_name,
            secret_key,
            relay_endpoints,
            upstream_url,
            cache_config,
            backoff_base: Duration::from_millis(backoff_base_ms),
            backoff_cap: Duration::from_millis(backoff_cap_ms),
            max_failures_per_endpoint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_hub_config_defaults() {
        env::remove_var("HUB_PORT");
        env::remove_var("HUB_REQUIRE_REGISTRATION");
        env::remove_var("CHAIN_REGISTRY_URL");

        let config = HubConfig::load().unwrap();
        assert_eq!(config.api_port, 8080);
        assert!(config.require_registration);
        assert!(config.chain_config.is_none());
        assert_eq!(config.signature_mode, "hex");
    }

    #[test]
    #[serial]
    fn test_agent_endpoint_parsing() {
        env::set_var("AGENT_WALLET", "w1");
        env::set_var(
            "AGENT_RELAY_URLS",
            "wss://relay-a.example/ws#us-east-1, wss://relay-b.example/ws#eu-central-1,ws://raw.example/ws",
        );

        let config = AgentConfig::load().unwrap();
        assert_eq!(config.relay_endpoints.len(), 3);
        assert_eq!(config.relay_endpoints[0].region, "us-east-1");
        assert_eq!(config.relay_endpoints[1].url, "wss://relay-b.example/ws");
        assert_eq!(config.relay_endpoints[2].region, "unknown");

        env::remove_var("AGENT_WALLET");
        env::remove_var("AGENT_RELAY_URLS");
    }
}
