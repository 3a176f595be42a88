//! Node region detection and geo-proximity endpoint ordering.
//!
//! Region detection is best effort: a single lookup against ip-api.com at
//! startup, cached for the process lifetime, defaulting to "unknown" on any
//! failure. The proximity tables below are configuration data, not logic;
//! adjust them as relay coverage changes.

use crate::config::RelayEndpoint;
use once_cell::sync::{Lazy, OnceCell};
use serde::Deserialize;
use std::collections::HashMap;

/// Global cached node region
static NODE_REGION: OnceCell<String> = OnceCell::new();

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    #[serde(rename = "countryCode")]
    country_code: String,
}

/// Country code → region label for relay proximity ranking.
static REGION_MAP: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("US", "us-east-1"),
        ("CA", "ca-central-1"),
        ("BR", "sa-east-1"),
        ("IE", "eu-west-1"),
        ("GB", "eu-west-2"),
        ("FR", "eu-west-3"),
        ("DE", "eu-central-1"),
        ("IT", "eu-south-1"),
        ("SE", "eu-north-1"),
        ("IN", "ap-south-1"),
        ("SG", "ap-southeast-1"),
        ("AU", "ap-southeast-2"),
        ("JP", "ap-northeast-1"),
        ("KR", "ap-northeast-2"),
        ("ZA", "af-south-1"),
        ("AE", "me-south-1"),
    ]
    .iter()
    .copied()
    .collect()
});

/// Region prefix → continent group.
static CONTINENT_MAP: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("us", "americas"),
        ("ca", "americas"),
        ("sa", "americas"),
        ("eu", "europe"),
        ("me", "europe"),
        ("af", "europe"),
        ("ap", "asia"),
    ]
    .iter()
    .copied()
    .collect()
});

/// Preferred continent ordering per continent (nearest first).
static CONTINENT_NEIGHBORS: Lazy<HashMap<&'static str, Vec<&'static str>>> = Lazy::new(|| {
    [
        ("americas", vec!["americas", "europe", "asia"]),
        ("europe", vec!["europe", "americas", "asia"]),
        ("asia", vec!["asia", "europe", "americas"]),
    ]
    .iter()
    .cloned()
    .collect()
});

/// Get the cached node region
pub fn get_node_region() -> String {
    NODE_REGION
        .get()
        .cloned()
        .unwrap_or_else(|| "unknown".to_string())
}

/// Fetch node region from ip-api.com and cache it for the process lifetime.
pub async fn fetch_and_set_node_region() -> String {
    match fetch_region_internal().await {
        Ok(region) => {
            tracing::info!("Node region: {}", region);
            let _ = NODE_REGION.set(region.clone());
            region
        }
        Err(e) => {
            tracing::error!("Error getting node location on startup: {}", e);
            let unknown = "unknown".to_string();
            let _ = NODE_REGION.set(unknown.clone());
            unknown
        }
    }
}

async fn fetch_region_internal() -> anyhow::Result<String> {
    let response = reqwest::get("http://ip-api.com/json/")
        .await?
        .json::<IpApiResponse>()
        .await?;

    let country_code = response.country_code;

    let region = REGION_MAP
        .get(country_code.as_str())
        .map(|&s| s.to_string())
        .unwrap_or_else(|| format!("{}-region-1", country_code.to_lowercase()));

    Ok(region)
}

fn continent_of(region: &str) -> Option<&'static str> {
    let prefix = region.split('-').next()?;
    CONTINENT_MAP.get(prefix).copied()
}

/// Proximity rank of an endpoint region relative to the node region; lower
/// is closer. Exact region match beats same-continent beats the rest.
fn proximity_rank(node_region: &str, endpoint_region: &str) -> usize {
    if node_region == endpoint_region {
        return 0;
    }
    let (Some(node_continent), Some(endpoint_continent)) =
        (continent_of(node_region), continent_of(endpoint_region))
    else {
        return usize::MAX;
    };
    match CONTINENT_NEIGHBORS.get(node_continent) {
        Some(order) => match order.iter().position(|&c| c == endpoint_continent) {
            Some(position) => position + 1,
            None => usize::MAX,
        },
        None => usize::MAX,
    }
}

/// Reorder relay endpoints so the nearest is tried first. The sort is
/// stable: endpoints at equal distance keep their configured order.
pub fn order_endpoints(node_region: &str, endpoints: &[RelayEndpoint]) -> Vec<RelayEndpoint> {
    let mut ordered: Vec<RelayEndpoint> = endpoints.to_vec();
    ordered.sort_by_key(|endpoint| proximity_rank(node_region, &endpoint.region));
    ordered
}
