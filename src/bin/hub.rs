use anyhow::Result;
use rpcmesh::config::HubConfig;
use rpcmesh::{hub, metrics};

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting rpcmesh relay hub...");

    metrics::init_metrics();

    let config = HubConfig::load()?;
    tracing::info!(
        "Registration required: {} | signature mode: {}",
        config.require_registration,
        config.signature_mode
    );
    if config.chain_config.is_none() && config.require_registration {
        tracing::warn!(
            "Registration is required but no CHAIN_REGISTRY_URL is set; \
             no wallet will verify as bonded"
        );
    }

    hub::run(config).await
}
