use anyhow::Result;
use rpcmesh::agent::Agent;
use rpcmesh::config::AgentConfig;

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

    tracing::info!("Starting rpcmesh cache node agent...");

    let config = AgentConfig::load()?;
    tracing::info!(
        "🆔 Operator wallet: {} | upstream: {}",
        config.wallet,
        config.upstream_url
    );
    if config.secret_key.is_none() {
        tracing::warn!(
            "AGENT_SECRET_KEY not set; register frames carry a placeholder signature"
        );
    }

    // The agent loop never returns: every fault schedules a reconnect.
    let agent = Agent::new(config);
    agent.run().await;

    Ok(())
}
