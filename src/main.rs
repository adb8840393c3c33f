// forge-raft node binary: wires a `ClusterService` from environment
// configuration and runs it as a standalone process with structured
// logging from startup through shutdown.

use forge_raft::{ClusterConfig, ClusterService, Result, VERSION};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    info!(version = VERSION, "starting forge-raft node");

    let config = match ClusterConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return Err(e);
        }
    };

    std::fs::create_dir_all(&config.data_dir)?;

    info!(
        node = %config.node_id,
        peers = config.peers.len(),
        data_dir = %config.data_dir.display(),
        "configuration loaded"
    );

    let service = ClusterService::new(config).await?;

    if service.config().auto_start {
        service.start().await?;
        info!("raft node started");
    } else {
        info!("RAFT_AUTO_START is disabled; node constructed but not started");
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    service.stop().await?;
    info!("forge-raft node stopped");
    Ok(())
}
