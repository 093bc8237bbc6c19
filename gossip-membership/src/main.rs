use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use gossip_membership::{cli::Cli, node::GossipNode, transport::UdpMulticast};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Cli::parse().into_config();
    let transport = UdpMulticast::join(config.group).await?;
    info!("node {} joined multicast group {}", config.identity, transport.group());
    let node = GossipNode::new(&config, transport)?;

    if let Err(err) = node.run_until_ctrl_c().await {
        warn!("gossip node exited with error: {err:?}");
        return Err(err);
    }

    Ok(())
}
