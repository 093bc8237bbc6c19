use std::net::SocketAddrV4;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use crate::membership::Identity;
use crate::node::{DEFAULT_ADDRESS, DEFAULT_NAME, NodeConfig};
use crate::transport::{DEFAULT_GROUP, outbound_ipv4};

#[derive(Parser, Debug)]
#[command(author, version, about = "Gossip cluster membership over UDP multicast", long_about = None)]
pub struct Cli {
    /// Name this node announces to the cluster.
    #[arg(env = "GOSSIP_NODE_NAME", default_value = DEFAULT_NAME)]
    pub name: String,

    /// Address peers should use to reach this node, e.g. 10.0.0.1:9000.
    #[arg(env = "GOSSIP_NODE_ADDRESS", default_value = DEFAULT_ADDRESS)]
    pub address: String,

    /// Multicast group shared by every member of the cluster.
    #[arg(long, env = "GOSSIP_GROUP", default_value_t = DEFAULT_GROUP)]
    pub group: SocketAddrV4,

    /// Seconds between heartbeats.
    #[arg(
        long,
        env = "GOSSIP_INTERVAL_SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub interval: u64,

    /// Announce this host's outbound IPv4 address instead of ADDRESS.
    /// Falls back to ADDRESS when no non-loopback address is found.
    #[arg(long)]
    pub detect_address: bool,
}

impl Cli {
    pub fn into_config(self) -> NodeConfig {
        let address = if self.detect_address {
            resolve_address(self.group, self.address)
        } else {
            self.address
        };

        NodeConfig {
            identity: Identity::new(self.name, address),
            group: self.group,
            interval: Duration::from_secs(self.interval),
        }
    }
}

fn resolve_address(group: SocketAddrV4, fallback: String) -> String {
    match outbound_ipv4(group) {
        Some(ip) => {
            info!(%ip, "detected local address");
            ip.to_string()
        }
        None => {
            warn!(%fallback, "could not detect a non-loopback address, using fallback");
            fallback
        }
    }
}
