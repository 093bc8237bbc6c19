//! A gossip node: one membership table driven by two independent loops.
//!
//! - The **announcer** wakes on a fixed interval and multicasts this node's
//!   `name:address` heartbeat. It never touches the membership table.
//! - The **listener** receives datagrams one at a time, parses them and merges
//!   well-formed announcements into the table. Because each datagram is handled
//!   before the next receive, merges never race each other.
//!
//! Neither loop stops on its own. Send failures, receive failures and
//! malformed payloads are logged and the loop carries on; the next heartbeat
//! from a peer makes up for whatever was lost.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail, ensure};
use tokio::select;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

use crate::announcement::Announcement;
use crate::membership::{Identity, Membership};
use crate::transport::{DEFAULT_GROUP, Datagram, Transport};

pub const DEFAULT_NAME: &str = "GoNode1";
pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Everything needed to start a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Identity seeded into the table and carried by every heartbeat.
    pub identity: Identity,
    /// Multicast group all cluster members agree on out of band.
    pub group: SocketAddrV4,
    /// Time between heartbeats.
    pub interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity: Identity::new(DEFAULT_NAME, DEFAULT_ADDRESS),
            group: DEFAULT_GROUP,
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            identity: Identity::new(name, address),
            ..Self::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_group(mut self, ip: Ipv4Addr, port: u16) -> Self {
        self.group = SocketAddrV4::new(ip, port);
        self
    }
}

pub struct GossipNode<T> {
    membership: Arc<Membership>,
    transport: Arc<T>,
    interval: Duration,
}

impl<T> GossipNode<T>
where
    T: Transport + 'static,
{
    /// Builds a node over an already joined transport.
    ///
    /// Joining the group is the transport's job, so by the time a node exists
    /// the only thing left that can fail is a nonsensical interval.
    pub fn new(config: &NodeConfig, transport: T) -> Result<Self> {
        ensure!(
            !config.interval.is_zero(),
            "announcement interval must be greater than zero"
        );
        Ok(Self {
            membership: Arc::new(Membership::new(config.identity.clone())),
            transport: Arc::new(transport),
            interval: config.interval,
        })
    }

    /// Shared handle to the table, for reporting while the node runs.
    pub fn membership(&self) -> Arc<Membership> {
        Arc::clone(&self.membership)
    }

    /// Runs both loops until `shutdown` resolves.
    ///
    /// Returns an error only if one of the loops dies, which means it panicked.
    /// On shutdown both loops are aborted where they stand; there is nothing
    /// to drain.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let GossipNode {
            membership,
            transport,
            interval,
        } = self;
        let node = membership.identity().clone();
        info!(%node, "gossip node starting");

        // Dropping the set aborts both loops, so cancelling this future (or
        // the task running it) stops the node as well.
        let mut loops = JoinSet::new();
        let announcer_node = node.clone();
        let announcer_transport = Arc::clone(&transport);
        loops.spawn(async move {
            announce(announcer_node, announcer_transport, interval).await;
            "announcer"
        });
        loops.spawn(async move {
            listen(membership, transport).await;
            "listener"
        });
        tokio::pin!(shutdown);

        let outcome = select! {
            _ = &mut shutdown => {
                info!(%node, "gossip node shutting down");
                Ok(())
            }
            Some(joined) = loops.join_next() => loop_exited(joined),
        };

        loops.shutdown().await;
        outcome
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

fn loop_exited(joined: std::result::Result<&'static str, JoinError>) -> Result<()> {
    match joined {
        Ok(name) => bail!("{name} loop exited unexpectedly"),
        Err(err) => Err(anyhow!(err).context("gossip loop crashed")),
    }
}

/// Spawns the node onto the current runtime and returns its table plus the
/// task running it. Aborting the task stops the node.
pub fn spawn_node<T>(
    config: &NodeConfig,
    transport: T,
) -> Result<(Arc<Membership>, JoinHandle<Result<()>>)>
where
    T: Transport + 'static,
{
    let node = GossipNode::new(config, transport)?;
    let membership = node.membership();
    let task = tokio::spawn(node.run_until(std::future::pending()));
    Ok((membership, task))
}

async fn announce<T: Transport>(node: Identity, transport: Arc<T>, period: Duration) {
    let heartbeat = Announcement::from(&node);
    let payload = heartbeat.encode();

    // The first tick completes immediately, so peers hear about us right away.
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match transport.send(&payload).await {
            Ok(()) => info!(node = %node.name, %heartbeat, "sent heartbeat"),
            Err(error) => warn!(node = %node.name, ?error, "error sending heartbeat"),
        }
    }
}

async fn listen<T: Transport>(membership: Arc<Membership>, transport: Arc<T>) {
    loop {
        match transport.recv().await {
            Ok(datagram) => handle_datagram(&membership, &datagram),
            Err(error) => warn!(
                node = %membership.identity().name,
                ?error,
                "error receiving heartbeat"
            ),
        }
    }
}

fn handle_datagram(membership: &Membership, datagram: &Datagram) {
    let node = &membership.identity().name;
    match Announcement::decode(&datagram.payload) {
        Ok(announcement) => {
            let (name, address) = announcement.into_parts();
            let changed = membership.merge(name, address);
            let nodes = membership.snapshot();
            info!(%node, peer = %datagram.source, changed, ?nodes, "updated cluster nodes");
        }
        Err(reason) => {
            let raw = String::from_utf8_lossy(&datagram.payload);
            let payload = raw.trim();
            warn!(
                %node,
                peer = %datagram.source,
                %payload,
                %reason,
                "received malformed message"
            );
        }
    }
}
