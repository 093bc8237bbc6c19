//! Datagram transports the gossip loops run on.
//!
//! The node only needs two primitives: send one payload to every member of the
//! group, and wait for the next payload from anyone in the group. [`Transport`]
//! captures exactly that so the loops do not care whether datagrams travel
//! over real UDP multicast ([`UdpMulticast`]) or an in-process fan-out
//! ([`MemoryGroup`]) used by tests and local demos.
//!
//! Both transports deliver a node's own announcements back to it, just like
//! multicast loopback does on a real interface.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use anyhow::{Context, Result, ensure};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

/// Largest payload read from a single datagram; anything longer is cut off.
pub const RECV_BUFFER_SIZE: usize = 1024;

/// Multicast group used when none is configured.
pub const DEFAULT_GROUP: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(230, 0, 0, 0), 4446);

/// A received payload and the address it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub source: SocketAddr,
}

/// Unreliable, unordered group messaging.
///
/// No delivery guarantees: a sent payload may reach some members, all of them,
/// none, or the same member twice.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one payload to every member of the group.
    async fn send(&self, payload: &[u8]) -> io::Result<()>;

    /// Waits for the next payload from any member of the group.
    async fn recv(&self) -> io::Result<Datagram>;
}

/// IPv4 UDP multicast transport.
///
/// Mirrors the classic two-socket layout: one socket bound to the group port
/// and joined to the group for receiving, and one ephemeral socket connected
/// to the group for sending.
pub struct UdpMulticast {
    group: SocketAddrV4,
    receiver: UdpSocket,
    sender: UdpSocket,
}

impl UdpMulticast {
    /// Joins `group` on the default interface and opens the send socket.
    ///
    /// Must be called from within a Tokio runtime. Any failure here is fatal to
    /// node startup: nothing is retried.
    pub async fn join(group: SocketAddrV4) -> Result<Self> {
        ensure!(
            group.ip().is_multicast(),
            "{} is not an IPv4 multicast address",
            group.ip()
        );

        let receiver = bind_group_socket(group)
            .with_context(|| format!("error joining multicast group {group}"))?;

        let sender = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
            .await
            .context("error creating UDP sender")?;
        sender
            .connect(group)
            .await
            .with_context(|| format!("error connecting UDP sender to {group}"))?;
        sender
            .set_multicast_loop_v4(true)
            .context("failed to enable multicast loopback")?;
        sender
            .set_multicast_ttl_v4(1)
            .context("failed to set multicast ttl")?;

        debug!(%group, "joined multicast group");
        Ok(Self {
            group,
            receiver,
            sender,
        })
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }
}

// Several nodes on one host must be able to share the group port, so the
// receive socket is built through socket2 to set the reuse options before bind.
fn bind_group_socket(group: SocketAddrV4) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port()).into())?;
    socket.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)?;
    UdpSocket::from_std(socket.into())
}

#[async_trait]
impl Transport for UdpMulticast {
    async fn send(&self, payload: &[u8]) -> io::Result<()> {
        self.sender.send(payload).await.map(|_| ())
    }

    async fn recv(&self) -> io::Result<Datagram> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let (len, source) = self.receiver.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok(Datagram {
            payload: buf,
            source,
        })
    }
}

/// Best guess at the non-loopback IPv4 address peers can reach this host on.
///
/// Asks the OS which local address it would use to reach `group`; no packet is
/// sent. Returns `None` when there is no route or only loopback is available.
pub fn outbound_ipv4(group: SocketAddrV4) -> Option<Ipv4Addr> {
    let probe = std::net::UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    probe.connect(group).ok()?;
    match probe.local_addr().ok()? {
        SocketAddr::V4(local) if !local.ip().is_loopback() && !local.ip().is_unspecified() => {
            Some(*local.ip())
        }
        _ => None,
    }
}

/// In-process multicast group.
///
/// Every payload sent by any member is delivered to every member, including
/// the sender. Each member is given a distinct loopback source address so
/// received datagrams can be told apart in logs.
#[derive(Clone)]
pub struct MemoryGroup {
    broadcaster: broadcast::Sender<Datagram>,
    next_port: Arc<AtomicU16>,
}

impl MemoryGroup {
    pub fn new() -> Self {
        // Slow members lag instead of blocking fast ones, as on a real network.
        let (broadcaster, _) = broadcast::channel(256);
        Self {
            broadcaster,
            next_port: Arc::new(AtomicU16::new(40_000)),
        }
    }

    /// Adds a member and returns its transport.
    pub fn join(&self) -> MemoryTransport {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        MemoryTransport {
            source: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            broadcaster: self.broadcaster.clone(),
            inbox: Mutex::new(self.broadcaster.subscribe()),
        }
    }

    /// Delivers a raw payload to every member as if `source` had sent it.
    pub fn inject(&self, payload: impl Into<Vec<u8>>, source: SocketAddr) {
        let _ = self.broadcaster.send(Datagram {
            payload: payload.into(),
            source,
        });
    }
}

impl Default for MemoryGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// One member's endpoint on a [`MemoryGroup`].
pub struct MemoryTransport {
    source: SocketAddr,
    broadcaster: broadcast::Sender<Datagram>,
    inbox: Mutex<broadcast::Receiver<Datagram>>,
}

impl MemoryTransport {
    pub fn local_addr(&self) -> SocketAddr {
        self.source
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, payload: &[u8]) -> io::Result<()> {
        self.broadcaster
            .send(Datagram {
                payload: payload.to_vec(),
                source: self.source,
            })
            .map(|_| ())
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "no group members"))
    }

    async fn recv(&self) -> io::Result<Datagram> {
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Ok(datagram) => Ok(datagram),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(io::Error::other(format!(
                "receiver lagged, {skipped} datagrams dropped"
            ))),
            Err(broadcast::error::RecvError::Closed) => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "group closed",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn memory_group_fans_out_to_every_member() {
        let group = MemoryGroup::new();
        let alice = group.join();
        let bob = group.join();

        alice.send(b"alice:10.0.0.1").await.expect("send");

        for member in [&alice, &bob] {
            let datagram = timeout(Duration::from_secs(1), member.recv())
                .await
                .expect("datagram in time")
                .expect("recv");
            assert_eq!(datagram.payload, b"alice:10.0.0.1".to_vec());
            assert_eq!(datagram.source, alice.local_addr());
        }
    }

    #[tokio::test]
    async fn memory_members_get_distinct_sources() {
        let group = MemoryGroup::new();
        assert_ne!(group.join().local_addr(), group.join().local_addr());
    }

    #[tokio::test]
    async fn lagging_member_sees_a_receive_error_then_recovers() {
        let group = MemoryGroup::new();
        let member = group.join();
        let source = SocketAddr::from((Ipv4Addr::LOCALHOST, 1));

        for i in 0..300 {
            group.inject(format!("n{i}:10.0.0.1"), source);
        }

        let lagged = member.recv().await;
        assert!(lagged.is_err(), "expected lag error, got {lagged:?}");

        let next = member.recv().await.expect("recovered after lag");
        assert!(next.payload.ends_with(b":10.0.0.1"));
    }

    #[tokio::test]
    async fn joining_a_unicast_address_fails() {
        let result = UdpMulticast::join(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 4446)).await;
        let err = result.err().expect("unicast group must be rejected");
        assert!(err.to_string().contains("not an IPv4 multicast address"));
    }

    #[test]
    fn default_group_is_multicast() {
        assert!(DEFAULT_GROUP.ip().is_multicast());
        assert_eq!(DEFAULT_GROUP.to_string(), "230.0.0.0:4446");
    }
}
