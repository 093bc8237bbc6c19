//! Gossip-style cluster membership over UDP multicast.
//!
//! Every node periodically multicasts a `name:address` heartbeat and merges
//! the heartbeats it hears into a local table of known peers. There is no
//! coordinator and no failure detection: the table only ever grows, and the
//! most recently received address for a name wins.
//!
//! - [`membership`] holds the local identity and the lock-guarded peer table.
//! - [`announcement`] parses and encodes the plain-text wire format.
//! - [`node`] runs the announcer and listener loops over a transport.
//! - [`transport`] provides UDP multicast plus an in-process group for tests.
//! - [`cli`] turns command-line arguments into a [`node::NodeConfig`].

pub mod announcement;
pub mod cli;
pub mod membership;
pub mod node;
pub mod transport;
