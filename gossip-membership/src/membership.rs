//! Local view of cluster membership.
//!
//! This module holds the node's own identity together with the table of every
//! peer it has heard from. Both gossip loops share one [`Membership`]; the
//! listener writes to it and diagnostics read snapshots from it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Name and reachable address of a single node.
///
/// Fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub name: String,
    pub address: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}

/// Thread-safe table of peer name to last announced address.
///
/// The table is seeded with the local identity and only ever grows. Entries
/// are never evicted, so a long-running node with a lot of churn keeps every
/// name it has ever seen.
///
/// Conflicting announcements for the same name are resolved last-write-wins:
/// whichever merge runs last owns the entry. There are no versions or
/// timestamps to compare. Snapshots iterate in name order.
pub struct Membership {
    local: Identity,
    nodes: Mutex<BTreeMap<String, String>>,
}

impl Membership {
    /// Creates a table containing only the local node.
    pub fn new(local: Identity) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(local.name.clone(), local.address.clone());
        Self {
            local,
            nodes: Mutex::new(nodes),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.local
    }

    /// Records the latest address announced for `name`, overwriting any
    /// previous value.
    ///
    /// Returns `true` when the table changed, `false` when the same address was
    /// already known. Either way the entry ends up holding `address`.
    pub fn merge(&self, name: impl Into<String>, address: impl Into<String>) -> bool {
        let address = address.into();
        let previous = self.table().insert(name.into(), address.clone());
        previous.as_deref() != Some(address.as_str())
    }

    /// Returns the address last announced for `name`.
    pub fn address_of(&self, name: &str) -> Option<String> {
        self.table().get(name).cloned()
    }

    /// Number of known nodes, including this one.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    /// Always `false`: the local node is never evicted.
    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Returns a copy of the whole table.
    ///
    /// The copy is taken under the lock, so it never observes a half-applied
    /// merge, and the lock is released before the caller iterates.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.table().clone()
    }

    // Inserts are atomic with respect to panics; a poisoned table is intact.
    fn table(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
