//! Cluster membership, as seen by a node.
//!
//! Membership is owned by an external component (gossip, static config, a
//! service registry). The dispatch core only needs to ask who the peers are,
//! so it depends on the [`MembershipOracle`] capability and nothing else.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{PoisonError, RwLock};

/// Another node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub address: String,
}

impl Peer {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// Source of the current member list.
pub trait MembershipOracle: Send + Sync {
    fn members(&self) -> Vec<Peer>;
}

/// Fixed member list, editable at runtime.
#[derive(Debug, Default)]
pub struct StaticMembership {
    peers: RwLock<Vec<Peer>>,
}

impl StaticMembership {
    pub fn new(peers: impl IntoIterator<Item = Peer>) -> Self {
        Self {
            peers: RwLock::new(peers.into_iter().collect()),
        }
    }

    /// Add `peer`, replacing an existing peer with the same id.
    pub fn join(&self, peer: Peer) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        peers.retain(|p| p.id != peer.id);
        peers.push(peer);
    }

    pub fn leave(&self, id: &str) -> bool {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        let before = peers.len();
        peers.retain(|p| p.id != id);
        peers.len() != before
    }
}

impl MembershipOracle for StaticMembership {
    fn members(&self) -> Vec<Peer> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_replaces_and_leave_removes() {
        let members = StaticMembership::new([Peer::new("a", "10.0.0.1:3010")]);
        members.join(Peer::new("b", "10.0.0.2:3010"));
        members.join(Peer::new("a", "10.0.0.9:3010"));

        let mut list = members.members();
        list.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(
            list,
            vec![Peer::new("a", "10.0.0.9:3010"), Peer::new("b", "10.0.0.2:3010")]
        );

        assert!(members.leave("a"));
        assert!(!members.leave("a"));
        assert_eq!(members.members().len(), 1);
        assert_eq!(Peer::new("b", "h:1").to_string(), "b@h:1");
    }
}
