use std::collections::{BTreeMap, HashMap};

use anyhow::{Result, ensure};

/// Static cluster membership, validated once at boot.
///
/// Guarantees an odd number of voters, that this node is one of them, and
/// that the address peers use to reach it is the one it listens on.
#[derive(Debug, Clone)]
pub struct ClusterTopology {
    self_id: u64,
    members: BTreeMap<u64, String>,
}

impl ClusterTopology {
    pub fn new(self_id: u64, listen_addr: &str, peers: &HashMap<u64, String>) -> Result<Self> {
        ensure!(!peers.is_empty(), "topology requires at least one node");
        ensure!(
            peers.len() % 2 == 1,
            "topology must have an odd number of nodes, got {}",
            peers.len()
        );
        ensure!(!peers.contains_key(&0), "node id 0 is reserved");
        let Some(own_addr) = peers.get(&self_id) else {
            anyhow::bail!("node id {self_id} missing from peers map");
        };
        ensure!(
            own_addr == listen_addr,
            "peers map lists node {self_id} at {own_addr} but it listens on {listen_addr}"
        );

        Ok(Self {
            self_id,
            members: peers.iter().map(|(id, addr)| (*id, addr.clone())).collect(),
        })
    }

    pub fn self_id(&self) -> u64 {
        self.self_id
    }

    /// All voter ids, ascending.
    pub fn voters(&self) -> Vec<u64> {
        self.members.keys().copied().collect()
    }

    /// Every member except this node.
    pub fn remote_peers(&self) -> impl Iterator<Item = (u64, &str)> {
        self.members
            .iter()
            .filter(move |(id, _)| **id != self.self_id)
            .map(|(id, addr)| (*id, addr.as_str()))
    }
}
