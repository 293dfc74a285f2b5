//! Test harness for clusters of real Raft nodes with TCP networking.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use raft::StateRole;
use raft_kv_store::consensus::Consensus;
use raft_kv_store::node::RaftConfig;
use raft_kv_store::runtime::{NodeConfig, RunningNode, spawn_node};
use raft_kv_store::v1;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Faster than the default so elections settle within a second.
pub const TICK: Duration = Duration::from_millis(50);
const POLL: Duration = Duration::from_millis(20);

pub fn test_config(id: u64, listen_addr: String, peers: HashMap<u64, String>) -> NodeConfig {
    NodeConfig {
        id,
        listen_addr,
        peers,
        raft: RaftConfig {
            tick_interval: TICK,
            ..RaftConfig::default()
        },
        request_timeout: Duration::from_secs(3),
        history_capacity: 1000,
        campaign: false,
    }
}

pub struct TestCluster {
    nodes: Vec<Option<RunningNode>>,
}

impl TestCluster {
    /// Spawns N nodes on localhost with sequential ports starting from base_port.
    pub async fn spawn(n: usize, base_port: u16) -> Result<Self> {
        Self::spawn_with(n, base_port, |_| {}).await
    }

    /// Like [`spawn`](Self::spawn), letting the caller adjust each node's config.
    pub async fn spawn_with(
        n: usize,
        base_port: u16,
        configure: impl Fn(&mut NodeConfig),
    ) -> Result<Self> {
        let peers: HashMap<u64, String> = (0..n)
            .map(|i| ((i + 1) as u64, format!("127.0.0.1:{}", base_port + i as u16)))
            .collect();

        let mut nodes = Vec::new();
        for i in 0..n {
            let id = (i + 1) as u64;
            let mut config = test_config(id, peers[&id].clone(), peers.clone());
            configure(&mut config);
            nodes.push(Some(spawn_node(config).await?));
        }
        Ok(Self { nodes })
    }

    /// Gets a running node by 1-indexed ID.
    pub fn node(&self, id: u64) -> &RunningNode {
        self.nodes[(id - 1) as usize]
            .as_ref()
            .expect("node has been stopped")
    }

    pub fn running(&self) -> impl Iterator<Item = &RunningNode> {
        self.nodes.iter().flatten()
    }

    /// Stops one node, simulating a crash.
    pub async fn stop(&mut self, id: u64) {
        if let Some(node) = self.nodes[(id - 1) as usize].take() {
            node.shutdown().await;
        }
    }

    pub async fn wait_for_node_to_become_leader(&self, id: u64, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        while self.node(id).raft.status().role != StateRole::Leader {
            if start.elapsed() > timeout {
                bail!("timeout waiting for node {id} to become leader");
            }
            tokio::time::sleep(POLL).await;
        }
        Ok(())
    }

    /// Waits for exactly one running leader and returns its ID.
    pub async fn wait_for_single_leader(&self, timeout: Duration) -> Result<u64> {
        let start = Instant::now();
        loop {
            let leaders: Vec<u64> = self
                .running()
                .filter(|node| node.raft.is_leader())
                .map(|node| node.id)
                .collect();
            if leaders.len() == 1 {
                return Ok(leaders[0]);
            }
            if start.elapsed() > timeout {
                bail!("timeout waiting for leader election, leaders: {leaders:?}");
            }
            tokio::time::sleep(POLL).await;
        }
    }

    /// Waits for all running nodes to agree on the same leader.
    pub async fn wait_for_leader_consensus(&self, leader: u64, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        while !self
            .running()
            .all(|node| node.raft.status().leader() == Some(leader))
        {
            if start.elapsed() > timeout {
                bail!("timeout waiting for all nodes to follow {leader}");
            }
            tokio::time::sleep(POLL).await;
        }
        Ok(())
    }

    /// Waits until every running store has applied up to `index`.
    pub async fn wait_for_store_index(&self, index: u64, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        while !self.running().all(|node| node.store.read().index() >= index) {
            if start.elapsed() > timeout {
                bail!("timeout waiting for all stores to reach index {index}");
            }
            tokio::time::sleep(POLL).await;
        }
        Ok(())
    }

    /// Elects node 1 and waits for everyone to follow it.
    pub async fn elect_first(&self) -> Result<()> {
        self.node(1).raft.campaign().await?;
        self.wait_for_node_to_become_leader(1, Duration::from_secs(5))
            .await?;
        self.wait_for_leader_consensus(1, Duration::from_secs(5))
            .await
    }

    pub async fn shutdown(self) {
        for node in self.nodes.into_iter().flatten() {
            node.shutdown().await;
        }
    }
}

/// Serves the v1 key API for `node` on an ephemeral port.
pub async fn serve_http(node: &RunningNode) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = v1::router(node.gateway.clone());
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((addr, task))
}
