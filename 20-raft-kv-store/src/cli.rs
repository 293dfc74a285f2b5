use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueHint};

use crate::node::RaftConfig;
use crate::runtime::NodeConfig;

/// Command-line arguments for one replica.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Run a replicated key-value store node")]
pub struct Cli {
    /// Numeric node ID (must match one entry in --peer)
    #[arg(long)]
    pub id: u64,

    /// Address this node should listen on for Raft messages, e.g. 127.0.0.1:7101
    #[arg(long, value_hint = ValueHint::Hostname)]
    pub listen: String,

    /// Address the v1 HTTP key API binds to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:4001")]
    pub http: SocketAddr,

    /// Comma-separated peer map: id=addr,id=addr,... (must include self)
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    pub peer: Vec<String>,

    /// Raft logical clock interval in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub tick_ms: u64,

    /// Ticks without a heartbeat before a follower starts an election.
    #[arg(long, default_value_t = 10)]
    pub election_ticks: usize,

    /// Ticks between leader heartbeats.
    #[arg(long, default_value_t = 3)]
    pub heartbeat_ticks: usize,

    /// How long a write may wait for commit before the client gets a timeout.
    #[arg(long, default_value_t = 5000)]
    pub request_timeout_ms: u64,

    /// Number of applied events kept in memory.
    #[arg(long, default_value_t = 1000)]
    pub history_capacity: usize,

    /// Start an election at boot instead of waiting for the election timeout.
    #[arg(long)]
    pub campaign: bool,

    /// Step down as leader after an election timeout without hearing from a quorum.
    #[arg(long)]
    pub check_quorum: bool,
}

impl Cli {
    pub fn node_config(&self) -> Result<NodeConfig> {
        if self.heartbeat_ticks == 0 || self.election_ticks <= self.heartbeat_ticks {
            return Err(anyhow!(
                "--election-ticks ({}) must be greater than --heartbeat-ticks ({})",
                self.election_ticks,
                self.heartbeat_ticks
            ));
        }
        if self.tick_ms == 0 {
            return Err(anyhow!("--tick-ms must be positive"));
        }

        Ok(NodeConfig {
            id: self.id,
            listen_addr: self.listen.clone(),
            peers: parse_peers(&self.peer)?,
            raft: RaftConfig {
                tick_interval: Duration::from_millis(self.tick_ms),
                election_ticks: self.election_ticks,
                heartbeat_ticks: self.heartbeat_ticks,
                check_quorum: self.check_quorum,
            },
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            history_capacity: self.history_capacity,
            campaign: self.campaign,
        })
    }
}

pub fn parse_peers(entries: &[String]) -> Result<HashMap<u64, String>> {
    let mut peers = HashMap::new();
    for entry in entries {
        let Some((id_str, addr)) = entry.split_once('=') else {
            return Err(anyhow!("invalid peer entry '{entry}', expected id=addr"));
        };
        let id: u64 = id_str
            .parse()
            .with_context(|| format!("invalid peer id in '{entry}'"))?;
        if peers.insert(id, addr.to_string()).is_some() {
            return Err(anyhow!("peer {id} listed twice"));
        }
    }
    if peers.is_empty() {
        return Err(anyhow!(
            "at least one --peer entry is required (include self)"
        ));
    }
    Ok(peers)
}
