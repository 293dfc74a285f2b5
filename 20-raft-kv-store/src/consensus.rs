//! The interface the dispatch pipeline needs from the consensus layer.
//!
//! Election and replication stay behind this seam. The gateway and the
//! expiration scheduler only propose commands and read term/commit index.

use std::future::Future;

use raft::StateRole;

use crate::command::Command;
use crate::error::Result;
use crate::store::Event;

/// Point-in-time view of the local Raft state, published by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftStatus {
    pub node_id: u64,
    pub role: StateRole,
    /// 0 when no leader is known.
    pub leader_id: u64,
    pub term: u64,
    pub commit_index: u64,
}

impl RaftStatus {
    pub fn initial(node_id: u64) -> Self {
        Self {
            node_id,
            role: StateRole::Follower,
            leader_id: 0,
            term: 0,
            commit_index: 0,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == StateRole::Leader
    }

    pub fn leader(&self) -> Option<u64> {
        (self.leader_id != 0).then_some(self.leader_id)
    }
}

/// Uses RPITIT with an explicit `Send` bound so generic callers can await
/// proposals from spawned tasks.
pub trait Consensus: Clone + Send + Sync + 'static {
    /// Replicates `command` and resolves once it has been committed and
    /// applied, with the event the apply produced.
    ///
    /// Fails fast with `NotLeader` on a follower, with `ProposalLost` if
    /// leadership changed before commit, and with the store error if the
    /// committed command was rejected by the state machine.
    fn propose(&self, command: Command) -> impl Future<Output = Result<Event>> + Send;

    fn status(&self) -> RaftStatus;

    fn commit_index(&self) -> u64 {
        self.status().commit_index
    }

    fn term(&self) -> u64 {
        self.status().term
    }

    fn is_leader(&self) -> bool {
        self.status().is_leader()
    }
}
