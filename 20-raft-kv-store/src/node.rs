//! Core Raft node implementation.
//!
//! This module wraps the tikv/raft library behind a small interface. The
//! wrapper owns the replicated log only; decoded commands leave through
//! [`ReadyBundle::committed`] and are applied to the store elsewhere, in
//! commit order.

use std::time::Duration;

use anyhow::{Context, Result};
use raft::StateRole;
use raft::prelude::{ConfState, Config, Entry, EntryType, Message, RawNode};
use raft::storage::MemStorage;
use slog::{Logger, o};

use crate::command::Command;

/// Creates a logger that discards all output.
///
/// The tikv/raft library requires a logger, but we log through `tracing`
/// at the application level instead.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Raft timing knobs.
///
/// Election and heartbeat timeouts are measured in ticks; the runtime calls
/// `tick()` once per `tick_interval`.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub tick_interval: Duration,
    pub election_ticks: usize,
    pub heartbeat_ticks: usize,
    /// A leader that has not heard from a quorum for an election timeout
    /// steps down. Followers then ignore vote requests while their leader
    /// is still live, so a forced campaign against a healthy leader fails.
    pub check_quorum: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            election_ticks: 10,
            heartbeat_ticks: 3,
            check_quorum: false,
        }
    }
}

/// A normal log entry that has been committed.
///
/// `context` is whatever the proposer attached; the runtime uses it to find
/// the client waiting on this entry. A payload that fails to decode is still
/// delivered so the apply loop can account for it.
#[derive(Debug)]
pub struct CommittedCommand {
    pub index: u64,
    pub term: u64,
    pub context: Vec<u8>,
    pub payload: crate::error::Result<Command>,
}

/// Output from processing a Raft ready state.
///
/// - **messages**: Raft messages to send to other nodes
/// - **committed**: commands that were committed, in log order
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub committed: Vec<CommittedCommand>,
}

/// A Raft consensus node over an in-memory log.
pub struct RaftNode {
    id: u64,
    raw: RawNode<MemStorage>,
    storage: MemStorage,
}

impl RaftNode {
    /// Creates a new Raft node with the given ID and voter set.
    ///
    /// `voters` must include `id`.
    pub fn new(id: u64, voters: &[u64], config: &RaftConfig) -> Result<Self> {
        let cfg = Config {
            id,
            election_tick: config.election_ticks,
            heartbeat_tick: config.heartbeat_ticks,
            check_quorum: config.check_quorum,
            max_inflight_msgs: 256,
            ..Default::default()
        };
        let storage = MemStorage::new_with_conf_state(ConfState::from((voters.to_vec(), vec![])));
        let logger = silent_logger();
        let raw = RawNode::new(&cfg, storage.clone(), &logger)
            .with_context(|| format!("failed to construct RawNode {id}"))?;
        Ok(Self { id, raw, storage })
    }

    /// Advances Raft's logical clock by one tick.
    pub fn tick(&mut self) {
        self.raw.tick();
    }

    /// Starts an election to become leader.
    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().context("campaign failed")
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    /// Returns the current leader's ID, or 0 if no leader is known.
    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    /// Returns the current Raft term.
    ///
    /// The term increases with each election. A node that sees a higher term
    /// steps down to follower.
    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    /// Highest log index known to be committed on this node.
    pub fn commit_index(&self) -> u64 {
        self.raw.raft.raft_log.committed
    }

    /// Appends an encoded command to the local log.
    ///
    /// Success only means "appended"; commitment shows up later in
    /// `poll_ready()`. Fails if this node cannot accept proposals.
    pub fn propose(&mut self, context: Vec<u8>, data: Vec<u8>) -> Result<()> {
        self.raw.propose(context, data).context("propose failed")
    }

    /// Processes a Raft message from another node.
    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).context("step failed")
    }

    /// Checks if Raft has work to do, processes it, and returns results.
    ///
    /// Follows the two-phase Ready → LightReady protocol: persist hard state
    /// and entries, collect committed entries and messages, advance, then
    /// collect whatever the LightReady adds.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut committed = Vec::new();
        let mut outbound = Vec::new();

        if let Some(hard_state) = ready.hs() {
            self.storage.wl().set_hardstate(hard_state.clone());
        }

        if !ready.entries().is_empty() {
            self.storage
                .wl()
                .append(ready.entries())
                .context("append entries failed")?;
        }

        if !ready.snapshot().is_empty() {
            self.storage
                .wl()
                .apply_snapshot(ready.snapshot().clone())
                .context("apply snapshot failed")?;
        }

        committed.extend(decode_entries(ready.take_committed_entries()));
        outbound.extend(ready.take_messages());
        outbound.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);

        if let Some(commit) = light_ready.commit_index() {
            self.storage.wl().mut_hard_state().set_commit(commit);
        }

        committed.extend(decode_entries(light_ready.take_committed_entries()));
        outbound.extend(light_ready.take_messages());

        self.raw.advance_apply();

        Ok(Some(ReadyBundle {
            messages: outbound,
            committed,
        }))
    }
}

/// Keeps normal entries that carry data; leader no-ops and configuration
/// entries have no command for the state machine.
fn decode_entries(entries: Vec<Entry>) -> Vec<CommittedCommand> {
    entries
        .into_iter()
        .filter(|entry| !entry.data.is_empty() && entry.entry_type() == EntryType::EntryNormal)
        .map(|entry| CommittedCommand {
            index: entry.index,
            term: entry.term,
            context: entry.context.to_vec(),
            payload: Command::decode(&entry.data),
        })
        .collect()
}
