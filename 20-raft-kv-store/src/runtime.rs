//! Worker runtime and network handling for Raft nodes.
//!
//! One node is a handful of tokio tasks:
//!
//! - **Worker**: owns the [`RaftNode`], serializes client proposals, network
//!   messages and ticks through a single `select!` loop
//! - **Applier**: receives committed commands in log order and mutates the store
//! - **Expiration scheduler**: proposes `Expire` commands for elapsed TTLs
//! - **Listener**: accepts peer connections and forwards decoded messages
//! - **Peer senders**: one per remote node, writing frames over a persistent
//!   connection
//!
//! Everything talks over channels, so the raft state machine stays
//! single-threaded and lock-free.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, ensure};
use prost::Message as ProstMessage;
use raft::StateRole;
use raft::prelude::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};

use crate::applier::{Applier, CommittedEntry, Responder};
use crate::clock::{Clock, SystemClock};
use crate::command::Command;
use crate::consensus::{Consensus, RaftStatus};
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::node::{RaftConfig, RaftNode};
use crate::scheduler::ExpirationScheduler;
use crate::store::{Event, EventHistory, SharedStore, Store};
use crate::topology::ClusterTopology;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const PEER_QUEUE_DEPTH: usize = 1024;
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Configuration for spawning a Raft node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's unique ID (must appear in `peers`)
    pub id: u64,
    /// Address to bind for incoming Raft messages (e.g., "127.0.0.1:7101")
    pub listen_addr: String,
    /// Map of node ID → raft address for all cluster members (including self)
    pub peers: HashMap<u64, String>,
    pub raft: RaftConfig,
    /// Deadline for one dispatched command, from proposal to apply.
    pub request_timeout: Duration,
    /// Number of applied events kept for `since` queries.
    pub history_capacity: usize,
    /// Start an election immediately instead of waiting for a timeout.
    pub campaign: bool,
}

impl NodeConfig {
    /// A one-node cluster on an ephemeral port.
    pub fn single(id: u64) -> Self {
        let listen_addr = "127.0.0.1:0".to_string();
        Self {
            id,
            peers: HashMap::from([(id, listen_addr.clone())]),
            listen_addr,
            raft: RaftConfig::default(),
            request_timeout: Duration::from_secs(5),
            history_capacity: 1000,
            campaign: true,
        }
    }
}

/// Requests sent from handles to the worker task.
enum ClientRequest {
    Propose {
        command: Command,
        respond_to: Responder,
    },
    Campaign {
        respond_to: oneshot::Sender<anyhow::Result<()>>,
    },
    Shutdown,
}

/// Handle for sending requests to a running Raft worker.
///
/// Cheap to clone. The worker owns the `RaftNode`; the handle only holds a
/// request channel and the latest published [`RaftStatus`].
#[derive(Clone)]
pub struct RaftHandle {
    requests: mpsc::UnboundedSender<ClientRequest>,
    status: watch::Receiver<RaftStatus>,
}

impl RaftHandle {
    /// Forces this node to start an election campaign.
    ///
    /// On a leader this starts a new term and may hand leadership to
    /// another node.
    pub async fn campaign(&self) -> anyhow::Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.requests
            .send(ClientRequest::Campaign { respond_to })
            .map_err(|_| anyhow!("raft worker has stopped"))?;
        response.await.context("campaign response channel closed")?
    }

    /// Waits until this node knows who the leader is.
    pub async fn wait_for_leader(&self, within: Duration) -> anyhow::Result<RaftStatus> {
        let mut status = self.status.clone();
        let found = timeout(within, status.wait_for(|s| s.leader().is_some()))
            .await
            .context("no leader elected in time")?
            .context("raft worker has stopped")?;
        Ok(*found)
    }

    /// Signals the worker to shut down.
    pub fn shutdown(&self) {
        let _ = self.requests.send(ClientRequest::Shutdown);
    }
}

impl Consensus for RaftHandle {
    async fn propose(&self, command: Command) -> Result<Event> {
        let status = self.status();
        if !status.is_leader() {
            return Err(Error::NotLeader {
                leader: status.leader(),
            });
        }

        let (respond_to, response) = oneshot::channel();
        self.requests
            .send(ClientRequest::Propose {
                command,
                respond_to,
            })
            .map_err(|_| Error::Shutdown)?;
        response.await.map_err(|_| Error::Shutdown)?
    }

    fn status(&self) -> RaftStatus {
        *self.status.borrow()
    }
}

/// Identifies a proposal inside the raft entry context so the proposing
/// node can find the client waiting on it once the entry commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProposalId {
    node_id: u64,
    seq: u64,
}

impl ProposalId {
    fn encode(self) -> Vec<u8> {
        let mut context = Vec::with_capacity(16);
        context.extend_from_slice(&self.node_id.to_be_bytes());
        context.extend_from_slice(&self.seq.to_be_bytes());
        context
    }

    fn decode(context: &[u8]) -> Option<Self> {
        let node_id = u64::from_be_bytes(context.get(..8)?.try_into().ok()?);
        let seq = u64::from_be_bytes(context.get(8..16)?.try_into().ok()?);
        Some(Self { node_id, seq })
    }
}

/// A running node: every task plus handles to reach them.
pub struct RunningNode {
    pub id: u64,
    pub gateway: Gateway<RaftHandle>,
    pub raft: RaftHandle,
    pub store: SharedStore,
    pub history: Arc<EventHistory>,
    /// Where the raft listener actually bound (resolves port 0).
    pub raft_addr: SocketAddr,
    listener: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
    halted: watch::Receiver<bool>,
}

impl RunningNode {
    /// Resolves once the raft worker or the apply loop has stopped on an
    /// error, or the pipeline has been shut down. The store must not be
    /// served after that.
    pub fn halted(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut halted = self.halted.clone();
        async move {
            let _ = halted.wait_for(|halted| *halted).await;
        }
    }

    /// Whether the pipeline stopped on an error.
    pub fn is_halted(&self) -> bool {
        *self.halted.borrow()
    }

    /// Stops the worker and waits for the pipeline to drain.
    pub async fn shutdown(self) {
        self.raft.shutdown();
        self.listener.abort();
        for task in self.tasks {
            let _ = task.await;
        }
        info!(node_id = self.id, "node stopped");
    }
}

/// Spawns a Raft node and everything that hangs off it.
///
/// # Errors
///
/// Returns error if:
/// - the topology is invalid (even voter count, `id` missing from `peers`)
/// - the listener fails to bind to `config.listen_addr`
/// - the RaftNode cannot be created
pub async fn spawn_node(config: NodeConfig) -> anyhow::Result<RunningNode> {
    spawn_node_with_clock(config, Arc::new(SystemClock)).await
}

pub async fn spawn_node_with_clock(
    config: NodeConfig,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<RunningNode> {
    let topology = ClusterTopology::new(config.id, &config.listen_addr, &config.peers)?;
    ensure!(config.history_capacity > 0, "history capacity must be positive");

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let raft_addr = listener.local_addr()?;

    let mut node = RaftNode::new(config.id, &topology.voters(), &config.raft)?;
    if config.campaign {
        node.campaign()?;
    }

    let store = Store::shared();
    let history = Arc::new(EventHistory::new(config.history_capacity));
    let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
    let (commit_tx, commit_rx) = mpsc::unbounded_channel();
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(RaftStatus::initial(config.id));

    let peers = topology
        .remote_peers()
        .map(|(peer_id, addr)| (peer_id, spawn_peer_sender(config.id, peer_id, addr.to_string())))
        .collect();

    let raft = RaftHandle {
        requests: request_tx,
        status: status_rx,
    };

    let mut tasks = Vec::new();
    let (halt_tx, halt_rx) = watch::channel(false);
    let halt_tx = Arc::new(halt_tx);

    let worker = Worker::new(node, request_rx, inbound_rx, peers, commit_tx, status_tx);
    let tick = config.raft.tick_interval;
    let halt = halt_tx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(err) = worker.run(tick).await {
            error!(error = ?err, "raft worker crashed");
            halt.send_replace(true);
        }
    }));

    let applier = Applier::new(config.id, store.clone(), history.clone(), expiry_tx);
    tasks.push(tokio::spawn(async move {
        if let Err(err) = applier.run(commit_rx).await {
            error!(error = %err, "apply loop stopped");
            halt_tx.send_replace(true);
        }
    }));

    let scheduler =
        ExpirationScheduler::new(raft.clone(), clock.clone(), expiry_rx, config.request_timeout);
    tasks.push(tokio::spawn(scheduler.run()));

    let listener = tokio::spawn(run_listener(listener, inbound_tx));

    let gateway = Gateway::new(
        raft.clone(),
        store.clone(),
        history.clone(),
        clock,
        config.request_timeout,
    );

    info!(node_id = config.id, %raft_addr, voters = ?topology.voters(), "node started");

    Ok(RunningNode {
        id: config.id,
        gateway,
        raft,
        store,
        history,
        raft_addr,
        listener,
        tasks,
        halted: halt_rx,
    })
}

/// The task that runs the Raft event loop.
///
/// Owns the RaftNode and processes three kinds of events, whichever arrives
/// first: client requests, peer messages and ticks. After each one it drains
/// Ready state, forwards committed entries to the apply loop and publishes
/// the new status.
struct Worker {
    node: RaftNode,
    requests: mpsc::UnboundedReceiver<ClientRequest>,
    inbound: mpsc::UnboundedReceiver<Message>,
    peers: HashMap<u64, mpsc::Sender<Message>>,
    commits: mpsc::UnboundedSender<CommittedEntry>,
    status: watch::Sender<RaftStatus>,
    /// Proposals from this node that have not committed yet, by sequence.
    pending: HashMap<u64, Responder>,
    next_seq: u64,
    last_role: StateRole,
}

impl Worker {
    fn new(
        node: RaftNode,
        requests: mpsc::UnboundedReceiver<ClientRequest>,
        inbound: mpsc::UnboundedReceiver<Message>,
        peers: HashMap<u64, mpsc::Sender<Message>>,
        commits: mpsc::UnboundedSender<CommittedEntry>,
        status: watch::Sender<RaftStatus>,
    ) -> Self {
        let last_role = node.role();
        Self {
            node,
            requests,
            inbound,
            peers,
            commits,
            status,
            pending: HashMap::new(),
            next_seq: 0,
            last_role,
        }
    }

    async fn run(mut self, tick_interval: Duration) -> anyhow::Result<()> {
        let mut ticker = interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.process_ready()?;
        self.observe_state();

        loop {
            select! {
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if !self.handle_request(request) {
                            break;
                        }
                    }
                    None => break,
                },
                msg = self.inbound.recv() => match msg {
                    Some(msg) => {
                        let from = msg.from;
                        if let Err(err) = self.node.step(msg) {
                            warn!(node_id = self.node.id(), from, error = %err, "dropping raft message");
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => self.node.tick(),
            }

            self.process_ready()?;
            self.observe_state();
        }

        self.fail_pending(Error::Shutdown);
        debug!(node_id = self.node.id(), "raft worker stopped");
        Ok(())
    }

    /// Returns `false` if shutdown was requested.
    fn handle_request(&mut self, request: ClientRequest) -> bool {
        match request {
            ClientRequest::Propose {
                command,
                respond_to,
            } => self.propose(command, respond_to),
            ClientRequest::Campaign { respond_to } => {
                let previous = self.node.role();
                let result = self.node.campaign();
                if result.is_ok() {
                    info!(node_id = self.node.id(), ?previous, "campaign started");
                }
                let _ = respond_to.send(result);
            }
            ClientRequest::Shutdown => return false,
        }
        true
    }

    /// Appends a proposal to the log, or fails it immediately.
    ///
    /// Only a leader accepts proposals; followers answer with the leader they
    /// know of so the caller can redirect.
    fn propose(&mut self, command: Command, respond_to: Responder) {
        if self.node.role() != StateRole::Leader {
            let leader = self.node.leader_id();
            let _ = respond_to.send(Err(Error::NotLeader {
                leader: (leader != 0).then_some(leader),
            }));
            return;
        }

        let data = match command.encode() {
            Ok(data) => data,
            Err(err) => {
                let _ = respond_to.send(Err(err));
                return;
            }
        };

        let id = ProposalId {
            node_id: self.node.id(),
            seq: self.next_seq,
        };
        self.next_seq += 1;

        match self.node.propose(id.encode(), data) {
            Ok(()) => {
                self.pending.insert(id.seq, respond_to);
            }
            Err(err) => {
                debug!(node_id = id.node_id, error = %err, "proposal dropped by raft");
                let _ = respond_to.send(Err(Error::ProposalLost));
            }
        }
    }

    /// Drains all ready state from Raft and processes it.
    ///
    /// Messages go out before committed entries are handed to the apply
    /// loop. Entries reach the apply loop in log order.
    fn process_ready(&mut self) -> anyhow::Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch_message(msg)?;
            }
            for committed in bundle.committed {
                let responder = ProposalId::decode(&committed.context)
                    .filter(|id| id.node_id == self.node.id())
                    .and_then(|id| self.pending.remove(&id.seq));
                self.commits
                    .send(CommittedEntry {
                        raft_index: committed.index,
                        term: committed.term,
                        payload: committed.payload,
                        responder,
                    })
                    .map_err(|_| anyhow!("apply loop has stopped"))?;
            }
        }
        Ok(())
    }

    /// Sends a Raft message to its destination.
    ///
    /// Messages addressed to this node are fed back into `node.step()`.
    /// A full or closed peer queue drops the message; raft retransmits.
    fn dispatch_message(&mut self, msg: Message) -> anyhow::Result<()> {
        if msg.to == self.node.id() {
            self.node.step(msg)?;
            return Ok(());
        }

        let to = msg.to;
        let Some(peer) = self.peers.get(&to) else {
            warn!(node_id = self.node.id(), to, "no address for peer, dropping message");
            return Ok(());
        };
        if peer.try_send(msg).is_err() {
            debug!(node_id = self.node.id(), to, "peer queue full, dropping message");
        }
        Ok(())
    }

    /// Publishes status changes and fails in-flight proposals on step-down.
    fn observe_state(&mut self) {
        let current = RaftStatus {
            node_id: self.node.id(),
            role: self.node.role(),
            leader_id: self.node.leader_id(),
            term: self.node.term(),
            commit_index: self.node.commit_index(),
        };

        if current.role != self.last_role {
            info!(
                node_id = current.node_id,
                from = ?self.last_role,
                to = ?current.role,
                leader = current.leader_id,
                term = current.term,
                "role changed"
            );
            if self.last_role == StateRole::Leader {
                self.fail_pending(Error::ProposalLost);
            }
            self.last_role = current.role;
        }

        self.status.send_if_modified(|published| {
            if *published == current {
                false
            } else {
                *published = current;
                true
            }
        });
    }

    fn fail_pending(&mut self, err: Error) {
        if self.pending.is_empty() {
            return;
        }
        debug!(node_id = self.node.id(), count = self.pending.len(), error = %err, "failing pending proposals");
        for (_, respond_to) in self.pending.drain() {
            let _ = respond_to.send(Err(err.clone()));
        }
    }
}

/// Spawns the task that owns the connection to one peer.
fn spawn_peer_sender(node_id: u64, peer_id: u64, addr: String) -> mpsc::Sender<Message> {
    let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
    tokio::spawn(run_peer_sender(node_id, peer_id, addr, rx));
    tx
}

/// Writes queued messages to a peer over one persistent connection,
/// reconnecting on the next message after any failure.
async fn run_peer_sender(
    node_id: u64,
    peer_id: u64,
    addr: String,
    mut outbound: mpsc::Receiver<Message>,
) {
    let mut conn: Option<TcpStream> = None;
    while let Some(msg) = outbound.recv().await {
        if conn.is_none() {
            match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    debug!(node_id, peer_id, addr = %addr, "connected to peer");
                    conn = Some(stream);
                }
                Ok(Err(err)) => {
                    debug!(node_id, peer_id, addr = %addr, error = %err, "peer unreachable");
                    continue;
                }
                Err(_) => {
                    debug!(node_id, peer_id, addr = %addr, "peer connect timed out");
                    continue;
                }
            }
        }

        if let Some(stream) = conn.as_mut() {
            if let Err(err) = write_frame(stream, &msg.encode_to_vec()).await {
                debug!(node_id, peer_id, error = %err, "peer connection lost");
                conn = None;
            }
        }
    }
}

/// Frames are length-prefixed:
/// - 4 bytes: message length (big-endian u32)
/// - N bytes: protobuf-encoded Message
async fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await
}

/// Accepts peer connections and spawns a reader for each.
async fn run_listener(listener: TcpListener, inbound: mpsc::UnboundedSender<Message>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let inbound = inbound.clone();
                tokio::spawn(async move {
                    if let Err(err) = read_frames(stream, inbound).await {
                        debug!(%remote, error = %err, "peer connection closed");
                    }
                });
            }
            Err(err) => warn!(error = %err, "accept error"),
        }
    }
}

/// Reads messages from one connection until the peer hangs up.
async fn read_frames(
    mut stream: TcpStream,
    inbound: mpsc::UnboundedSender<Message>,
) -> anyhow::Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        ensure!(len <= MAX_FRAME_LEN, "frame of {len} bytes exceeds limit");

        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        let msg = Message::decode(&buf[..]).context("invalid raft message")?;
        if inbound.send(msg).is_err() {
            return Ok(());
        }
    }
}
