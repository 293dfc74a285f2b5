//! Sequential apply loop: committed commands in, events out.
//!
//! The Raft worker hands every committed command to this loop over a channel,
//! in log order. Each command is applied under the store's write lock so the
//! index bump and the tree mutation are observed together.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::command::Command;
use crate::error::Result;
use crate::scheduler::ExpirationUpdate;
use crate::store::{Event, EventHistory, SharedStore};

/// Channel back to the client waiting on a proposal.
pub type Responder = oneshot::Sender<Result<Event>>;

/// A committed log entry on its way to the state machine.
///
/// `responder` is set only on the node that proposed the entry and only
/// while the proposer is still waiting.
pub struct CommittedEntry {
    pub raft_index: u64,
    pub term: u64,
    pub payload: Result<Command>,
    pub responder: Option<Responder>,
}

/// Records details when a command is applied to the state machine.
///
/// `store_index` is the global index the command consumed; `result` is the
/// event, or the reason the state machine rejected the command.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub node_id: u64,
    pub raft_index: u64,
    pub term: u64,
    pub store_index: u64,
    pub result: Result<Event>,
}

pub struct Applier {
    node_id: u64,
    store: SharedStore,
    history: Arc<EventHistory>,
    expirations: mpsc::UnboundedSender<ExpirationUpdate>,
}

impl Applier {
    pub fn new(
        node_id: u64,
        store: SharedStore,
        history: Arc<EventHistory>,
        expirations: mpsc::UnboundedSender<ExpirationUpdate>,
    ) -> Self {
        Self {
            node_id,
            store,
            history,
            expirations,
        }
    }

    /// Applies one committed payload.
    ///
    /// Returns `Err` only for fatal errors; rejections by the state machine
    /// are carried inside the report.
    pub fn apply(
        &mut self,
        raft_index: u64,
        term: u64,
        payload: Result<Command>,
    ) -> Result<ApplyReport> {
        let (store_index, result) = {
            let mut store = self.store.write();
            let result = match &payload {
                Ok(command) => store.apply(command),
                Err(err) => {
                    store.reject();
                    Err(err.clone())
                }
            };
            (store.index(), result)
        };

        if let Err(err) = &result {
            if err.is_fatal() {
                return Err(err.clone());
            }
        }

        if let Ok(event) = &result {
            if let Some(update) = ExpirationUpdate::from_event(event) {
                // The scheduler only goes away during shutdown.
                let _ = self.expirations.send(update);
            }
            self.history.push(event.clone());
        }

        Ok(ApplyReport {
            node_id: self.node_id,
            raft_index,
            term,
            store_index,
            result,
        })
    }

    /// Drains committed entries until the worker hangs up or a fatal error
    /// occurs. After a fatal error nothing else is applied.
    pub async fn run(mut self, mut commits: mpsc::UnboundedReceiver<CommittedEntry>) -> Result<()> {
        while let Some(entry) = commits.recv().await {
            let CommittedEntry {
                raft_index,
                term,
                payload,
                responder,
            } = entry;

            let report = match self.apply(raft_index, term, payload) {
                Ok(report) => report,
                Err(err) => {
                    error!(node_id = self.node_id, raft_index, error = %err, "apply halted");
                    if let Some(responder) = responder {
                        let _ = responder.send(Err(err.clone()));
                    }
                    return Err(err);
                }
            };

            match &report.result {
                Ok(event) => info!(
                    node_id = report.node_id,
                    action = event.action.as_str(),
                    key = event.key(),
                    index = report.store_index,
                    raft_index = report.raft_index,
                    term = report.term,
                    "applied"
                ),
                Err(err) => debug!(
                    node_id = report.node_id,
                    index = report.store_index,
                    raft_index = report.raft_index,
                    error = %err,
                    "command rejected"
                ),
            }

            if let Some(responder) = responder {
                // The caller may have given up waiting; that is fine.
                let _ = responder.send(report.result);
            }
        }
        Ok(())
    }
}
