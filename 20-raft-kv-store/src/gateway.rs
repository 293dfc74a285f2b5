//! Dispatch gateway: the entry point request handlers use.
//!
//! Writes are proposed through consensus and answered with the event the
//! apply loop produced for that exact command. Reads go straight to the
//! local store and are stamped with the commit index and term observed at
//! the moment of the read.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tracing::debug;

use crate::clock::Clock;
use crate::command::Command;
use crate::consensus::Consensus;
use crate::error::{Error, Result};
use crate::store::{Event, EventHistory, SharedStore, clean_path};

/// Store index, commit index and term observed under one store lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub index: u64,
    pub commit_index: u64,
    pub term: u64,
}

/// A read served from the local store, without going through the log.
#[derive(Debug, Clone)]
pub struct ReadResult {
    /// `index` is the store index at the time of the read.
    pub event: Event,
    pub commit_index: u64,
    pub term: u64,
}

#[derive(Clone)]
pub struct Gateway<C> {
    consensus: C,
    store: SharedStore,
    history: Arc<EventHistory>,
    clock: Arc<dyn Clock>,
    request_timeout: Duration,
}

impl<C: Consensus> Gateway<C> {
    pub fn new(
        consensus: C,
        store: SharedStore,
        history: Arc<EventHistory>,
        clock: Arc<dyn Clock>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            consensus,
            store,
            history,
            clock,
            request_timeout,
        }
    }

    pub fn consensus(&self) -> &C {
        &self.consensus
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn history(&self) -> &Arc<EventHistory> {
        &self.history
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Proposes `command` and waits for it to be applied.
    ///
    /// `NotLeader` is returned as is so the caller can redirect. If the
    /// deadline passes first the caller gets `Timeout`; the command may
    /// still commit later, unreported.
    pub async fn dispatch(&self, command: Command) -> Result<Event> {
        self.validate(&command)?;
        let key = command.key().to_string();
        match timeout(self.request_timeout, self.consensus.propose(command)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(key = %key, timeout = ?self.request_timeout, "dispatch timed out");
                Err(Error::Timeout)
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<Event> {
        let expiration = self.expiration_after(ttl)?;
        self.dispatch(Command::Set {
            key: key.to_string(),
            value: value.to_string(),
            expiration,
        })
        .await
    }

    pub async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        prev_value: &str,
        ttl: Option<Duration>,
    ) -> Result<Event> {
        let expiration = self.expiration_after(ttl)?;
        self.dispatch(Command::CompareAndSwap {
            key: key.to_string(),
            value: value.to_string(),
            prev_value: prev_value.to_string(),
            expiration,
        })
        .await
    }

    pub async fn delete(&self, key: &str, recursive: bool) -> Result<Event> {
        self.dispatch(Command::Delete {
            key: key.to_string(),
            recursive,
        })
        .await
    }

    /// Reads from the local store. May be stale on a follower or a deposed
    /// leader; route through [`dispatch`](Self::dispatch) for ordering.
    pub fn get(&self, path: &str, recursive: bool, sorted: bool) -> Result<ReadResult> {
        let (stamp, result) = self.read(path, recursive, sorted);
        Ok(ReadResult {
            event: result?,
            commit_index: stamp.commit_index,
            term: stamp.term,
        })
    }

    /// Like [`get`](Self::get), but a failed read still reports the
    /// stamp it was observed at.
    pub fn read(&self, path: &str, recursive: bool, sorted: bool) -> (Stamp, Result<Event>) {
        let store = self.store.read();
        let status = self.consensus.status();
        let stamp = Stamp {
            index: store.index(),
            commit_index: status.commit_index,
            term: status.term,
        };
        (stamp, store.get(path, recursive, sorted))
    }

    pub fn stamp(&self) -> Stamp {
        let store = self.store.read();
        let status = self.consensus.status();
        Stamp {
            index: store.index(),
            commit_index: status.commit_index,
            term: status.term,
        }
    }

    fn expiration_after(&self, ttl: Option<Duration>) -> Result<Option<DateTime<Utc>>> {
        let Some(ttl) = ttl else {
            return Ok(None);
        };
        if ttl.is_zero() {
            return Err(Error::InvalidTtl("0".into()));
        }
        let expiration = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|delta| self.clock.now().checked_add_signed(delta))
            .ok_or_else(|| Error::InvalidTtl(ttl.as_secs().to_string()))?;
        Ok(Some(expiration))
    }

    /// Rejects what no replica could accept, before it reaches the log.
    fn validate(&self, command: &Command) -> Result<()> {
        clean_path(command.key())?;
        let expiration = match command {
            Command::Set { expiration, .. } | Command::CompareAndSwap { expiration, .. } => {
                *expiration
            }
            Command::Delete { .. } | Command::Expire { .. } => None,
        };
        if let Some(expiration) = expiration {
            if expiration <= self.clock.now() {
                return Err(Error::InvalidTtl(expiration.to_rfc3339()));
            }
        }
        Ok(())
    }
}
