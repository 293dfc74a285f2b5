//! Background expiration of TTL-bearing keys.
//!
//! The apply loop tells the scheduler about every TTL that is set, replaced
//! or cleared. The scheduler sleeps until the earliest deadline and then, on
//! the leader only, proposes an `Expire` command through consensus so every
//! replica removes the key at the same log position. Followers keep their
//! timers and re-check periodically in case they become leader.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::command::Command;
use crate::consensus::Consensus;
use crate::error::Error;
use crate::store::{Action, Event};

/// How long a fired timer waits before firing again if the key is still
/// there (follower, lost proposal, slow commit).
pub const DEFAULT_RECHECK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpirationUpdate {
    /// `key` now expires at `expiration`, replacing any earlier timer.
    Arm {
        key: String,
        expiration: DateTime<Utc>,
    },
    /// `key` and everything below it no longer expire.
    Disarm { key: String },
}

impl ExpirationUpdate {
    pub fn from_event(event: &Event) -> Option<Self> {
        let key = event.key().to_string();
        match event.action {
            Action::Get => None,
            Action::Set | Action::CompareAndSwap => Some(match event.node.expiration {
                Some(expiration) => ExpirationUpdate::Arm { key, expiration },
                None => ExpirationUpdate::Disarm { key },
            }),
            Action::Delete | Action::Expire => Some(ExpirationUpdate::Disarm { key }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    expiration: DateTime<Utc>,
    due: DateTime<Utc>,
}

/// Deadlines ordered by due time.
///
/// `timers` is authoritative; heap entries whose due time no longer matches
/// their key's timer are stale and skipped lazily.
#[derive(Default)]
struct ExpirationQueue {
    timers: BTreeMap<String, Timer>,
    heap: BinaryHeap<Reverse<(DateTime<Utc>, String)>>,
}

impl ExpirationQueue {
    fn apply(&mut self, update: ExpirationUpdate) {
        match update {
            ExpirationUpdate::Arm { key, expiration } => self.schedule(key, expiration, expiration),
            ExpirationUpdate::Disarm { key } => self.disarm(&key),
        }
    }

    fn schedule(&mut self, key: String, expiration: DateTime<Utc>, due: DateTime<Utc>) {
        self.heap.push(Reverse((due, key.clone())));
        self.timers.insert(key, Timer { expiration, due });
    }

    fn disarm(&mut self, key: &str) {
        let prefix = if key == "/" {
            "/".to_string()
        } else {
            format!("{key}/")
        };
        self.timers.remove(key);
        let doomed: Vec<String> = self
            .timers
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in doomed {
            self.timers.remove(&key);
        }
    }

    /// Drops the timer only if it still belongs to `expiration`.
    fn forget(&mut self, key: &str, expiration: DateTime<Utc>) {
        if self
            .timers
            .get(key)
            .is_some_and(|timer| timer.expiration == expiration)
        {
            self.timers.remove(key);
        }
    }

    fn is_live(&self, due: DateTime<Utc>, key: &str) -> bool {
        self.timers.get(key).is_some_and(|timer| timer.due == due)
    }

    fn next_due(&mut self) -> Option<DateTime<Utc>> {
        while let Some(Reverse((due, key))) = self.heap.peek() {
            if self.is_live(*due, key) {
                return Some(*due);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops every live timer due at or before `now`.
    fn take_due(&mut self, now: DateTime<Utc>) -> Vec<(String, DateTime<Utc>)> {
        let mut due = Vec::new();
        while let Some(next) = self.next_due() {
            if next > now {
                break;
            }
            if let Some(Reverse((_, key))) = self.heap.pop() {
                if let Some(timer) = self.timers.get(&key) {
                    due.push((key, timer.expiration));
                }
            }
        }
        due
    }

    fn len(&self) -> usize {
        self.timers.len()
    }
}

pub struct ExpirationScheduler<C> {
    consensus: C,
    clock: Arc<dyn Clock>,
    updates: mpsc::UnboundedReceiver<ExpirationUpdate>,
    queue: ExpirationQueue,
    propose_timeout: Duration,
    recheck: Duration,
}

impl<C: Consensus> ExpirationScheduler<C> {
    pub fn new(
        consensus: C,
        clock: Arc<dyn Clock>,
        updates: mpsc::UnboundedReceiver<ExpirationUpdate>,
        propose_timeout: Duration,
    ) -> Self {
        Self {
            consensus,
            clock,
            updates,
            queue: ExpirationQueue::default(),
            propose_timeout,
            recheck: DEFAULT_RECHECK,
        }
    }

    pub fn with_recheck(mut self, recheck: Duration) -> Self {
        self.recheck = recheck;
        self
    }

    /// Runs until the apply loop drops its sender.
    pub async fn run(mut self) {
        loop {
            let sleep_for = self.queue.next_due().map(|due| {
                (due - self.clock.now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            });

            select! {
                update = self.updates.recv() => match update {
                    Some(update) => self.queue.apply(update),
                    None => break,
                },
                _ = sleep_or_pending(sleep_for) => self.fire_due().await,
            }
        }
        debug!(armed = self.queue.len(), "expiration scheduler stopped");
    }

    async fn fire_due(&mut self) {
        let now = self.clock.now();
        for (key, expiration) in self.queue.take_due(now) {
            // Stays armed until the applied Expire (or a newer TTL) disarms it.
            let retry_at = now
                + chrono::Duration::from_std(self.recheck).unwrap_or(chrono::Duration::zero());
            self.queue.schedule(key.clone(), expiration, retry_at);

            if !self.consensus.is_leader() {
                debug!(key = %key, "ttl elapsed on follower; waiting for the leader");
                continue;
            }

            let command = Command::Expire {
                key: key.clone(),
                expiration,
            };
            match timeout(self.propose_timeout, self.consensus.propose(command)).await {
                Ok(Ok(event)) => info!(key = %key, index = event.index, "key expired"),
                Ok(Err(Error::ExpirationSuperseded(_) | Error::KeyNotFound(_))) => {
                    debug!(key = %key, "expiration superseded");
                    self.queue.forget(&key, expiration);
                }
                Ok(Err(err)) => warn!(key = %key, error = %err, "expire proposal failed; will retry"),
                Err(_) => warn!(key = %key, "expire proposal timed out; will retry"),
            }
        }
    }
}

async fn sleep_or_pending(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::applier::Applier;
    use crate::clock::SystemClock;
    use crate::consensus::fake::FakeConsensus;
    use crate::store::{EventHistory, SharedStore, Store};

    struct Harness {
        consensus: FakeConsensus,
        store: SharedStore,
        history: Arc<EventHistory>,
        task: tokio::task::JoinHandle<()>,
    }

    /// Wires a fake leader whose applier feeds TTL updates back into a
    /// running scheduler, the same loop the real node builds.
    fn harness() -> Harness {
        let store = Store::shared();
        let history = Arc::new(EventHistory::new(64));
        let (tx, rx) = mpsc::unbounded_channel();
        let consensus = FakeConsensus::new(Applier::new(1, store.clone(), history.clone(), tx));
        let scheduler = ExpirationScheduler::new(
            consensus.clone(),
            Arc::new(SystemClock),
            rx,
            Duration::from_secs(1),
        )
        .with_recheck(Duration::from_millis(50));
        let task = tokio::spawn(scheduler.run());
        Harness {
            consensus,
            store,
            history,
            task,
        }
    }

    fn set_with_ttl(key: &str, ttl_ms: i64) -> Command {
        Command::Set {
            key: key.into(),
            value: "v".into(),
            expiration: Some(Utc::now() + ChronoDuration::milliseconds(ttl_ms)),
        }
    }

    fn expire_events(history: &EventHistory, key: &str) -> usize {
        history
            .since(0)
            .unwrap()
            .iter()
            .filter(|e| e.action == Action::Expire && e.key() == key)
            .count()
    }

    #[tokio::test]
    async fn leader_expires_key_exactly_once() {
        let h = harness();
        h.consensus.propose(set_with_ttl("/foo", 100)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(matches!(
            h.store.read().get("/foo", false, false),
            Err(Error::KeyNotFound(_))
        ));
        assert_eq!(expire_events(&h.history, "/foo"), 1);
        h.task.abort();
    }

    #[tokio::test]
    async fn follower_waits_for_the_leader() {
        let h = harness();
        h.consensus.propose(set_with_ttl("/foo", 50)).await.unwrap();
        h.consensus.set_leader(false);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.store.read().get("/foo", false, false).is_ok());
        assert_eq!(h.consensus.proposed().len(), 1);

        // Taking over leadership picks the pending expiration back up.
        h.consensus.set_leader(true);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.store.read().get("/foo", false, false).is_err());
        assert_eq!(expire_events(&h.history, "/foo"), 1);
        h.task.abort();
    }

    #[tokio::test]
    async fn refreshed_ttl_replaces_the_old_timer() {
        let h = harness();
        h.consensus.propose(set_with_ttl("/foo", 100)).await.unwrap();
        h.consensus.propose(set_with_ttl("/foo", 60_000)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(h.store.read().get("/foo", false, false).is_ok());
        assert_eq!(expire_events(&h.history, "/foo"), 0);
        h.task.abort();
    }

    #[tokio::test]
    async fn deleted_key_never_fires() {
        let h = harness();
        h.consensus.propose(set_with_ttl("/dir/foo", 100)).await.unwrap();
        h.consensus
            .propose(Command::Delete {
                key: "/dir".into(),
                recursive: true,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let expires = h
            .consensus
            .proposed()
            .iter()
            .filter(|c| matches!(c, Command::Expire { .. }))
            .count();
        assert_eq!(expires, 0);
        h.task.abort();
    }

    #[test]
    fn disarm_removes_descendants_only() {
        let mut queue = ExpirationQueue::default();
        let at = Utc::now();
        for key in ["/a", "/a-x", "/a/b", "/a/b/c", "/ab", "/b"] {
            queue.apply(ExpirationUpdate::Arm {
                key: key.into(),
                expiration: at,
            });
        }
        queue.apply(ExpirationUpdate::Disarm { key: "/a".into() });

        let remaining: Vec<&str> = queue.timers.keys().map(String::as_str).collect();
        assert_eq!(remaining, vec!["/a-x", "/ab", "/b"]);
    }

    #[test]
    fn take_due_skips_replaced_timers() {
        let mut queue = ExpirationQueue::default();
        let now = Utc::now();
        let early = now - ChronoDuration::seconds(1);
        let late = now + ChronoDuration::seconds(60);

        queue.apply(ExpirationUpdate::Arm {
            key: "/x".into(),
            expiration: early,
        });
        queue.apply(ExpirationUpdate::Arm {
            key: "/y".into(),
            expiration: early,
        });
        queue.apply(ExpirationUpdate::Arm {
            key: "/x".into(),
            expiration: late,
        });

        assert_eq!(queue.take_due(now), vec![("/y".to_string(), early)]);
        assert_eq!(queue.next_due(), Some(late));
    }
}
