use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use super::event::Event;
use crate::error::{Error, Result};

/// Broadcast buffer for live subscribers; slow subscribers see `Lagged`.
const FEED_CAPACITY: usize = 256;

/// Bounded record of recently applied events.
///
/// `push` is called from the apply loop and never waits: the ring drops its
/// oldest entry when full and the broadcast feed drops messages for lagging
/// receivers instead of applying back-pressure.
pub struct EventHistory {
    inner: Mutex<Ring>,
    feed: broadcast::Sender<Event>,
}

struct Ring {
    events: VecDeque<Event>,
    capacity: usize,
    /// Index of the newest event that has been evicted.
    last_evicted: Option<u64>,
}

impl EventHistory {
    pub fn new(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Mutex::new(Ring {
                events: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                last_evicted: None,
            }),
            feed,
        }
    }

    pub fn push(&self, event: Event) {
        {
            let mut ring = self.inner.lock();
            if ring.events.len() == ring.capacity {
                if let Some(evicted) = ring.events.pop_front() {
                    ring.last_evicted = Some(evicted.index);
                }
            }
            ring.events.push_back(event.clone());
        }
        // No receivers is the common case and not an error.
        if self.feed.send(event).is_err() {
            debug!("no event subscribers");
        }
    }

    /// Retained events with `index >= since`, oldest first.
    ///
    /// Fails with `HistoryCleared` if events at or after `since` may already
    /// have been evicted.
    pub fn since(&self, since: u64) -> Result<Vec<Event>> {
        let ring = self.inner.lock();
        if let Some(last_evicted) = ring.last_evicted {
            if since <= last_evicted {
                let oldest = ring.events.front().map_or(last_evicted + 1, |event| event.index);
                return Err(Error::HistoryCleared {
                    requested: since,
                    oldest,
                });
            }
        }
        Ok(ring
            .events
            .iter()
            .filter(|event| event.index >= since)
            .cloned()
            .collect())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.feed.subscribe()
    }
}
