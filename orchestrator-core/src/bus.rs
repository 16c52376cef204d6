//! In-process event bus: bounded ring buffer + per-subscriber replay (C3).
//!
//! `sipag-core` has no in-process pub/sub — `sipag`'s `events.rs` only
//! appends/reads NDJSON files, because `sipag` has no always-on dashboard
//! server. This module is new territory for the core: O(1) publish that
//! overwrites the oldest entry when full, synchronous fan-out to current
//! subscribers with subscriber failures swallowed, and atomic
//! replay-then-live delivery per subscriber. The per-issue lock map in
//! [`crate::labels`] and this module's subscriber map share the same
//! lazily-created, mutex-guarded map shape.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::trace;

use crate::event::Event;

/// Default ring buffer capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

struct Inner {
    ring: VecDeque<Event>,
    capacity: usize,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Event>>,
    next_subscriber_id: u64,
}

impl Inner {
    fn push(&mut self, event: Event) {
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(event);
    }
}

/// The bounded, in-process publish/subscribe event bus.
pub struct EventBus {
    inner: Mutex<Inner>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(capacity.max(1)),
                capacity: capacity.max(1),
                subscribers: HashMap::new(),
                next_subscriber_id: 0,
            }),
        }
    }

    /// Publish an event: O(1), synchronous fan-out to current subscribers.
    /// A subscriber whose receiver has been dropped is pruned lazily on the
    /// next publish rather than causing an error — this is the Rust
    /// rendition of "subscriber exceptions are swallowed".
    pub fn publish(&self, event: Event) {
        let mut inner = self.inner.lock().expect("event bus mutex poisoned");
        inner.push(event.clone());
        let mut dead = Vec::new();
        for (id, sender) in inner.subscribers.iter() {
            if sender.send(event.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            inner.subscribers.remove(&id);
        }
        trace!(subscriber_count = inner.subscribers.len(), "event published");
    }

    /// Subscribe and atomically receive the replay prefix plus a live
    /// channel. `replay_last` is clamped to `min(replay_last, ring.count,
    /// capacity)`.
    pub fn subscribe(&self, replay_last: usize) -> (u64, Vec<Event>, mpsc::UnboundedReceiver<Event>) {
        let mut inner = self.inner.lock().expect("event bus mutex poisoned");
        let take = replay_last.min(inner.ring.len()).min(inner.capacity);
        let start = inner.ring.len() - take;
        let replay: Vec<Event> = inner.ring.iter().skip(start).cloned().collect();

        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.subscribers.insert(id, tx);
        (id, replay, rx)
    }

    /// Explicitly unsubscribe, releasing the subscriber id `subscribe`
    /// returned.
    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().expect("event bus mutex poisoned");
        inner.subscribers.remove(&id);
    }

    /// Return up to `n` most recent events, in publish order.
    pub fn get_recent(&self, n: usize) -> Vec<Event> {
        let inner = self.inner.lock().expect("event bus mutex poisoned");
        let take = n.min(inner.ring.len());
        let start = inner.ring.len() - take;
        inner.ring.iter().skip(start).cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("event bus mutex poisoned").subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}
