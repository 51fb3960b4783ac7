//! Fan-out of operation events to the progress reporter and the CLI.
//!
//! Publishing never waits on subscribers. A subscriber that falls more than
//! the channel capacity behind loses the oldest events and observes
//! `RecvError::Lagged`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::{Event, EventEnvelope};

/// Events buffered per subscriber before the oldest are dropped.
const DEFAULT_CAPACITY: usize = 256;

/// Cloneable handle shared by the engine, executors and renderers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    /// Next sequence number, shared by all clones
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Bus buffering `capacity` events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wrap an event in an envelope carrying the next sequence number and
    /// publish it.
    ///
    /// Returns how many subscribers got it; zero means it was discarded.
    pub fn emit(&self, event: Event) -> usize {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.publish(EventEnvelope::new(event).with_sequence(sequence))
    }

    /// Send a prepared envelope without touching the sequence counter.
    pub fn publish(&self, envelope: EventEnvelope) -> usize {
        self.sender.send(envelope).unwrap_or(0)
    }

    /// Receiver for events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events emitted through [`EventBus::emit`] so far.
    pub fn event_count(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("event_count", &self.event_count())
            .finish()
    }
}
