//! Watcher channels and change events.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::cache::CacheKey;

/// Kind of mutation that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Key was inserted, overwritten or incremented
    Write,
    /// Key was explicitly deleted or flushed
    Delete,
    /// Key was removed to free capacity
    Evict,
    /// Key was removed because it expired
    Expire,
}

bitflags! {
    /// Event types a predicate subscribes to. Empty means all of them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventFilter: u8 {
        const WRITE = 0b0001;
        const DELETE = 0b0010;
        const EVICT = 0b0100;
        const EXPIRE = 0b1000;
    }
}

impl EventType {
    pub fn flag(self) -> EventFilter {
        match self {
            EventType::Write => EventFilter::WRITE,
            EventType::Delete => EventFilter::DELETE,
            EventType::Evict => EventFilter::EVICT,
            EventType::Expire => EventFilter::EXPIRE,
        }
    }
}

impl EventFilter {
    /// Empty filters match every event type.
    pub fn accepts(self, event_type: EventType) -> bool {
        self.is_empty() || self.contains(event_type.flag())
    }
}

/// A single change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub watch_id: u64,
    pub partition: CacheKey,
    pub key: CacheKey,
    /// New payload for writes, None for removals
    pub value: Option<Bytes>,
    pub event_type: EventType,
}

/// Receiving half handed to the subscriber.
pub type WatchReceiver = mpsc::UnboundedReceiver<ChangeEvent>;

// == Watcher Channel ==
/// One subscriber session: an unbounded FIFO of events plus the number of
/// predicates currently routing into it.
///
/// Dropping or closing the receiver makes every later publish fail, which is
/// how partitions discover dead subscribers.
#[derive(Debug)]
pub struct WatcherChannel {
    id: u64,
    sender: mpsc::UnboundedSender<ChangeEvent>,
    predicates: AtomicUsize,
}

impl WatcherChannel {
    pub fn new(id: u64) -> (Arc<Self>, WatchReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            id,
            sender,
            predicates: AtomicUsize::new(0),
        });
        (channel, receiver)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// True once the subscriber can no longer receive events.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Number of predicates referencing this channel.
    pub fn predicate_count(&self) -> usize {
        self.predicates.load(Ordering::Acquire)
    }

    /// Enqueues an event. Returns false when the subscriber is gone.
    pub(crate) fn publish(&self, event: ChangeEvent) -> bool {
        self.sender.send(event).is_ok()
    }

    pub(crate) fn attach(&self) {
        self.predicates.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn detach(&self) {
        let _ = self
            .predicates
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }
}
