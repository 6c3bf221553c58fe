//! Watch predicates and the per-partition predicate list.

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::cache::CacheKey;
use crate::watch::{ChangeEvent, EventFilter, EventType, WatcherChannel};

/// Binds a watch id, partition, optional key and filter to a subscriber.
#[derive(Debug, Clone)]
pub struct WatchPredicate {
    pub owner: Arc<WatcherChannel>,
    pub watch_id: u64,
    pub partition: CacheKey,
    /// None watches every key in the partition
    pub key: Option<CacheKey>,
    pub filter: EventFilter,
}

impl WatchPredicate {
    pub fn matches(&self, key: &CacheKey, event_type: EventType) -> bool {
        self.filter.accepts(event_type) && self.key.as_ref().map_or(true, |k| k == key)
    }

    fn is_same(&self, owner_id: u64, watch_id: u64) -> bool {
        self.owner.id() == owner_id && self.watch_id == watch_id
    }
}

// == Watch List ==
/// Predicates attached to one partition.
///
/// Lives inside the partition's locked state, so every method runs under the
/// partition write lock except `len`/`is_empty` reads.
#[derive(Debug, Default)]
pub struct WatchList {
    predicates: Vec<WatchPredicate>,
}

impl WatchList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Adds a predicate, replacing any existing one with the same
    /// (owner, watch id). Returns true if it was new.
    pub fn add(&mut self, predicate: WatchPredicate) -> bool {
        let owner_id = predicate.owner.id();
        let watch_id = predicate.watch_id;
        match self
            .predicates
            .iter_mut()
            .find(|p| p.is_same(owner_id, watch_id))
        {
            Some(existing) => {
                *existing = predicate;
                false
            }
            None => {
                predicate.owner.attach();
                self.predicates.push(predicate);
                true
            }
        }
    }

    /// Removes the predicate for (owner, watch id). Returns true if found.
    pub fn remove(&mut self, owner_id: u64, watch_id: u64) -> bool {
        let before = self.predicates.len();
        self.predicates.retain(|p| {
            if p.is_same(owner_id, watch_id) {
                p.owner.detach();
                false
            } else {
                true
            }
        });
        self.predicates.len() != before
    }

    /// Removes every predicate owned by a channel. Returns how many.
    pub fn remove_owner(&mut self, owner_id: u64) -> usize {
        let before = self.predicates.len();
        self.predicates.retain(|p| {
            if p.owner.id() == owner_id {
                p.owner.detach();
                false
            } else {
                true
            }
        });
        before - self.predicates.len()
    }

    /// Drops predicates whose channel is closed. Returns how many.
    pub fn prune_closed(&mut self) -> usize {
        let before = self.predicates.len();
        self.predicates.retain(|p| {
            if p.owner.is_closed() {
                p.owner.detach();
                false
            } else {
                true
            }
        });
        before - self.predicates.len()
    }

    // == Publish ==
    /// Delivers one event to every matching predicate, in list order.
    ///
    /// Predicates whose channel rejects the event are dropped on the spot.
    pub fn publish(
        &mut self,
        partition: &CacheKey,
        key: &CacheKey,
        value: Option<&Bytes>,
        event_type: EventType,
    ) {
        if self.predicates.is_empty() {
            return;
        }
        self.predicates.retain(|p| {
            if !p.matches(key, event_type) {
                return true;
            }
            let delivered = p.owner.publish(ChangeEvent {
                watch_id: p.watch_id,
                partition: partition.clone(),
                key: key.clone(),
                value: value.cloned(),
                event_type,
            });
            if !delivered {
                p.owner.detach();
                trace!(
                    watcher_id = p.owner.id(),
                    watch_id = p.watch_id,
                    "Dropped predicate of closed watcher"
                );
            }
            delivered
        });
    }
}
