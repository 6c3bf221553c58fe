//! Watch Module
//!
//! Change notification for cache invalidation. A subscriber opens a
//! [`WatcherChannel`], attaches predicates to partitions, and drains
//! [`ChangeEvent`]s from its receiver.
//!
//! ```text
//! Write path (under the partition write lock):
//!   mutation -> WatchList::publish -> predicate.matches -> channel.publish
//!                                                              |
//!                                     send fails (receiver gone) -> predicate dropped
//! Subscriber:
//!   WatchReceiver::recv / try_recv
//! ```

mod channel;
mod predicate;

pub use channel::{ChangeEvent, EventFilter, EventType, WatchReceiver, WatcherChannel};
pub use predicate::{WatchList, WatchPredicate};
