//! Background Tasks Module
//!
//! Scheduler glue that runs the engine's maintenance jobs on the tokio
//! runtime.
//!
//! # Tasks
//! - Expiration: periodic eager scan for expired entries
//! - Compaction: on-demand eviction after a partition budget shrinks

mod compaction;
mod expiration;

pub use compaction::spawn_compaction_task;
pub use expiration::spawn_expiration_task;
