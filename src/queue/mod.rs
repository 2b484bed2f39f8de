//! Persistent queue of records awaiting delivery.
//!
//! Records are journaled to a single append-only file. Memory holds only an
//! index from id to journal offset. Replaying the journal on open restores the queue, including
//! records a crashed flush had leased.

mod journal;
mod store;

pub use journal::{Journal, JournalEntry, Replay, Rewrite};
pub use store::{lock_path, QueueStore};
