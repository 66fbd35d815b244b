// src/core/storage/dict/mod.rs

//! An incrementally rehashed chained hash table with writer-concurrent
//! point-in-time snapshots.
//!
//! The table keeps two inner bucket arrays: the primary table and, while a
//! rehash is in progress, the rehash target. Migration work is bounded per
//! write so no single operation pays for the whole move. While a snapshot is
//! active, every mutated key keeps both its snapshot-time value and its live
//! value in a forward node, so a background reader can serialize the state
//! as of `start_snapshot` while writes continue.

mod core;
mod entry;
mod snapshot;
mod table;

pub use core::{Dict, INITIAL_TABLE_SIZE};
pub use entry::ForwardOp;
pub use snapshot::{SnapshotCursor, SnapshotIter, SnapshotToken};
