// src/core/state/persistence.rs

//! Contains state definitions related to data persistence (AOF/RDB).

use crate::core::persistence::aof_batch::AofBatchWriter;
use crate::core::persistence::aof_rewriter::{RewriteFeed, RewritePhase};
use crate::core::persistence::coordinator::SnapshotCoordinator;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Instant;

/// Holds all state and handles related to persistence.
pub struct PersistenceState {
    /// Mutual exclusion between snapshot consumers (RDB save, AOF rewrite).
    pub coordinator: SnapshotCoordinator,
    /// The rewrite-side queue the live AOF writer copies commands into
    /// while a rewrite runs.
    pub rewrite_feed: Arc<RewriteFeed>,
    /// The live AOF writer, present when AOF persistence is enabled.
    pub aof_writer: Option<Arc<AofBatchWriter>>,
    /// Where the current (or last) AOF rewrite is in its state machine.
    pub rewrite_phase: Arc<Mutex<RewritePhase>>,
    /// Keys dirtied since the last successful save; feeds the save rules.
    pub dirty_keys_counter: AtomicU64,
    /// The timestamp of the last successful RDB save.
    pub last_save_success_time: Mutex<Option<Instant>>,
    /// The timestamp of the last failed RDB save.
    pub last_save_failure_time: Mutex<Option<Instant>>,
    /// The size of the AOF at the end of the last successful rewrite.
    /// Used by the auto-rewrite manager to compute growth.
    pub aof_last_rewrite_size: AtomicU64,
}

impl PersistenceState {
    pub fn new(rewrite_feed: Arc<RewriteFeed>, aof_writer: Option<Arc<AofBatchWriter>>) -> Self {
        Self {
            coordinator: SnapshotCoordinator::new(),
            rewrite_feed,
            aof_writer,
            rewrite_phase: Arc::new(Mutex::new(RewritePhase::Idle)),
            dirty_keys_counter: AtomicU64::new(0),
            last_save_success_time: Mutex::new(None),
            last_save_failure_time: Mutex::new(None),
            aof_last_rewrite_size: AtomicU64::new(0),
        }
    }
}
