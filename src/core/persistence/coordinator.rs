// src/core/persistence/coordinator.rs

//! Process-wide mutual exclusion between snapshot consumers. At most one
//! of the RDB background save and the AOF rewrite may hold a Dict snapshot
//! at a time; the loser of a race skips or reschedules, never waits.

use std::sync::atomic::{AtomicU8, Ordering};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Rdb,
    Aof,
}

const SLOT_FREE: u8 = 0;
const SLOT_RDB: u8 = 1;
const SLOT_AOF: u8 = 2;

fn slot_value(kind: SnapshotKind) -> u8 {
    match kind {
        SnapshotKind::Rdb => SLOT_RDB,
        SnapshotKind::Aof => SLOT_AOF,
    }
}

#[derive(Debug, Default)]
pub struct SnapshotCoordinator {
    slot: AtomicU8,
}

impl SnapshotCoordinator {
    pub fn new() -> Self {
        Self {
            slot: AtomicU8::new(SLOT_FREE),
        }
    }

    /// Attempts to claim the snapshot slot. Never blocks.
    pub fn try_acquire(&self, kind: SnapshotKind) -> bool {
        self.slot
            .compare_exchange(SLOT_FREE, slot_value(kind), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Releases the slot. A mismatched release is a bug in the caller and
    /// is logged rather than honored.
    pub fn release(&self, kind: SnapshotKind) {
        if self
            .slot
            .compare_exchange(slot_value(kind), SLOT_FREE, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("released snapshot slot {kind:?} without holding it");
        }
    }

    /// The consumer currently holding the slot, if any.
    pub fn current_kind(&self) -> Option<SnapshotKind> {
        match self.slot.load(Ordering::SeqCst) {
            SLOT_RDB => Some(SnapshotKind::Rdb),
            SLOT_AOF => Some(SnapshotKind::Aof),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_mutually_exclusive() {
        let coordinator = SnapshotCoordinator::new();
        assert!(coordinator.try_acquire(SnapshotKind::Rdb));
        assert!(!coordinator.try_acquire(SnapshotKind::Aof));
        assert!(!coordinator.try_acquire(SnapshotKind::Rdb));
        assert_eq!(coordinator.current_kind(), Some(SnapshotKind::Rdb));

        coordinator.release(SnapshotKind::Rdb);
        assert_eq!(coordinator.current_kind(), None);
        assert!(coordinator.try_acquire(SnapshotKind::Aof));
    }
}
