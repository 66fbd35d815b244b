// src/core/storage/dict/snapshot.rs

//! The snapshot handshake and the point-in-time iterator.
//!
//! `start_snapshot` flips the dictionary into snapshot mode; from then on
//! every write diverges the touched key into a forward node instead of
//! destroying the old value. Iteration yields, for every key live at the
//! moment of `start_snapshot`, the value it had at that moment, and nothing
//! else. `finish_snapshot` collapses all forward nodes back into plain
//! entries.

use super::core::Dict;
use super::entry::ValueCell;
use crate::core::JasperDBError;
use std::collections::VecDeque;
use std::hash::Hash;

/// Proof that a snapshot was started. Cursors carry the epoch so that a
/// consumer outliving `finish_snapshot` (or a `clear`) gets a state error
/// instead of silently reading the wrong view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotToken {
    pub(super) epoch: u64,
}

/// A resumable position inside a snapshot scan: which inner table and which
/// bucket to read next. Obtained from `snapshot_chunk`, letting a consumer
/// release the dictionary lock between chunks while the writer keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotCursor {
    table: usize,
    bucket: usize,
}

impl SnapshotCursor {
    pub fn start() -> Self {
        Self { table: 0, bucket: 0 }
    }
}

impl Default for SnapshotCursor {
    fn default() -> Self {
        Self::start()
    }
}

impl<K, V> Dict<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    /// Enters snapshot mode. Fails if a snapshot is already active.
    pub fn start_snapshot(&mut self) -> Result<SnapshotToken, JasperDBError> {
        if self.snapshotting {
            return Err(JasperDBError::InvalidState(
                "a snapshot is already active".into(),
            ));
        }
        self.snapshotting = true;
        self.snapshot_epoch += 1;
        Ok(SnapshotToken {
            epoch: self.snapshot_epoch,
        })
    }

    /// Leaves snapshot mode, resolving every diverged key: tombstoned
    /// entries are unlinked, everything else collapses to its live value.
    /// Afterwards the dictionary is observationally identical to one that
    /// never snapshotted but saw the same writes.
    pub fn finish_snapshot(&mut self) -> Result<(), JasperDBError> {
        if !self.snapshotting {
            return Err(JasperDBError::InvalidState(
                "no snapshot in progress".into(),
            ));
        }
        let keys: Vec<K> = self.modified_keys.drain().collect();
        for key in keys {
            let hash = Self::hash_key(&key);
            self.resolve_forward(hash, &key);
        }
        self.tombstones = 0;
        self.snapshotting = false;
        self.snapshot_epoch += 1;
        // Deletes during the snapshot deferred their shrink check.
        self.maybe_shrink();
        Ok(())
    }

    fn resolve_forward(&mut self, hash: u32, key: &K) {
        let mut unlink = false;
        if let Some(entry) = self.find_entry_mut(hash, key) {
            if let ValueCell::Forward(f) = &mut entry.cell {
                match f.live.take() {
                    Some(value) => entry.cell = ValueCell::Live(value),
                    None => unlink = true,
                }
            }
        }
        if unlink {
            self.unlink_entry(hash, key);
        }
    }

    /// A lazy iterator over the snapshot view. Borrows the dictionary, so
    /// the writer is excluded for the iterator's lifetime; background
    /// consumers that interleave with the writer use `snapshot_chunk`
    /// instead. Restartable: each call scans from the first bucket.
    pub fn iter_snapshot(
        &self,
        token: SnapshotToken,
    ) -> Result<SnapshotIter<'_, K, V>, JasperDBError> {
        self.check_snapshot_token(token)?;
        Ok(SnapshotIter {
            dict: self,
            cursor: Some(SnapshotCursor::start()),
            pending: VecDeque::new(),
        })
    }

    /// Copies out the next run of snapshot pairs, at least `max_entries`
    /// unless the scan ends first. Returns the pairs and the cursor to
    /// resume from, or `None` when the scan is complete.
    ///
    /// The caller is expected to drop the dictionary lock between chunks;
    /// consistency is unaffected because writes never move entries between
    /// buckets while a snapshot is active and never touch snapshot-side
    /// values.
    pub fn snapshot_chunk(
        &self,
        token: SnapshotToken,
        cursor: SnapshotCursor,
        max_entries: usize,
    ) -> Result<(Vec<(K, V)>, Option<SnapshotCursor>), JasperDBError> {
        self.check_snapshot_token(token)?;
        Ok(self.snapshot_scan(cursor, max_entries))
    }

    fn check_snapshot_token(&self, token: SnapshotToken) -> Result<(), JasperDBError> {
        if !self.snapshotting || token.epoch != self.snapshot_epoch {
            return Err(JasperDBError::InvalidState(
                "snapshot is no longer active".into(),
            ));
        }
        Ok(())
    }

    /// Walks buckets from `cursor`, collecting the snapshot-side pairs.
    /// Buckets are consumed whole so a resumed scan never sees half a chain.
    pub(super) fn snapshot_scan(
        &self,
        mut cursor: SnapshotCursor,
        max_entries: usize,
    ) -> (Vec<(K, V)>, Option<SnapshotCursor>) {
        let mut out = Vec::new();
        loop {
            let table = match cursor.table {
                0 => Some(&self.ht0),
                1 => self.ht1.as_ref(),
                _ => None,
            };
            let Some(table) = table else {
                return (out, None);
            };
            if cursor.bucket >= table.size() {
                cursor = SnapshotCursor {
                    table: cursor.table + 1,
                    bucket: 0,
                };
                continue;
            }
            let mut link = table.bucket(cursor.bucket);
            while let Some(entry) = link {
                // Entries inserted after `start_snapshot` carry a snapshot
                // tombstone and are skipped.
                if let Some(value) = entry.cell.snapshot_view() {
                    out.push((entry.key.clone(), value.clone()));
                }
                link = &entry.next;
            }
            cursor.bucket += 1;
            if out.len() >= max_entries {
                return (out, Some(cursor));
            }
        }
    }

    /// Number of keys whose snapshot and live views currently diverge.
    pub fn diverged_key_count(&self) -> usize {
        self.modified_keys.len()
    }
}

/// A finite, lazy sequence of `(key, snapshot value)` pairs over a live
/// snapshot. See `Dict::iter_snapshot`.
pub struct SnapshotIter<'a, K, V> {
    dict: &'a Dict<K, V>,
    cursor: Option<SnapshotCursor>,
    pending: VecDeque<(K, V)>,
}

impl<K, V> Iterator for SnapshotIter<'_, K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            let cursor = self.cursor?;
            let (items, next) = self.dict.snapshot_scan(cursor, 64);
            self.pending.extend(items);
            self.cursor = next;
            if self.pending.is_empty() && self.cursor.is_none() {
                return None;
            }
        }
    }
}
