// src/core/storage/dict/core.rs

use super::entry::{self, Entry, ForwardNode, ForwardOp, ValueCell};
use super::table::InnerTable;
use std::collections::HashSet;
use std::hash::{DefaultHasher, Hash, Hasher};

/// Tables start at this size and never shrink below it.
pub const INITIAL_TABLE_SIZE: usize = 4;

/// Source buckets visited per incremental rehash step.
const REHASH_STEP_BUCKETS: usize = 100;
/// Consecutive empty source buckets that end a step early, bounding the
/// tail latency of a step on sparse tables.
const REHASH_STEP_MAX_EMPTY: usize = 10;

/// The keyspace dictionary: a chained hash table that grows and shrinks by
/// migrating buckets incrementally and that supports one point-in-time
/// snapshot at a time while writes continue.
///
/// The dictionary expects a single writer. Background snapshot consumers
/// iterate through shared references, interleaved with the writer by
/// whatever lock wraps the dictionary.
pub struct Dict<K, V> {
    pub(super) ht0: InnerTable<K, V>,
    /// The rehash target table, present only while a rehash is in progress.
    pub(super) ht1: Option<InnerTable<K, V>>,
    /// `-1` when no rehash is in progress; otherwise the next source bucket
    /// of `ht0` to migrate. Buckets below it are already in `ht1`.
    pub(super) rehash_index: i64,
    pub(super) snapshotting: bool,
    /// Bumped on every snapshot transition so stale cursors can be detected.
    pub(super) snapshot_epoch: u64,
    /// Keys whose value has diverged between the snapshot view and the live
    /// view; resolved by `finish_snapshot`.
    pub(super) modified_keys: HashSet<K>,
    /// Entries whose live side is a tombstone. Kept as a counter so `len`
    /// stays constant-time while a snapshot pins removed entries in place.
    pub(super) tombstones: usize,
}

/// Integer mix applied over the raw key hash to defeat trivial clustering.
/// The final mask keeps the result non-negative, so `hash & mask` is always
/// a valid bucket index.
fn mix(seed: u32) -> u32 {
    let mut h = seed;
    h ^= h >> 16;
    h = (h ^ 61).wrapping_add(h.wrapping_shl(3));
    h ^= h >> 4;
    h = h.wrapping_mul(0x27d4_eb2d);
    h ^= h >> 15;
    h & 0x7fff_ffff
}

impl<K, V> Dict<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    pub fn new() -> Self {
        Self {
            ht0: InnerTable::with_size(INITIAL_TABLE_SIZE),
            ht1: None,
            rehash_index: -1,
            snapshotting: false,
            snapshot_epoch: 0,
            modified_keys: HashSet::new(),
            tombstones: 0,
        }
    }

    pub(super) fn hash_key(key: &K) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        mix(hasher.finish() as u32)
    }

    /// Number of keys visible to the live view.
    pub fn len(&self) -> usize {
        self.ht0.used + self.ht1.as_ref().map_or(0, |t| t.used) - self.tombstones
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the primary bucket array.
    pub fn primary_size(&self) -> usize {
        self.ht0.size()
    }

    pub fn rehash_in_progress(&self) -> bool {
        self.rehash_index >= 0
    }

    pub fn is_snapshotting(&self) -> bool {
        self.snapshotting
    }

    /// Inserts or updates a key, returning the previous live value if any.
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        self.rehash_step();
        // Grow check uses the post-insert count; an update that does not add
        // an entry may start the rehash one write early, which is harmless.
        if self.rehash_index < 0 && self.ht0.used + 1 >= self.ht0.size() {
            let target = self.ht0.size() * 2;
            self.start_rehash(target);
        }
        let hash = Self::hash_key(&key);
        match self.try_update(hash, &key, value) {
            Ok(previous) => previous,
            Err(value) => {
                self.insert_new(hash, key, value);
                None
            }
        }
    }

    /// Current live value for a key.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.rehash_step();
        let hash = Self::hash_key(key);
        self.find_entry(hash, key).and_then(|e| e.cell.live())
    }

    /// Live value lookup without advancing the rehash cursor. Safe for
    /// shared-reference readers.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let hash = Self::hash_key(key);
        self.find_entry(hash, key).and_then(|e| e.cell.live())
    }

    /// Mutable access to the live value, for in-place container edits.
    /// Under an active snapshot the key is diverged first, exactly as an
    /// update through `put` would.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.rehash_step();
        let hash = Self::hash_key(key);
        if !self.snapshotting {
            return self.find_entry_mut(hash, key).and_then(|e| e.cell.live_mut());
        }
        match self.find_entry(hash, key) {
            Some(found) if found.cell.live().is_some() => {}
            _ => return None,
        }
        self.modified_keys.insert(key.clone());
        let entry = self
            .find_entry_mut(hash, key)
            .expect("entry disappeared between lookups");
        if let ValueCell::Live(_) = entry.cell {
            let old_cell = std::mem::replace(
                &mut entry.cell,
                ValueCell::Forward(ForwardNode {
                    snapshot: None,
                    live: None,
                    op: ForwardOp::Update,
                }),
            );
            let ValueCell::Live(old) = old_cell else {
                unreachable!()
            };
            if let ValueCell::Forward(f) = &mut entry.cell {
                f.snapshot = Some(old.clone());
                f.live = Some(old);
            }
        }
        entry.cell.live_mut()
    }

    /// Removes a key, returning its live value if it was present.
    ///
    /// Under an active snapshot the entry is not unlinked: its live side
    /// becomes a tombstone while the snapshot side keeps the old value, and
    /// the entry is reclaimed by `finish_snapshot`.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.rehash_step();
        let hash = Self::hash_key(key);

        if self.snapshotting {
            let mut removed = None;
            let mut newly_tombstoned = false;
            if let Some(entry) = self.find_entry_mut(hash, key) {
                match &mut entry.cell {
                    ValueCell::Live(_) => {
                        let old_cell = std::mem::replace(
                            &mut entry.cell,
                            ValueCell::Forward(ForwardNode {
                                snapshot: None,
                                live: None,
                                op: ForwardOp::Remove,
                            }),
                        );
                        let ValueCell::Live(old) = old_cell else {
                            unreachable!()
                        };
                        if let ValueCell::Forward(f) = &mut entry.cell {
                            f.snapshot = Some(old.clone());
                        }
                        removed = Some(old);
                        newly_tombstoned = true;
                    }
                    ValueCell::Forward(f) => {
                        if let Some(live) = f.live.take() {
                            // A key inserted during the snapshot stays an
                            // Insert so the iterator keeps skipping it.
                            if f.op != ForwardOp::Insert {
                                f.op = ForwardOp::Remove;
                            }
                            removed = Some(live);
                            newly_tombstoned = true;
                        }
                    }
                }
            }
            if newly_tombstoned {
                self.tombstones += 1;
                self.modified_keys.insert(key.clone());
            }
            return removed;
        }

        let node = self.unlink_entry(hash, key)?;
        let ValueCell::Live(value) = node.cell else {
            unreachable!("forward nodes cannot outlive a snapshot")
        };
        self.maybe_shrink();
        Some(value)
    }

    pub fn contains_key(&mut self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn contains_value(&mut self, key: &K, value: &V) -> bool {
        self.get(key) == Some(value)
    }

    /// All live keys, in bucket order.
    pub fn keys(&mut self) -> Vec<K> {
        self.rehash_step();
        let mut out = Vec::with_capacity(self.len());
        self.for_each_live(|k, _| out.push(k.clone()));
        out
    }

    /// All live key-value pairs, in bucket order.
    pub fn entries(&mut self) -> Vec<(K, V)> {
        self.rehash_step();
        let mut out = Vec::with_capacity(self.len());
        self.for_each_live(|k, v| out.push((k.clone(), v.clone())));
        out
    }

    /// Resets the dictionary to a fresh primary table. Any in-flight
    /// snapshot is dropped and its cursors invalidated.
    pub fn clear(&mut self) {
        self.ht0 = InnerTable::with_size(INITIAL_TABLE_SIZE);
        self.ht1 = None;
        self.rehash_index = -1;
        self.snapshotting = false;
        self.snapshot_epoch += 1;
        self.modified_keys.clear();
        self.tombstones = 0;
    }

    pub(super) fn find_entry(&self, hash: u32, key: &K) -> Option<&Entry<K, V>> {
        let index = self.ht0.bucket_index(hash);
        if let Some(found) = entry::find(self.ht0.bucket(index), hash, key) {
            return Some(found);
        }
        if self.rehash_index >= 0 {
            if let Some(ht1) = self.ht1.as_ref() {
                let index = ht1.bucket_index(hash);
                return entry::find(ht1.bucket(index), hash, key);
            }
        }
        None
    }

    // The immutable probe first keeps the mutable borrow confined to the
    // table that actually holds the entry.
    pub(super) fn find_entry_mut(&mut self, hash: u32, key: &K) -> Option<&mut Entry<K, V>> {
        let index = self.ht0.bucket_index(hash);
        if entry::find(self.ht0.bucket(index), hash, key).is_some() {
            return entry::find_mut(self.ht0.bucket_mut(index), hash, key);
        }
        if self.rehash_index >= 0 {
            if let Some(ht1) = self.ht1.as_mut() {
                let index = ht1.bucket_index(hash);
                return entry::find_mut(ht1.bucket_mut(index), hash, key);
            }
        }
        None
    }

    fn try_update(&mut self, hash: u32, key: &K, value: V) -> Result<Option<V>, V> {
        if self.find_entry(hash, key).is_none() {
            return Err(value);
        }
        let snapshotting = self.snapshotting;
        let mut previous = None;
        let mut cleared_tombstone = false;
        let entry = self
            .find_entry_mut(hash, key)
            .expect("entry disappeared between lookups");
        if snapshotting {
            match &mut entry.cell {
                ValueCell::Live(_) => {
                    let old_cell = std::mem::replace(
                        &mut entry.cell,
                        ValueCell::Forward(ForwardNode {
                            snapshot: None,
                            live: None,
                            op: ForwardOp::Update,
                        }),
                    );
                    let ValueCell::Live(old) = old_cell else {
                        unreachable!()
                    };
                    previous = Some(old.clone());
                    if let ValueCell::Forward(f) = &mut entry.cell {
                        f.snapshot = Some(old);
                        f.live = Some(value);
                    }
                }
                ValueCell::Forward(f) => {
                    previous = f.live.replace(value);
                    if previous.is_none() {
                        cleared_tombstone = true;
                        if f.op == ForwardOp::Remove {
                            f.op = ForwardOp::Update;
                        }
                    }
                }
            }
        } else {
            match &mut entry.cell {
                ValueCell::Live(v) => previous = Some(std::mem::replace(v, value)),
                ValueCell::Forward(_) => {
                    unreachable!("forward nodes cannot outlive a snapshot")
                }
            }
        }
        if cleared_tombstone {
            self.tombstones -= 1;
        }
        if snapshotting {
            self.modified_keys.insert(key.clone());
        }
        Ok(previous)
    }

    /// New entries are prepended to the head of the destination bucket:
    /// the rehash target if a rehash is in progress, the primary otherwise.
    fn insert_new(&mut self, hash: u32, key: K, value: V) {
        let snapshotting = self.snapshotting;
        if snapshotting {
            self.modified_keys.insert(key.clone());
        }
        let cell = if snapshotting {
            // The key did not exist at snapshot time, so the snapshot side
            // starts as a tombstone and the iterator skips the entry.
            ValueCell::Forward(ForwardNode {
                snapshot: None,
                live: Some(value),
                op: ForwardOp::Insert,
            })
        } else {
            ValueCell::Live(value)
        };
        let table = if self.rehash_index >= 0 {
            self.ht1.as_mut().expect("rehash target missing")
        } else {
            &mut self.ht0
        };
        let index = table.bucket_index(hash);
        let next = table.bucket_mut(index).take();
        *table.bucket_mut(index) = Some(Box::new(Entry {
            hash,
            key,
            cell,
            next,
        }));
        table.used += 1;
    }

    pub(super) fn unlink_entry(&mut self, hash: u32, key: &K) -> Option<Box<Entry<K, V>>> {
        let index = self.ht0.bucket_index(hash);
        if let Some(node) = entry::unlink(self.ht0.bucket_mut(index), hash, key) {
            self.ht0.used -= 1;
            return Some(node);
        }
        if self.rehash_index >= 0 {
            if let Some(ht1) = self.ht1.as_mut() {
                let index = ht1.bucket_index(hash);
                if let Some(node) = entry::unlink(ht1.bucket_mut(index), hash, key) {
                    ht1.used -= 1;
                    return Some(node);
                }
            }
        }
        None
    }

    fn start_rehash(&mut self, target: usize) {
        if self.ht1.is_some() || target == self.ht0.size() {
            return;
        }
        self.ht1 = Some(InnerTable::with_size(target));
        self.rehash_index = 0;
    }

    /// Performs one bounded increment of bucket migration, inline on the
    /// writer. Migration is suspended while a snapshot is active so snapshot
    /// readers see a stable bucket layout; it resumes at `finish_snapshot`.
    pub(super) fn rehash_step(&mut self) {
        if self.rehash_index < 0 || self.snapshotting {
            return;
        }
        let Some(ht1) = self.ht1.as_mut() else {
            return;
        };
        let mut visited = 0;
        let mut empty_streak = 0;
        while visited < REHASH_STEP_BUCKETS && (self.rehash_index as usize) < self.ht0.size() {
            let index = self.rehash_index as usize;
            self.rehash_index += 1;
            visited += 1;
            let bucket = self.ht0.bucket_mut(index);
            if bucket.is_none() {
                empty_streak += 1;
                if empty_streak >= REHASH_STEP_MAX_EMPTY {
                    break;
                }
                continue;
            }
            empty_streak = 0;
            let mut head = bucket.take();
            while let Some(mut node) = head {
                head = node.next.take();
                let target = ht1.bucket_index(node.hash);
                let slot = ht1.bucket_mut(target);
                node.next = slot.take();
                *slot = Some(node);
                self.ht0.used -= 1;
                ht1.used += 1;
            }
        }
        if self.rehash_index as usize >= self.ht0.size() && self.ht0.used == 0 {
            self.ht0 = self.ht1.take().expect("rehash target missing");
            self.rehash_index = -1;
        }
    }

    /// A delete may leave the primary table sparse enough to shrink. The
    /// check is deferred while a snapshot is active and re-run once it
    /// finishes.
    pub(super) fn maybe_shrink(&mut self) {
        if self.rehash_index >= 0 || self.snapshotting {
            return;
        }
        let size = self.ht0.size();
        if size > INITIAL_TABLE_SIZE && self.ht0.used * 10 < size {
            let halved = std::cmp::max(INITIAL_TABLE_SIZE, size / 2);
            let target = std::cmp::max(INITIAL_TABLE_SIZE, halved.next_power_of_two());
            self.start_rehash(target);
        }
    }

    /// Visits every live pair in bucket order without copying.
    pub fn for_each_live(&self, mut f: impl FnMut(&K, &V)) {
        let tables = [Some(&self.ht0), self.ht1.as_ref()];
        for table in tables.into_iter().flatten() {
            for index in 0..table.size() {
                let mut link = table.bucket(index);
                while let Some(entry) = link {
                    if let Some(value) = entry.cell.live() {
                        f(&entry.key, value);
                    }
                    link = &entry.next;
                }
            }
        }
    }
}

impl<K, V> Default for Dict<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_hash_is_always_non_negative() {
        for seed in [0u32, 1, 61, 0xdead_beef, u32::MAX] {
            assert_eq!(mix(seed) & 0x8000_0000, 0);
        }
    }

    #[test]
    fn mix_spreads_sequential_seeds() {
        // Sequential raw hashes must not land in the same low bits.
        let buckets: std::collections::HashSet<u32> =
            (0..64u32).map(|seed| mix(seed) & 63).collect();
        assert!(buckets.len() > 32, "mix left sequential seeds clustered");
    }

    #[test]
    fn unlink_keeps_survivors_in_chain_order() {
        let mut bucket: entry::Link<u32, u32> = None;
        for key in [1u32, 2, 3] {
            bucket = Some(Box::new(Entry {
                hash: key,
                key,
                cell: ValueCell::Live(key * 10),
                next: bucket,
            }));
        }
        // Chain is most-recent-first: 3, 2, 1.
        let removed = entry::unlink(&mut bucket, 2, &2).expect("entry present");
        assert_eq!(removed.key, 2);

        let mut order = Vec::new();
        let mut link = &bucket;
        while let Some(node) = link {
            order.push(node.key);
            link = &node.next;
        }
        assert_eq!(order, vec![3, 1]);
        assert!(entry::unlink(&mut bucket, 2, &2).is_none());
    }
}
