// src/core/storage/dict/table.rs

//! A single inner bucket array. Its size is a power of two and immutable
//! for the table's lifetime; growth and shrinkage happen by migrating into
//! a fresh table.

use super::entry::Link;

#[derive(Debug)]
pub(super) struct InnerTable<K, V> {
    buckets: Vec<Link<K, V>>,
    mask: usize,
    /// Number of entries linked into this table, tombstoned or not.
    pub used: usize,
}

impl<K, V> InnerTable<K, V> {
    pub fn with_size(size: usize) -> Self {
        debug_assert!(size.is_power_of_two(), "table size must be a power of two");
        let mut buckets = Vec::with_capacity(size);
        buckets.resize_with(size, || None);
        Self {
            buckets,
            mask: size - 1,
            used: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    /// The bucket a hash lands in. The hash is already masked non-negative,
    /// so the index is always in range.
    pub fn bucket_index(&self, hash: u32) -> usize {
        hash as usize & self.mask
    }

    pub fn bucket(&self, index: usize) -> &Link<K, V> {
        &self.buckets[index]
    }

    pub fn bucket_mut(&mut self, index: usize) -> &mut Link<K, V> {
        &mut self.buckets[index]
    }
}
