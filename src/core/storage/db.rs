// src/core/storage/db.rs

//! A single logical database: the keyspace dictionary behind a mutex.
//!
//! The command loop is the only writer; persistence workers take the same
//! lock in short, bounded critical sections (snapshot chunks), so the
//! writer keeps running while a background save or rewrite iterates.

use crate::core::JasperDBError;
use crate::core::storage::data_types::DataValue;
use crate::core::storage::dict::{Dict, SnapshotToken};
use bytes::Bytes;
use tokio::sync::Mutex;

pub struct Db {
    index: usize,
    pub dict: Mutex<Dict<Bytes, DataValue>>,
}

impl Db {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            dict: Mutex::new(Dict::new()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub async fn key_count(&self) -> usize {
        self.dict.lock().await.len()
    }

    /// Inserts a value during a data loading process (RDB/AOF).
    pub async fn insert_value_from_load(&self, key: Bytes, value: DataValue) {
        self.dict.lock().await.put(key, value);
    }

    pub async fn get_value(&self, key: &Bytes) -> Option<DataValue> {
        self.dict.lock().await.get(key).cloned()
    }

    pub async fn clear(&self) {
        self.dict.lock().await.clear();
    }

    /// Approximate memory held by live keys and values. Computed by a
    /// full scan, so callers should treat it as a diagnostic.
    pub async fn memory_usage(&self) -> usize {
        let dict = self.dict.lock().await;
        let mut total = 0;
        dict.for_each_live(|key, value| total += key.len() + value.memory_usage());
        total
    }

    /// Starts a snapshot if the database holds any keys, returning the
    /// token a background consumer iterates with.
    pub async fn start_snapshot_if_nonempty(&self) -> Result<Option<SnapshotToken>, JasperDBError> {
        let mut dict = self.dict.lock().await;
        if dict.is_empty() {
            return Ok(None);
        }
        dict.start_snapshot().map(Some)
    }

    /// Releases a snapshot, folding all diverged keys back into plain
    /// entries. Logs instead of failing when the snapshot is already gone,
    /// so error paths can call this unconditionally.
    pub async fn finish_snapshot_quietly(&self) {
        let mut dict = self.dict.lock().await;
        if let Err(e) = dict.finish_snapshot() {
            tracing::debug!("finish_snapshot on db {}: {}", self.index, e);
        }
    }
}
