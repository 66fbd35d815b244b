// src/core/persistence/rdb_saver.rs

//! Drives RDB saves: the synchronous mode that blocks the caller, and the
//! background mode that snapshots on the caller and serializes on a worker
//! task while the command loop keeps running.

use crate::core::JasperDBError;
use crate::core::persistence::coordinator::SnapshotKind;
use crate::core::persistence::rdb;
use crate::core::state::ServerState;
use crate::core::storage::data_types::DataValue;
use crate::core::storage::db::Db;
use crate::core::storage::dict::{SnapshotCursor, SnapshotToken};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::fs;
use tracing::{debug, error, info};

/// Snapshot entries copied out per dictionary lock acquisition.
const SNAPSHOT_CHUNK_ENTRIES: usize = 128;

type DbSection = (usize, Vec<(Bytes, DataValue)>);

pub struct RdbSaver {
    state: Arc<ServerState>,
}

impl RdbSaver {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    /// Synchronous save: snapshots and serializes each database inline,
    /// blocking the caller until the file is renamed into place.
    pub async fn save(&self) -> Result<(), JasperDBError> {
        let coordinator = &self.state.persistence.coordinator;
        if !coordinator.try_acquire(SnapshotKind::Rdb) {
            return Err(JasperDBError::InvalidState(
                "another snapshot consumer is active".into(),
            ));
        }
        let dirty_at_start = self
            .state
            .persistence
            .dirty_keys_counter
            .load(Ordering::Relaxed);
        let result = self.save_inline().await;
        self.record_outcome(&result, dirty_at_start);
        coordinator.release(SnapshotKind::Rdb);
        result
    }

    async fn save_inline(&self) -> Result<(), JasperDBError> {
        let path = self.state.config.lock().await.persistence.rdb_file_name.clone();
        let sections = self.collect_sections().await?;
        let bytes = rdb::encode_databases(&sections);
        write_atomically(&path, &bytes).await?;
        info!("RDB file successfully saved to {path}");
        Ok(())
    }

    /// Background save. Snapshots every non-empty database on the caller,
    /// then spawns a worker that iterates the snapshots in chunks, writes
    /// the file, and releases the snapshots whether or not it succeeded.
    /// Returns false when another snapshot consumer holds the slot.
    pub async fn bg_save(&self) -> Result<bool, JasperDBError> {
        let coordinator = &self.state.persistence.coordinator;
        if !coordinator.try_acquire(SnapshotKind::Rdb) {
            debug!("snapshot slot busy; skipping background save");
            return Ok(false);
        }
        let snapshots = match super::take_snapshots(&self.state).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                coordinator.release(SnapshotKind::Rdb);
                return Err(e);
            }
        };

        let state = self.state.clone();
        tokio::spawn(async move {
            let dirty_at_start = state.persistence.dirty_keys_counter.load(Ordering::Relaxed);
            let path = state.config.lock().await.persistence.rdb_file_name.clone();
            let result = write_snapshots_to_file(&snapshots, &path).await;
            for (db, _) in &snapshots {
                db.finish_snapshot_quietly().await;
            }
            match &result {
                Ok(()) => {
                    info!("background RDB save completed to {path}");
                    state
                        .persistence
                        .dirty_keys_counter
                        .fetch_sub(dirty_at_start, Ordering::Relaxed);
                    *state.persistence.last_save_success_time.lock() = Some(Instant::now());
                }
                Err(e) => {
                    error!("background RDB save failed: {e}");
                    *state.persistence.last_save_failure_time.lock() = Some(Instant::now());
                }
            }
            state.persistence.coordinator.release(SnapshotKind::Rdb);
        });
        Ok(true)
    }

    /// Produces a complete RDB image in memory, the payload a replica
    /// receives on full resynchronization before it follows the live
    /// command stream. Holds the RDB coordinator slot for the duration.
    pub async fn full_sync_image(&self) -> Result<Bytes, JasperDBError> {
        let coordinator = &self.state.persistence.coordinator;
        if !coordinator.try_acquire(SnapshotKind::Rdb) {
            return Err(JasperDBError::InvalidState(
                "another snapshot consumer is active".into(),
            ));
        }
        let result = self.collect_sections().await;
        coordinator.release(SnapshotKind::Rdb);
        result.map(|sections| rdb::encode_databases(&sections))
    }

    /// Snapshots and copies out each non-empty database in turn. The
    /// snapshot handle keeps iteration consistent even though nothing else
    /// can write while the per-database lock is held.
    async fn collect_sections(&self) -> Result<Vec<DbSection>, JasperDBError> {
        let mut sections = Vec::new();
        for db in &self.state.dbs {
            let mut dict = db.dict.lock().await;
            if dict.is_empty() {
                continue;
            }
            let token = dict.start_snapshot()?;
            let pairs: Vec<_> = dict.iter_snapshot(token)?.collect();
            dict.finish_snapshot()?;
            sections.push((db.index(), pairs));
        }
        Ok(sections)
    }

    fn record_outcome(&self, result: &Result<(), JasperDBError>, dirty_at_start: u64) {
        match result {
            Ok(()) => {
                self.state
                    .persistence
                    .dirty_keys_counter
                    .fetch_sub(dirty_at_start, Ordering::Relaxed);
                *self.state.persistence.last_save_success_time.lock() = Some(Instant::now());
            }
            Err(_) => {
                *self.state.persistence.last_save_failure_time.lock() = Some(Instant::now());
            }
        }
    }
}

/// Serializes held snapshots into an RDB image, taking each dictionary
/// lock only for one chunk at a time.
async fn write_snapshots_to_file(
    snapshots: &[(Arc<Db>, SnapshotToken)],
    path: &str,
) -> Result<(), JasperDBError> {
    let mut buf = BytesMut::new();
    rdb::encode_header(&mut buf);
    for (db, token) in snapshots {
        rdb::encode_select(&mut buf, db.index());
        let mut cursor = SnapshotCursor::start();
        loop {
            let (pairs, next) = {
                let dict = db.dict.lock().await;
                dict.snapshot_chunk(*token, cursor, SNAPSHOT_CHUNK_ENTRIES)?
            };
            for (key, value) in &pairs {
                rdb::encode_record(&mut buf, key, value);
            }
            match next {
                Some(resumed) => cursor = resumed,
                None => break,
            }
        }
    }
    let bytes = rdb::finalize(buf);
    write_atomically(path, &bytes).await
}

/// Writes to a uniquely named temporary and renames it over the target, so
/// a failed save never clobbers the previous file.
async fn write_atomically(path: &str, bytes: &[u8]) -> Result<(), JasperDBError> {
    let temp_path = format!("{}.tmp.{}", path, rand::random::<u32>());
    if let Err(e) = fs::write(&temp_path, bytes).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    Ok(())
}
