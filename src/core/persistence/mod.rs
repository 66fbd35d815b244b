// src/core/persistence/mod.rs

//! Persistence: RDB snapshot files, the live append-only file, and the
//! background rewrite pipeline that compacts it.

pub mod aof_batch;
pub mod aof_loader;
pub mod aof_rewriter;
pub mod coordinator;
pub mod rdb;
pub mod rdb_saver;

use crate::core::JasperDBError;
use crate::core::state::ServerState;
use crate::core::storage::db::Db;
use crate::core::storage::dict::SnapshotToken;
use std::sync::Arc;

/// Starts a snapshot on every non-empty database, on the caller. If any
/// start fails, the ones already taken are released before returning.
pub(crate) async fn take_snapshots(
    state: &Arc<ServerState>,
) -> Result<Vec<(Arc<Db>, SnapshotToken)>, JasperDBError> {
    let mut snapshots = Vec::new();
    for db in &state.dbs {
        match db.start_snapshot_if_nonempty().await {
            Ok(Some(token)) => snapshots.push((db.clone(), token)),
            Ok(None) => {}
            Err(e) => {
                for (taken, _) in &snapshots {
                    taken.finish_snapshot_quietly().await;
                }
                return Err(e);
            }
        }
    }
    Ok(snapshots)
}
