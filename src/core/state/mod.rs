// src/core/state/mod.rs

//! The shared engine state handed to the command loop and the persistence
//! workers.

pub mod persistence;

use crate::config::Config;
use crate::core::JasperDBError;
use crate::core::events::CommandBus;
use crate::core::persistence::aof_batch::AofBatchWriter;
use crate::core::persistence::aof_loader::AofLoader;
use crate::core::persistence::aof_rewriter::{AofRewriter, RewriteFeed};
use crate::core::persistence::rdb::RdbLoader;
use crate::core::persistence::rdb_saver::RdbSaver;
use crate::core::storage::db::Db;
use crate::core::tasks::persistence::{AofRewriteManager, RdbAutoSaver};
use bytes::Bytes;
use persistence::PersistenceState;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::info;

pub struct ServerState {
    pub dbs: Vec<Arc<Db>>,
    pub config: Mutex<Config>,
    pub persistence: PersistenceState,
    pub events: CommandBus,
}

impl ServerState {
    /// Builds the engine: the logical databases and, when AOF persistence
    /// is enabled, the live AOF writer.
    pub async fn initialize(config: Config) -> Result<Arc<Self>, JasperDBError> {
        config
            .validate()
            .map_err(|e| JasperDBError::InvalidState(e.to_string()))?;

        let dbs = (0..config.databases)
            .map(|index| Arc::new(Db::new(index)))
            .collect();

        let rewrite_feed = Arc::new(RewriteFeed::new());
        let aof_writer = if config.persistence.aof_enabled {
            Some(AofBatchWriter::open(&config.persistence, rewrite_feed.clone()).await?)
        } else {
            None
        };

        Ok(Arc::new(Self {
            dbs,
            config: Mutex::new(config),
            events: CommandBus::new(aof_writer.clone()),
            persistence: PersistenceState::new(rewrite_feed, aof_writer),
        }))
    }

    pub fn get_db(&self, index: usize) -> Option<Arc<Db>> {
        self.dbs.get(index).cloned()
    }

    /// Replays persisted state into the databases. The AOF is preferred
    /// when enabled and present since it is the more recent record;
    /// otherwise the RDB file is loaded.
    pub async fn load_from_disk(self: &Arc<Self>) -> Result<(), JasperDBError> {
        let persistence_config = self.config.lock().await.persistence.clone();
        if persistence_config.aof_enabled && Path::new(&persistence_config.aof_file_name).exists() {
            AofLoader::new(persistence_config).load_into(self).await
        } else {
            RdbLoader::new(persistence_config).load_into(self).await
        }
    }

    /// Hands the RESP-encoded bytes of an applied command to the event
    /// bus, which forwards them to the live AOF and to any replication
    /// subscribers.
    pub async fn append_command(&self, bytes: Bytes) -> Result<(), JasperDBError> {
        self.events.publish(bytes).await
    }

    /// Records keys dirtied by the command loop, feeding the save rules.
    pub fn note_writes(&self, count: u64) {
        self.persistence
            .dirty_keys_counter
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Synchronous RDB save; blocks the caller until the file is on disk.
    pub async fn save(self: &Arc<Self>) -> Result<(), JasperDBError> {
        RdbSaver::new(self.clone()).save().await
    }

    /// Background RDB save. Returns false when another snapshot consumer
    /// holds the coordinator slot.
    pub async fn bg_save(self: &Arc<Self>) -> Result<bool, JasperDBError> {
        RdbSaver::new(self.clone()).bg_save().await
    }

    /// Background AOF rewrite. Returns false when another snapshot consumer
    /// holds the coordinator slot.
    pub async fn bg_rewrite_aof(self: &Arc<Self>) -> Result<bool, JasperDBError> {
        AofRewriter::new(self.clone()).bg_rewrite().await
    }

    /// Spawns the periodic persistence tasks: the save-rule evaluator and
    /// the AOF growth trigger.
    pub fn start_background_tasks(
        self: &Arc<Self>,
        shutdown: &broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        let saver = RdbAutoSaver::new(self.clone());
        let rewrite_manager = AofRewriteManager::new(self.clone());
        vec![
            tokio::spawn(saver.run(shutdown.subscribe())),
            tokio::spawn(rewrite_manager.run(shutdown.subscribe())),
        ]
    }

    /// Flushes and releases the live AOF. Idempotent.
    pub async fn shutdown(&self) {
        if let Some(writer) = &self.persistence.aof_writer {
            writer.shutdown().await;
        }
        info!("engine shut down");
    }
}
