// src/core/tasks/persistence.rs

//! Periodic persistence triggers: the save-rule evaluator that schedules
//! background RDB saves, and the growth checker that schedules AOF
//! rewrites.

use crate::config::SaveRule;
use crate::core::persistence::aof_rewriter::AofRewriter;
use crate::core::persistence::rdb_saver::RdbSaver;
use crate::core::state::ServerState;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

/// The interval at which the saver task checks if save conditions are met.
const SAVE_CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// The interval for the AOF rewrite manager to check growth.
const AOF_REWRITE_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Evaluates the configured `save <seconds> <changes>` rules against the
/// dirty-keys counter and triggers a background RDB save when one is met.
pub struct RdbAutoSaver {
    state: Arc<ServerState>,
}

impl RdbAutoSaver {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let save_rules = {
            let config = self.state.config.lock().await;
            config.persistence.save_rules.clone()
        };
        if save_rules.is_empty() {
            info!("No 'save' rules configured. RDB auto-saver will not run.");
            return;
        }

        info!("RDB auto-saver task started.");
        let mut interval = tokio::time::interval(SAVE_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.should_save(&save_rules) {
                        match RdbSaver::new(self.state.clone()).bg_save().await {
                            Ok(true) => {}
                            Ok(false) => {}
                            Err(e) => error!("failed to start background save: {e}"),
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    // Final save when there are unsaved changes.
                    if self.state.persistence.dirty_keys_counter.load(Ordering::Relaxed) > 0 {
                        info!("Performing final RDB save on shutdown...");
                        if let Err(e) = RdbSaver::new(self.state.clone()).save().await {
                            error!("Final RDB save on shutdown failed: {e}");
                        }
                    }
                    info!("RDB auto-saver task finished.");
                    return;
                }
            }
        }
    }

    fn should_save(&self, save_rules: &[SaveRule]) -> bool {
        let dirty_keys = self
            .state
            .persistence
            .dirty_keys_counter
            .load(Ordering::Relaxed);
        if dirty_keys == 0 {
            return false;
        }
        let elapsed_since_last_save = {
            let last_success = self.state.persistence.last_save_success_time.lock();
            match *last_success {
                Some(instant) => instant.elapsed(),
                // No save yet: treat it as overdue so the first rule fires.
                None => Duration::from_secs(u64::MAX),
            }
        };
        for rule in save_rules {
            if elapsed_since_last_save.as_secs() >= rule.seconds && dirty_keys >= rule.changes {
                info!(
                    "RDB save condition met: {} changes in {} seconds (rule: save {} {}).",
                    dirty_keys,
                    elapsed_since_last_save.as_secs(),
                    rule.seconds,
                    rule.changes
                );
                return true;
            }
        }
        false
    }
}

/// Periodically checks AOF growth against the size recorded at the last
/// rewrite and triggers a background rewrite when the configured growth
/// percentage is exceeded.
pub struct AofRewriteManager {
    state: Arc<ServerState>,
}

impl AofRewriteManager {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let (enabled, min_size, percentage) = {
            let config = self.state.config.lock().await;
            (
                config.persistence.aof_enabled,
                config.persistence.auto_aof_rewrite_min_size,
                config.persistence.auto_aof_rewrite_percentage,
            )
        };
        if !enabled || percentage == 0 {
            info!("AOF auto-rewrite is disabled. Manager task will not run.");
            return;
        }

        if let Some(writer) = &self.state.persistence.aof_writer {
            self.state
                .persistence
                .aof_last_rewrite_size
                .store(writer.file_len().await, Ordering::Relaxed);
        }

        info!(
            "AOF auto-rewrite manager started. Min size: {} bytes, Percentage: {}%",
            min_size, percentage
        );
        let mut interval = tokio::time::interval(AOF_REWRITE_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_and_trigger_rewrite(min_size, percentage).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("AOF auto-rewrite manager shutting down.");
                    return;
                }
            }
        }
    }

    async fn check_and_trigger_rewrite(&self, min_size: u64, percentage: u64) {
        if self.state.persistence.coordinator.current_kind().is_some() {
            return;
        }
        let Some(writer) = &self.state.persistence.aof_writer else {
            return;
        };
        let current_size = writer.file_len().await;
        let last_size = self
            .state
            .persistence
            .aof_last_rewrite_size
            .load(Ordering::Relaxed);

        let should_rewrite = if last_size == 0 {
            current_size > min_size
        } else {
            let growth_percentage = if current_size > last_size {
                ((current_size - last_size) * 100) / last_size
            } else {
                0
            };
            current_size > min_size && growth_percentage >= percentage
        };

        if should_rewrite {
            info!(
                "AOF rewrite condition met. Current size: {}, Last rewrite size: {}.",
                current_size, last_size
            );
            match AofRewriter::new(self.state.clone()).bg_rewrite().await {
                Ok(_) => {}
                Err(e) => error!("failed to start AOF rewrite: {e}"),
            }
        }
    }
}
