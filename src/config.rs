// src/config.rs

//! Manages engine configuration: loading, validation, and defaults.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;

/// A raw representation of the config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_databases")]
    databases: usize,
    #[serde(default)]
    persistence: PersistenceConfig,
}

fn default_databases() -> usize {
    16
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Represents the final, validated engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub log_level: String,
    pub databases: usize,
    pub persistence: PersistenceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            databases: default_databases(),
            persistence: PersistenceConfig::default(),
        }
    }
}

/// Persistence-related settings for the append-only file (AOF) and the
/// RDB snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub aof_enabled: bool,
    #[serde(default = "default_aof_file_name")]
    pub aof_file_name: String,
    #[serde(default = "default_fsync_policy")]
    pub fsync_policy: FsyncPolicy,
    /// Interval between background fsyncs. Only meaningful when the
    /// policy is `everysecond`.
    #[serde(default = "default_aof_fsync_interval_ms")]
    pub aof_fsync_interval_ms: u64,
    /// Extend the AOF in 4 MiB steps and truncate back to the logical
    /// size on close, to reduce fragmentation on some filesystems.
    #[serde(default)]
    pub preallocate_aof: bool,
    #[serde(default = "default_auto_aof_rewrite_percentage")]
    pub auto_aof_rewrite_percentage: u64,
    #[serde(default = "default_auto_aof_rewrite_min_size")]
    pub auto_aof_rewrite_min_size: u64,
    #[serde(default = "default_rdb_file_name")]
    pub rdb_file_name: String,
    #[serde(default = "default_save_rules")]
    pub save_rules: Vec<SaveRule>,
}

fn default_aof_file_name() -> String {
    "appendonly.aof".to_string()
}
fn default_rdb_file_name() -> String {
    "dump.rdb".to_string()
}
fn default_fsync_policy() -> FsyncPolicy {
    FsyncPolicy::EverySecond
}
fn default_aof_fsync_interval_ms() -> u64 {
    1000
}
fn default_auto_aof_rewrite_percentage() -> u64 {
    100
}
fn default_auto_aof_rewrite_min_size() -> u64 {
    64 * 1024 * 1024 // 64MB
}
fn default_save_rules() -> Vec<SaveRule> {
    vec![
        SaveRule {
            seconds: 900,
            changes: 1,
        },
        SaveRule {
            seconds: 300,
            changes: 10,
        },
        SaveRule {
            seconds: 60,
            changes: 10000,
        },
    ]
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            aof_enabled: false,
            aof_file_name: default_aof_file_name(),
            fsync_policy: default_fsync_policy(),
            aof_fsync_interval_ms: default_aof_fsync_interval_ms(),
            preallocate_aof: false,
            auto_aof_rewrite_percentage: default_auto_aof_rewrite_percentage(),
            auto_aof_rewrite_min_size: default_auto_aof_rewrite_min_size(),
            rdb_file_name: default_rdb_file_name(),
            save_rules: default_save_rules(),
        }
    }
}

/// A rule defining when to automatically save the RDB file.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SaveRule {
    pub seconds: u64,
    pub changes: u64,
}

/// Defines the frequency of the `fsync` system call for AOF persistence.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FsyncPolicy {
    Never,
    EverySecond,
    Always,
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw_config: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let config = Config {
            log_level: raw_config.log_level,
            databases: raw_config.databases,
            persistence: raw_config.persistence,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.databases == 0 {
            return Err(anyhow!("databases cannot be 0"));
        }
        if self.persistence.aof_fsync_interval_ms == 0 {
            return Err(anyhow!("aof_fsync_interval_ms must be positive"));
        }
        if self.persistence.aof_enabled && self.persistence.aof_file_name.trim().is_empty() {
            return Err(anyhow!("aof_file_name cannot be empty when AOF is enabled"));
        }
        if self.persistence.rdb_file_name.trim().is_empty() {
            return Err(anyhow!("rdb_file_name cannot be empty"));
        }
        for (i, rule) in self.persistence.save_rules.iter().enumerate() {
            if rule.seconds == 0 {
                return Err(anyhow!("invalid save rule #{}: seconds cannot be 0", i + 1));
            }
            if rule.changes == 0 {
                return Err(anyhow!("invalid save rule #{}: changes cannot be 0", i + 1));
            }
        }
        Ok(())
    }
}
