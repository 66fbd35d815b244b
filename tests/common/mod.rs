// tests/common/mod.rs

//! Shared helpers for the integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use jasperdb::config::{Config, FsyncPolicy};
use jasperdb::core::protocol::RespFrame;
use jasperdb::core::state::ServerState;
use std::path::Path;
use std::sync::Arc;

/// Builds a config whose persistence files live under `dir`.
pub fn test_config(dir: &Path, aof_enabled: bool, fsync_policy: FsyncPolicy) -> Config {
    let mut config = Config::default();
    config.databases = 4;
    config.persistence.aof_enabled = aof_enabled;
    config.persistence.fsync_policy = fsync_policy;
    config.persistence.aof_file_name = dir.join("appendonly.aof").to_string_lossy().into_owned();
    config.persistence.rdb_file_name = dir.join("dump.rdb").to_string_lossy().into_owned();
    config
}

pub async fn test_state(config: Config) -> Arc<ServerState> {
    init_tracing();
    ServerState::initialize(config)
        .await
        .expect("failed to initialize engine state")
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_test_writer()
        .try_init();
}

/// RESP encoding of a command, as the command loop would hand it to the
/// AOF writer.
pub fn encode_command(args: &[&[u8]]) -> Bytes {
    let frame = RespFrame::command(args.iter().map(|a| Bytes::copy_from_slice(a)));
    Bytes::from(frame.encode_to_vec().expect("encode command"))
}
