// src/core/persistence/aof_loader.rs

//! Implements the logic for loading data from an append-only file into
//! memory when the engine starts.
//!
//! The AOF is a concatenation of RESP command arrays. The loader streams
//! the file in chunks, decodes frames incrementally, and applies the
//! reconstruction command set to the live databases. Unknown commands are
//! skipped with a warning so an AOF produced by a fuller command surface
//! still loads what this engine understands.

use crate::core::JasperDBError;
use crate::core::protocol::RespFrameCodec;
use crate::core::state::ServerState;
use crate::core::storage::data_types::DataValue;
use bytes::{Bytes, BytesMut};
use indexmap::IndexMap;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

pub struct AofLoader {
    config: crate::config::PersistenceConfig,
}

impl AofLoader {
    pub fn new(config: crate::config::PersistenceConfig) -> Self {
        Self { config }
    }

    /// Replays the AOF into the provided `ServerState`.
    ///
    /// Reads the file in chunks and decodes as many frames as each chunk
    /// allows, so the whole file is never resident at once. Trailing
    /// truncated data is tolerated with a warning; everything before it
    /// has already been applied.
    pub async fn load_into(&self, state: &Arc<ServerState>) -> Result<(), JasperDBError> {
        if !self.config.aof_enabled {
            return Ok(());
        }
        let path = Path::new(&self.config.aof_file_name);
        if !path.exists() {
            info!(
                "AOF file not found at '{}', starting with an empty state.",
                self.config.aof_file_name
            );
            return Ok(());
        }

        info!("Loading data from AOF file: {}", self.config.aof_file_name);
        let file = File::open(path).await?;
        let mut reader = BufReader::new(file);
        let mut buffer = BytesMut::with_capacity(8192);
        let mut codec = RespFrameCodec;
        let mut commands_loaded = 0usize;
        let mut current_db_index = 0usize;

        'read: loop {
            if reader.read_buf(&mut buffer).await? == 0 {
                if !buffer.is_empty() {
                    warn!("AOF file has trailing, incomplete data. Ignoring.");
                }
                break;
            }

            loop {
                let frame = match codec.decode(&mut buffer) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        if buffer.iter().all(|b| *b == 0) {
                            // The zeroed tail of a preallocated AOF.
                            debug!("Ignoring zeroed tail at the end of the AOF.");
                        } else {
                            warn!(
                                "Error parsing command from AOF file (file might be truncated): \
                                 {e}. Continuing with loaded data."
                            );
                        }
                        break 'read;
                    }
                };
                let Some(args) = frame.into_command_args() else {
                    warn!("AOF entry is not a command array. Skipping.");
                    continue;
                };
                if args.is_empty() {
                    continue;
                }
                apply_command(state, &mut current_db_index, &args).await;
                commands_loaded += 1;
            }
        }

        info!("Successfully loaded {commands_loaded} commands from AOF.");
        Ok(())
    }
}

/// Applies one command to the live state. Commands outside the replay set
/// and commands with malformed arguments are skipped with a warning; a
/// partially usable AOF still loads what it can.
async fn apply_command(state: &Arc<ServerState>, current_db_index: &mut usize, args: &[Bytes]) {
    let name = String::from_utf8_lossy(&args[0]).to_uppercase();
    match name.as_str() {
        "SELECT" => {
            let Some(index) = parse_index(args.get(1)) else {
                warn!("SELECT with a malformed index in AOF. Skipping.");
                return;
            };
            if index < state.dbs.len() {
                *current_db_index = index;
            } else {
                warn!("SELECT to out-of-range DB index {index} in AOF file. Ignoring.");
            }
        }
        "SET" => {
            if args.len() < 3 {
                warn!("SET with too few arguments in AOF. Skipping.");
                return;
            }
            let db = &state.dbs[*current_db_index];
            db.dict
                .lock()
                .await
                .put(args[1].clone(), DataValue::String(args[2].clone()));
        }
        "DEL" => {
            let db = &state.dbs[*current_db_index];
            let mut dict = db.dict.lock().await;
            for key in &args[1..] {
                dict.remove(key);
            }
        }
        "RPUSH" | "LPUSH" => {
            if args.len() < 3 {
                warn!("{name} with too few arguments in AOF. Skipping.");
                return;
            }
            let db = &state.dbs[*current_db_index];
            let mut dict = db.dict.lock().await;
            let key = &args[1];
            if dict.get(key).is_none() {
                dict.put(key.clone(), DataValue::List(VecDeque::new()));
            }
            match dict.get_mut(key) {
                Some(DataValue::List(list)) => {
                    for item in &args[2..] {
                        if name == "RPUSH" {
                            list.push_back(item.clone());
                        } else {
                            list.push_front(item.clone());
                        }
                    }
                }
                _ => warn!("{name} against a non-list key in AOF. Skipping."),
            }
        }
        "SADD" => {
            if args.len() < 3 {
                warn!("SADD with too few arguments in AOF. Skipping.");
                return;
            }
            let db = &state.dbs[*current_db_index];
            let mut dict = db.dict.lock().await;
            let key = &args[1];
            if dict.get(key).is_none() {
                dict.put(key.clone(), DataValue::Set(HashSet::new()));
            }
            match dict.get_mut(key) {
                Some(DataValue::Set(set)) => {
                    for member in &args[2..] {
                        set.insert(member.clone());
                    }
                }
                _ => warn!("SADD against a non-set key in AOF. Skipping."),
            }
        }
        "ZADD" => {
            if args.len() < 4 || args.len() % 2 != 0 {
                warn!("ZADD with a malformed argument list in AOF. Skipping.");
                return;
            }
            let mut pairs = Vec::with_capacity((args.len() - 2) / 2);
            for chunk in args[2..].chunks(2) {
                let Some(score) = parse_score(&chunk[0]) else {
                    warn!("ZADD with a malformed score in AOF. Skipping.");
                    return;
                };
                pairs.push((chunk[1].clone(), score));
            }
            let db = &state.dbs[*current_db_index];
            let mut dict = db.dict.lock().await;
            let key = &args[1];
            if dict.get(key).is_none() {
                dict.put(key.clone(), DataValue::SortedSet(IndexMap::new()));
            }
            match dict.get_mut(key) {
                Some(DataValue::SortedSet(zset)) => {
                    for (member, score) in pairs {
                        zset.insert(member, score);
                    }
                }
                _ => warn!("ZADD against a non-zset key in AOF. Skipping."),
            }
        }
        "HSET" => {
            if args.len() < 4 || args.len() % 2 != 0 {
                warn!("HSET with a malformed argument list in AOF. Skipping.");
                return;
            }
            let db = &state.dbs[*current_db_index];
            let mut dict = db.dict.lock().await;
            let key = &args[1];
            if dict.get(key).is_none() {
                dict.put(key.clone(), DataValue::Hash(IndexMap::new()));
            }
            match dict.get_mut(key) {
                Some(DataValue::Hash(hash)) => {
                    for chunk in args[2..].chunks(2) {
                        hash.insert(chunk[0].clone(), chunk[1].clone());
                    }
                }
                _ => warn!("HSET against a non-hash key in AOF. Skipping."),
            }
        }
        other => {
            warn!("Skipping unknown command during AOF replay: {other}");
        }
    }
}

fn parse_index(arg: Option<&Bytes>) -> Option<usize> {
    std::str::from_utf8(arg?).ok()?.parse().ok()
}

fn parse_score(arg: &Bytes) -> Option<f64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}
