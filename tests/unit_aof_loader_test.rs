// tests/unit_aof_loader_test.rs

//! AOF replay: the reconstruction command set, SELECT scoping, tolerance
//! of unknown commands and truncated tails.

mod common;

use bytes::Bytes;
use common::{encode_command, test_config, test_state};
use indexmap::IndexMap;
use jasperdb::config::FsyncPolicy;
use jasperdb::core::storage::data_types::DataValue;
use std::collections::{HashSet, VecDeque};
use tempfile::TempDir;

fn write_aof(path: &str, commands: &[Vec<&[u8]>]) {
    let mut bytes = Vec::new();
    for args in commands {
        bytes.extend_from_slice(&encode_command(args));
    }
    std::fs::write(path, bytes).unwrap();
}

#[tokio::test]
async fn replays_the_reconstruction_command_set() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), true, FsyncPolicy::Never);
    write_aof(
        &config.persistence.aof_file_name,
        &[
            vec![b"SET", b"s", b"x"],
            vec![b"RPUSH", b"l", b"a", b"b"],
            vec![b"LPUSH", b"l", b"front"],
            vec![b"SADD", b"set", b"m1", b"m2"],
            vec![b"ZADD", b"z", b"1.5", b"m1", b"-2.0", b"m2"],
            vec![b"HSET", b"h", b"f1", b"v1", b"f2", b"v2"],
            vec![b"SELECT", b"1"],
            vec![b"SET", b"other", b"db1"],
            vec![b"SELECT", b"0"],
            vec![b"DEL", b"set"],
        ],
    );

    let state = test_state(config).await;
    state.load_from_disk().await.unwrap();

    let db0 = state.get_db(0).unwrap();
    assert_eq!(
        db0.get_value(&Bytes::from_static(b"s")).await,
        Some(DataValue::String(Bytes::from_static(b"x")))
    );
    assert_eq!(
        db0.get_value(&Bytes::from_static(b"l")).await,
        Some(DataValue::List(VecDeque::from([
            Bytes::from_static(b"front"),
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
        ])))
    );
    assert_eq!(db0.get_value(&Bytes::from_static(b"set")).await, None);

    let mut zset = IndexMap::new();
    zset.insert(Bytes::from_static(b"m1"), 1.5);
    zset.insert(Bytes::from_static(b"m2"), -2.0);
    assert_eq!(
        db0.get_value(&Bytes::from_static(b"z")).await,
        Some(DataValue::SortedSet(zset))
    );

    let mut hash = IndexMap::new();
    hash.insert(Bytes::from_static(b"f1"), Bytes::from_static(b"v1"));
    hash.insert(Bytes::from_static(b"f2"), Bytes::from_static(b"v2"));
    assert_eq!(
        db0.get_value(&Bytes::from_static(b"h")).await,
        Some(DataValue::Hash(hash))
    );

    let db1 = state.get_db(1).unwrap();
    assert_eq!(
        db1.get_value(&Bytes::from_static(b"other")).await,
        Some(DataValue::String(Bytes::from_static(b"db1")))
    );
    state.shutdown().await;
}

#[tokio::test]
async fn unknown_commands_are_skipped() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), true, FsyncPolicy::Never);
    write_aof(
        &config.persistence.aof_file_name,
        &[
            vec![b"SET", b"a", b"1"],
            vec![b"EXPIRE", b"a", b"100"],
            vec![b"SET", b"b", b"2"],
        ],
    );

    let state = test_state(config).await;
    state.load_from_disk().await.unwrap();
    let db = state.get_db(0).unwrap();
    assert_eq!(db.key_count().await, 2);
    state.shutdown().await;
}

#[tokio::test]
async fn truncated_tail_keeps_the_loaded_prefix() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), true, FsyncPolicy::Never);
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&encode_command(&[b"SET", b"a", b"1"]));
    bytes.extend_from_slice(&encode_command(&[b"SET", b"b", b"2"]));
    // Chop the last command in half.
    let full = bytes.len();
    bytes.truncate(full - 5);
    std::fs::write(&config.persistence.aof_file_name, bytes).unwrap();

    let state = test_state(config).await;
    state.load_from_disk().await.unwrap();
    let db = state.get_db(0).unwrap();
    assert_eq!(
        db.get_value(&Bytes::from_static(b"a")).await,
        Some(DataValue::String(Bytes::from_static(b"1")))
    );
    assert_eq!(db.get_value(&Bytes::from_static(b"b")).await, None);
    state.shutdown().await;
}

#[tokio::test]
async fn sadd_builds_a_set() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), true, FsyncPolicy::Never);
    write_aof(
        &config.persistence.aof_file_name,
        &[
            vec![b"SADD", b"s", b"a"],
            vec![b"SADD", b"s", b"b", b"a"],
        ],
    );
    let state = test_state(config).await;
    state.load_from_disk().await.unwrap();
    let expected: HashSet<Bytes> = [Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        .into_iter()
        .collect();
    assert_eq!(
        state
            .get_db(0)
            .unwrap()
            .get_value(&Bytes::from_static(b"s"))
            .await,
        Some(DataValue::Set(expected))
    );
    state.shutdown().await;
}
