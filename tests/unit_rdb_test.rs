// tests/unit_rdb_test.rs

//! RDB persistence: framing, CRC64 verification, round trips through save
//! and load, and the background save path.

mod common;

use bytes::Bytes;
use common::{test_config, test_state};
use crc::{CRC_64_REDIS, Crc};
use indexmap::IndexMap;
use jasperdb::JasperDBError;
use jasperdb::config::FsyncPolicy;
use jasperdb::core::storage::data_types::DataValue;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tempfile::TempDir;

async fn populate_two_databases(state: &std::sync::Arc<jasperdb::core::state::ServerState>) {
    let db0 = state.get_db(0).unwrap();
    db0.insert_value_from_load(
        Bytes::from_static(b"s"),
        DataValue::String(Bytes::from_static(b"x")),
    )
    .await;
    db0.insert_value_from_load(
        Bytes::from_static(b"l"),
        DataValue::List(VecDeque::from([
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
        ])),
    )
    .await;

    let db1 = state.get_db(1).unwrap();
    let mut hash = IndexMap::new();
    hash.insert(Bytes::from_static(b"f"), Bytes::from_static(b"v"));
    db1.insert_value_from_load(Bytes::from_static(b"h"), DataValue::Hash(hash))
        .await;
}

#[tokio::test]
async fn save_and_load_round_trip_across_databases() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), false, FsyncPolicy::Never);
    let state = test_state(config.clone()).await;
    populate_two_databases(&state).await;

    state.save().await.unwrap();

    let bytes = std::fs::read(&config.persistence.rdb_file_name).unwrap();
    assert!(bytes.starts_with(b"REDIS0009"));
    // The trailer is the CRC64 of everything before it.
    let (body, trailer) = bytes.split_at(bytes.len() - 8);
    let checksum = Crc::<u64>::new(&CRC_64_REDIS).checksum(body);
    assert_eq!(trailer, checksum.to_le_bytes());

    let fresh = test_state(config).await;
    fresh.load_from_disk().await.unwrap();

    let db0 = fresh.get_db(0).unwrap();
    assert_eq!(
        db0.get_value(&Bytes::from_static(b"s")).await,
        Some(DataValue::String(Bytes::from_static(b"x")))
    );
    assert_eq!(
        db0.get_value(&Bytes::from_static(b"l")).await,
        Some(DataValue::List(VecDeque::from([
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
        ])))
    );
    let db1 = fresh.get_db(1).unwrap();
    let mut expected_hash = IndexMap::new();
    expected_hash.insert(Bytes::from_static(b"f"), Bytes::from_static(b"v"));
    assert_eq!(
        db1.get_value(&Bytes::from_static(b"h")).await,
        Some(DataValue::Hash(expected_hash))
    );
    // Nothing leaked into the other databases.
    assert_eq!(fresh.get_db(2).unwrap().key_count().await, 0);
}

#[tokio::test]
async fn all_value_types_survive_a_round_trip() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), false, FsyncPolicy::Never);
    let state = test_state(config.clone()).await;

    let db = state.get_db(0).unwrap();
    let mut zset = IndexMap::new();
    zset.insert(Bytes::from_static(b"m1"), 1.5);
    zset.insert(Bytes::from_static(b"m2"), -7.25);
    let mut set = HashSet::new();
    set.insert(Bytes::from_static(b"one"));
    set.insert(Bytes::from_static(b"two"));
    db.insert_value_from_load(Bytes::from_static(b"zset"), DataValue::SortedSet(zset.clone()))
        .await;
    db.insert_value_from_load(Bytes::from_static(b"set"), DataValue::Set(set.clone()))
        .await;

    state.save().await.unwrap();
    let fresh = test_state(config).await;
    fresh.load_from_disk().await.unwrap();

    let db = fresh.get_db(0).unwrap();
    assert_eq!(
        db.get_value(&Bytes::from_static(b"zset")).await,
        Some(DataValue::SortedSet(zset))
    );
    assert_eq!(
        db.get_value(&Bytes::from_static(b"set")).await,
        Some(DataValue::Set(set))
    );
}

#[tokio::test]
async fn single_bit_flip_fails_verification_and_leaves_state_untouched() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), false, FsyncPolicy::Never);
    let state = test_state(config.clone()).await;
    populate_two_databases(&state).await;
    state.save().await.unwrap();

    let path = &config.persistence.rdb_file_name;
    let mut bytes = std::fs::read(path).unwrap();
    let flip_at = bytes.len() / 2;
    bytes[flip_at] ^= 0x01;
    std::fs::write(path, &bytes).unwrap();

    let fresh = test_state(config).await;
    match fresh.load_from_disk().await {
        Err(JasperDBError::Corruption(_)) => {}
        other => panic!("expected Corruption, got {other:?}"),
    }
    // The refused load applied nothing.
    assert_eq!(fresh.get_db(0).unwrap().key_count().await, 0);
}

#[tokio::test]
async fn bad_magic_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), false, FsyncPolicy::Never);
    let state = test_state(config.clone()).await;
    populate_two_databases(&state).await;
    state.save().await.unwrap();

    let path = &config.persistence.rdb_file_name;
    let mut bytes = std::fs::read(path).unwrap();
    bytes[0] = b'X';
    // Keep the checksum consistent so only the magic is at fault.
    let body_len = bytes.len() - 8;
    let checksum = Crc::<u64>::new(&CRC_64_REDIS).checksum(&bytes[..body_len]);
    bytes[body_len..].copy_from_slice(&checksum.to_le_bytes());
    std::fs::write(path, &bytes).unwrap();

    let fresh = test_state(config).await;
    assert!(matches!(
        fresh.load_from_disk().await,
        Err(JasperDBError::Corruption(_))
    ));
}

#[tokio::test]
async fn failed_save_does_not_disturb_the_existing_file() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), false, FsyncPolicy::Never);
    let state = test_state(config.clone()).await;
    populate_two_databases(&state).await;
    state.save().await.unwrap();
    let before = std::fs::read(&config.persistence.rdb_file_name).unwrap();

    // Point the next save somewhere unwritable.
    config.persistence.rdb_file_name = dir
        .path()
        .join("missing-subdir")
        .join("dump.rdb")
        .to_string_lossy()
        .into_owned();
    {
        let mut guard = state.config.lock().await;
        guard.persistence.rdb_file_name = config.persistence.rdb_file_name.clone();
    }
    assert!(state.save().await.is_err());

    // The original file is byte-identical.
    let after = std::fs::read(dir.path().join("dump.rdb")).unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn background_save_runs_while_writes_continue() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), false, FsyncPolicy::Never);
    let state = test_state(config.clone()).await;

    let db = state.get_db(0).unwrap();
    for i in 0..2000 {
        db.insert_value_from_load(
            Bytes::from(format!("k{i}")),
            DataValue::String(Bytes::from(format!("v{i}"))),
        )
        .await;
    }

    assert!(state.bg_save().await.unwrap());
    // The slot is exclusive while the worker runs.
    let second = state.bg_save().await.unwrap();
    assert!(!second);

    // Keep writing while the worker iterates the snapshot.
    for i in 2000..2500 {
        db.insert_value_from_load(
            Bytes::from(format!("k{i}")),
            DataValue::String(Bytes::from(format!("v{i}"))),
        )
        .await;
    }

    // Wait for the worker to finish and release the slot.
    let mut waited = Duration::ZERO;
    while state.persistence.coordinator.current_kind().is_some() {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
        assert!(waited < Duration::from_secs(10), "background save hung");
    }

    let fresh = test_state(config).await;
    fresh.load_from_disk().await.unwrap();
    let loaded = fresh.get_db(0).unwrap();
    // The snapshots were taken before bg_save returned, so the file holds
    // exactly the pre-trigger keys.
    assert_eq!(loaded.key_count().await, 2000);
    assert_eq!(
        loaded.get_value(&Bytes::from_static(b"k1999")).await,
        Some(DataValue::String(Bytes::from_static(b"v1999")))
    );
}
