// tests/unit_replication_contract_test.rs

//! The contract the replication transport builds on: a point-in-time RDB
//! image for full resync, plus the ordered live command stream from the
//! event bus.

mod common;

use bytes::Bytes;
use common::{encode_command, test_config, test_state};
use jasperdb::JasperDBError;
use jasperdb::config::FsyncPolicy;
use jasperdb::core::persistence::coordinator::SnapshotKind;
use jasperdb::core::persistence::rdb;
use jasperdb::core::persistence::rdb_saver::RdbSaver;
use jasperdb::core::storage::data_types::DataValue;
use tempfile::TempDir;

#[tokio::test]
async fn full_sync_image_loads_into_a_fresh_replica() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), false, FsyncPolicy::Never);
    let primary = test_state(config.clone()).await;

    for i in 0..300usize {
        primary
            .get_db(i % 3)
            .unwrap()
            .insert_value_from_load(
                Bytes::from(format!("k{i}")),
                DataValue::String(Bytes::from(format!("v{i}"))),
            )
            .await;
    }

    let image = RdbSaver::new(primary.clone()).full_sync_image().await.unwrap();
    assert!(image.starts_with(b"REDIS0009"));

    let replica = test_state(config).await;
    rdb::load_from_bytes(&image, &replica.dbs).await.unwrap();
    for db_index in 0..3 {
        assert_eq!(
            replica.get_db(db_index).unwrap().key_count().await,
            primary.get_db(db_index).unwrap().key_count().await
        );
    }
    assert_eq!(
        replica
            .get_db(1)
            .unwrap()
            .get_value(&Bytes::from_static(b"k1"))
            .await,
        Some(DataValue::String(Bytes::from_static(b"v1")))
    );

    // The image generation released its snapshots and the slot.
    assert!(primary.persistence.coordinator.current_kind().is_none());
    assert!(!primary.get_db(0).unwrap().dict.lock().await.is_snapshotting());
}

#[tokio::test]
async fn full_sync_image_respects_the_coordinator() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), false, FsyncPolicy::Never);
    let state = test_state(config).await;
    assert!(state.persistence.coordinator.try_acquire(SnapshotKind::Aof));
    assert!(matches!(
        RdbSaver::new(state.clone()).full_sync_image().await,
        Err(JasperDBError::InvalidState(_))
    ));
    state.persistence.coordinator.release(SnapshotKind::Aof);
}

#[tokio::test]
async fn live_stream_delivers_published_commands_in_order() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), false, FsyncPolicy::Never);
    let state = test_state(config).await;

    let mut stream = state.events.subscribe_for_replication();
    let mut published = Vec::new();
    for i in 0..50 {
        let buffer = encode_command(&[b"SET", format!("k{i}").as_bytes(), b"v"]);
        published.push(buffer.clone());
        state.append_command(buffer).await.unwrap();
    }
    for expected in published {
        assert_eq!(stream.recv().await.unwrap(), expected);
    }
}

#[tokio::test]
async fn stream_feeds_aof_and_replicas_from_one_publish() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), true, FsyncPolicy::Always);
    let state = test_state(config.clone()).await;

    let mut stream = state.events.subscribe_for_replication();
    let buffer = encode_command(&[b"SET", b"k", b"v"]);
    state.append_command(buffer.clone()).await.unwrap();

    // Replica side saw it.
    assert_eq!(stream.recv().await.unwrap(), buffer);
    // And the AOF has it on disk already under the always policy.
    let on_disk = std::fs::read(&config.persistence.aof_file_name).unwrap();
    assert_eq!(on_disk, buffer.as_ref());
    state.shutdown().await;
}
