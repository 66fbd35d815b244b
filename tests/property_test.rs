// tests/property_test.rs

//! Property-based tests: the dictionary behaves as an ordinary map under
//! arbitrary operation sequences, snapshots never disturb the live view,
//! and RDB images round-trip bit-exactly.

use bytes::Bytes;
use indexmap::IndexMap;
use jasperdb::core::persistence::rdb;
use jasperdb::core::storage::data_types::DataValue;
use jasperdb::core::storage::dict::Dict;
use proptest::prelude::*;
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone)]
enum Op {
    Put(u8, u16),
    Remove(u8),
    Get(u8),
    StartSnapshot,
    FinishSnapshot,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (any::<u8>(), any::<u16>()).prop_map(|(k, v)| Op::Put(k, v)),
        2 => any::<u8>().prop_map(Op::Remove),
        2 => any::<u8>().prop_map(Op::Get),
        1 => Just(Op::StartSnapshot),
        1 => Just(Op::FinishSnapshot),
    ]
}

fn bytes_strategy() -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..64).prop_map(Bytes::from)
}

fn data_value_strategy() -> impl Strategy<Value = DataValue> {
    prop_oneof![
        bytes_strategy().prop_map(DataValue::String),
        prop::collection::vec(bytes_strategy(), 0..16)
            .prop_map(|items| DataValue::List(VecDeque::from(items))),
        prop::collection::hash_set(bytes_strategy(), 0..16)
            .prop_map(|set| DataValue::Set(set.into_iter().collect::<HashSet<_>>())),
        prop::collection::vec((bytes_strategy(), -1000.0f64..1000.0), 0..16).prop_map(|pairs| {
            DataValue::SortedSet(pairs.into_iter().collect::<IndexMap<_, _>>())
        }),
        prop::collection::vec((bytes_strategy(), bytes_strategy()), 0..16)
            .prop_map(|pairs| DataValue::Hash(pairs.into_iter().collect::<IndexMap<_, _>>())),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        max_shrink_iters: 1000,
        ..ProptestConfig::default()
    })]

    /// Interleaved put/remove/get behaves exactly like a HashMap,
    /// regardless of rehash thresholds crossed along the way. Snapshot
    /// start/finish pairs sprinkled in must never change the live view.
    #[test]
    fn dict_matches_a_model_map(ops in prop::collection::vec(op_strategy(), 1..400)) {
        let mut dict: Dict<u8, u16> = Dict::new();
        let mut model: HashMap<u8, u16> = HashMap::new();

        for op in ops {
            match op {
                Op::Put(k, v) => {
                    prop_assert_eq!(dict.put(k, v), model.insert(k, v));
                }
                Op::Remove(k) => {
                    prop_assert_eq!(dict.remove(&k), model.remove(&k));
                }
                Op::Get(k) => {
                    prop_assert_eq!(dict.get(&k), model.get(&k));
                }
                Op::StartSnapshot => {
                    // May fail if one is already active; that is the
                    // protocol, not a model divergence.
                    let _ = dict.start_snapshot();
                }
                Op::FinishSnapshot => {
                    let _ = dict.finish_snapshot();
                }
            }
            prop_assert_eq!(dict.len(), model.len());
            // Outside of a rehash the primary table never reaches load
            // factor 1.0; the write that would have done so started one.
            if !dict.rehash_in_progress() {
                prop_assert!(dict.len() < dict.primary_size() || dict.is_snapshotting());
            }
        }

        if dict.is_snapshotting() {
            dict.finish_snapshot().unwrap();
        }
        let mut entries = dict.entries();
        entries.sort_unstable();
        let mut expected: Vec<(u8, u16)> = model.into_iter().collect();
        expected.sort_unstable();
        prop_assert_eq!(entries, expected);
    }

    /// A snapshot taken at any point reflects exactly the model at that
    /// point, no matter what happens afterwards.
    #[test]
    fn snapshot_view_is_frozen(
        before in prop::collection::vec((any::<u8>(), any::<u16>()), 0..100),
        after in prop::collection::vec(op_strategy(), 0..200),
    ) {
        let mut dict: Dict<u8, u16> = Dict::new();
        let mut model: HashMap<u8, u16> = HashMap::new();
        for (k, v) in before {
            dict.put(k, v);
            model.insert(k, v);
        }

        let token = dict.start_snapshot().unwrap();
        for op in after {
            match op {
                Op::Put(k, v) => { dict.put(k, v); }
                Op::Remove(k) => { dict.remove(&k); }
                Op::Get(k) => { dict.get(&k); }
                // Nested snapshot transitions would tear down the one
                // under test.
                Op::StartSnapshot | Op::FinishSnapshot => {}
            }
        }

        let mut seen: Vec<(u8, u16)> = dict.iter_snapshot(token).unwrap().collect();
        seen.sort_unstable();
        let mut expected: Vec<(u8, u16)> = model.into_iter().collect();
        expected.sort_unstable();
        prop_assert_eq!(seen, expected);

        dict.finish_snapshot().unwrap();
    }

    /// load(save(D)) == D for arbitrary values, and the checksum always
    /// verifies.
    #[test]
    fn rdb_round_trips_arbitrary_values(
        records in prop::collection::vec((bytes_strategy(), data_value_strategy()), 0..20)
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            // Last write wins for duplicate keys, as in the dictionary.
            let mut deduped: IndexMap<Bytes, DataValue> = IndexMap::new();
            for (k, v) in records {
                deduped.insert(k, v);
            }
            let section: Vec<(Bytes, DataValue)> = deduped.clone().into_iter().collect();
            let image = rdb::encode_databases(&[(0, section)]);

            let dbs = vec![std::sync::Arc::new(
                jasperdb::core::storage::db::Db::new(0),
            )];
            rdb::load_from_bytes(&image, &dbs).await.unwrap();

            let mut dict = dbs[0].dict.lock().await;
            assert_eq!(dict.len(), deduped.len());
            for (k, v) in &deduped {
                assert_eq!(dict.get(k), Some(v), "value mismatch for key {k:?}");
            }
        });
    }
}
