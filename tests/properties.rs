//! Property tests for read/write/remove semantics.

use eblob_store::{BlobStore, BlobType, Key, RecordFlags, StoreConfig};
use proptest::prelude::*;
use std::collections::HashMap;
use tempfile::TempDir;

fn open(dir: &TempDir) -> BlobStore {
    BlobStore::open(StoreConfig {
        iterate_threads: 1,
        sync_interval_secs: 0,
        ..StoreConfig::new(dir.path().join("data"))
    })
    .unwrap()
}

#[derive(Clone, Debug)]
enum Op {
    Write { key: u8, blob_type: u32, data: Vec<u8> },
    Remove { key: u8, blob_type: u32 },
    RemoveAll { key: u8 },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..8, 0u32..3, prop::collection::vec(any::<u8>(), 0..64))
            .prop_map(|(key, blob_type, data)| Op::Write { key, blob_type, data }),
        2 => (0u8..8, 0u32..3).prop_map(|(key, blob_type)| Op::Remove { key, blob_type }),
        1 => (0u8..8).prop_map(|key| Op::RemoveAll { key }),
    ]
}

fn key(k: u8) -> Key {
    Key::from_slice(&[k]).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn write_then_read_returns_payload(
        raw_key in prop::array::uniform32(any::<u8>()),
        blob_type in any::<u32>(),
        data in prop::collection::vec(any::<u8>(), 0..4096),
    ) {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let key = Key::from_slice(&raw_key).unwrap();

        store.write(&key, &data, RecordFlags::NONE, BlobType(blob_type)).unwrap();
        let read = store.read_data(&key, 0, data.len() as u64, BlobType(blob_type)).unwrap();
        prop_assert_eq!(read, data);
    }

    #[test]
    fn hashed_addressing_is_stable(s in ".{0,40}", data in prop::collection::vec(any::<u8>(), 1..256)) {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        store.write_hashed(&s, &data, RecordFlags::NONE, BlobType(1)).unwrap();
        for _ in 0..3 {
            let read = store.read_data_hashed(&s, 0, 0, BlobType(1)).unwrap();
            prop_assert_eq!(&read, &data);
        }
    }

    #[test]
    fn store_matches_model(ops in prop::collection::vec(op(), 1..60)) {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let mut model: HashMap<(u8, u32), Vec<u8>> = HashMap::new();

        for op in &ops {
            match op {
                Op::Write { key: k, blob_type, data } => {
                    let before = store.elements();
                    let existed = model.contains_key(&(*k, *blob_type));
                    store.write(&key(*k), data, RecordFlags::NONE, BlobType(*blob_type)).unwrap();
                    model.insert((*k, *blob_type), data.clone());
                    let expected = if existed { before } else { before + 1 };
                    prop_assert_eq!(store.elements(), expected);
                }
                Op::Remove { key: k, blob_type } => {
                    store.remove(&key(*k), BlobType(*blob_type));
                    model.remove(&(*k, *blob_type));
                    let err = store.read_data(&key(*k), 0, 0, BlobType(*blob_type)).unwrap_err();
                    prop_assert!(err.is_not_found());
                }
                Op::RemoveAll { key: k } => {
                    store.remove_all(&key(*k));
                    model.retain(|(mk, _), _| mk != k);
                    for t in 0..3 {
                        prop_assert!(!store.contains(&key(*k), BlobType(t)));
                    }
                }
            }
        }

        prop_assert_eq!(store.elements(), model.len() as u64);
        for ((k, t), data) in &model {
            let read = store.read_data(&key(*k), 0, 0, BlobType(*t)).unwrap();
            prop_assert_eq!(&read, data);
        }

        // Same answers after a reopen.
        store.close().unwrap();
        let store = open(&dir);
        prop_assert_eq!(store.elements(), model.len() as u64);
        for ((k, t), data) in &model {
            let read = store.read_data(&key(*k), 0, 0, BlobType(*t)).unwrap();
            prop_assert_eq!(&read, data);
        }
    }
}
