// End-to-end index behavior: ordered lookups, range cursors, position-map
// state transitions and randomized put/remove workloads.

use std::collections::BTreeMap;
use std::sync::Arc;

use pagevault::btree::PrefixBTree;
use pagevault::cluster::{ClusterPositionMap, PositionState};
use pagevault::common::PagePosition;
use pagevault::{StorageConfig, StorageEngine};
use rand::prelude::*;
use tempfile::TempDir;

fn open(dir: &TempDir) -> Arc<StorageEngine> {
    // First caller wins; later test threads just reuse the subscriber.
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    StorageEngine::open(StorageConfig {
        data_dir: dir.path().to_path_buf(),
        page_size: 4096,
        cache_pages: 256,
        wal_segment_size: 8 << 20,
        max_embedded_value_size: 256,
        ..StorageConfig::default()
    })
    .unwrap()
}

#[test]
fn test_prefixed_keys_and_inclusive_range() {
    let dir = TempDir::new().unwrap();
    let tree = PrefixBTree::create(open(&dir), "range", false).unwrap();

    for (i, key) in ["a", "ab", "abc", "abd", "abe", "abf"].iter().enumerate() {
        tree.put(Some(key), &[(i + 1) as u8]).unwrap();
    }
    assert_eq!(tree.get(Some("abd")).unwrap(), Some(vec![4]));

    let entries = tree
        .iterate_entries_between("ab", true, "abe", true, true)
        .collect_all()
        .unwrap();
    let got: Vec<(&str, u8)> = entries.iter().map(|(k, v)| (k.as_str(), v[0])).collect();
    assert_eq!(got, [("ab", 2), ("abc", 3), ("abd", 4), ("abe", 5)]);
}

#[test]
fn test_position_map_allocate_then_fill() {
    let dir = TempDir::new().unwrap();
    let map = ClusterPositionMap::create(open(&dir), "positions.cpm").unwrap();

    assert_eq!(map.allocate().unwrap(), 0);
    assert_eq!(map.allocate().unwrap(), 1);
    assert_eq!(map.allocate().unwrap(), 2);
    map.set(1, PagePosition::new(100, 7)).unwrap();

    assert_eq!(map.get(0).unwrap(), None);
    assert_eq!(map.get(1).unwrap(), Some(PagePosition::new(100, 7)));
    assert_eq!(map.get(2).unwrap(), None);
    assert!(!map.is_full().unwrap());
    assert_eq!(map.size().unwrap(), 3);
}

#[test]
fn test_position_map_full_lifecycle() {
    let dir = TempDir::new().unwrap();
    let map = ClusterPositionMap::create(open(&dir), "lifecycle.cpm").unwrap();

    let index = map.add(PagePosition::new(7, 3)).unwrap();
    assert_eq!(map.status(index).unwrap(), PositionState::Filled);

    map.remove(index).unwrap();
    assert_eq!(map.status(index).unwrap(), PositionState::Removed);
    assert!(!map.exists(index).unwrap());

    map.resurrect(index, PagePosition::new(7, 3)).unwrap();
    assert_eq!(map.get(index).unwrap(), Some(PagePosition::new(7, 3)));
    assert!(map.exists(index).unwrap());
    assert_eq!(map.status(index).unwrap(), PositionState::Filled);
}

#[test]
fn test_random_put_remove_matches_model() {
    let dir = TempDir::new().unwrap();
    let tree = PrefixBTree::create(open(&dir), "model", false).unwrap();
    let mut model: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(0x5EED);

    for round in 0..3000u32 {
        let key = format!("k{:04}", rng.random_range(0..600));
        if rng.random_bool(0.65) {
            let value = round.to_be_bytes().to_vec();
            tree.put(Some(&key), &value).unwrap();
            model.insert(key, value);
        } else {
            let expected = model.remove(&key);
            assert_eq!(tree.remove(Some(&key)).unwrap(), expected, "remove {key}");
        }
    }

    assert_eq!(tree.size().unwrap(), model.len() as u64);
    for (key, value) in &model {
        assert_eq!(tree.get(Some(key)).unwrap().as_ref(), Some(value));
    }

    // The full cursor agrees with the model in content and order.
    let entries = tree.cursor(true).collect_all().unwrap();
    let expected: Vec<(String, Vec<u8>)> =
        model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(entries, expected);
}

#[test]
fn test_ordered_cursor_visits_exactly_n_keys() {
    let dir = TempDir::new().unwrap();
    let tree = PrefixBTree::create(open(&dir), "count", false).unwrap();
    let n = 1234u32;
    for i in 0..n {
        tree.put(Some(&format!("id:{i:08}")), b"r").unwrap();
    }
    assert_eq!(tree.size().unwrap(), n as u64);

    let mut cursor = tree.cursor(true).with_prefetch(17);
    let mut previous: Option<String> = None;
    let mut visited = 0u32;
    while let Some((key, _)) = cursor.next_entry().unwrap() {
        if let Some(previous) = &previous {
            assert!(previous < &key, "cursor out of order at {key}");
        }
        previous = Some(key);
        visited += 1;
    }
    assert_eq!(visited, n);
}

#[test]
fn test_indexes_coexist_in_one_engine() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);

    let tree = PrefixBTree::create(engine.clone(), "names", true).unwrap();
    let map = ClusterPositionMap::create(engine.clone(), "rows.cpm").unwrap();
    let index = pagevault::hashindex::HashIndex::create(engine.clone(), "ids").unwrap();

    for i in 0..200u64 {
        tree.put(Some(&format!("name{i}")), &i.to_be_bytes()).unwrap();
        let pos = map.add(PagePosition::new(i, i as u32)).unwrap();
        index.put(i, pos).unwrap();
    }
    tree.put(None, b"default").unwrap();

    engine.close().unwrap();

    let engine = open(&dir);
    let tree = PrefixBTree::open(engine.clone(), "names").unwrap();
    let map = ClusterPositionMap::open(engine.clone(), "rows.cpm").unwrap();
    let index = pagevault::hashindex::HashIndex::open(engine, "ids").unwrap();

    assert_eq!(tree.size().unwrap(), 200);
    assert_eq!(tree.get(None).unwrap(), Some(b"default".to_vec()));
    let pos = index.get(42).unwrap().unwrap();
    assert_eq!(map.get(pos).unwrap(), Some(PagePosition::new(42, 42)));
}
