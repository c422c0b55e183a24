// Prefix B+-tree: variable-length string keys, per-bucket prefix
// compression, embedded or chained values, batched cursors.

mod bucket;
mod cursor;
mod tree;
mod values;

pub use cursor::TreeCursor;
pub use tree::{PrefixBTree, Validation};

#[cfg(test)]
mod tests {
    use super::bucket;
    use super::tree::PrefixBTree;
    use super::Validation;
    use crate::common::PageIndex;
    use crate::page::PageView;
    use crate::{StorageConfig, StorageEngine};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> Arc<StorageEngine> {
        StorageEngine::open(StorageConfig {
            data_dir: dir.path().to_path_buf(),
            page_size: 4096,
            cache_pages: 128,
            wal_segment_size: 8 << 20,
            max_embedded_value_size: 256,
            ..StorageConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let tree = PrefixBTree::create(engine(&dir), "users", false).unwrap();

        tree.put(Some("alice"), b"1").unwrap();
        tree.put(Some("bob"), b"2").unwrap();
        assert_eq!(tree.get(Some("alice")).unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree.get(Some("bob")).unwrap(), Some(b"2".to_vec()));
        assert_eq!(tree.get(Some("carol")).unwrap(), None);
        assert_eq!(tree.size().unwrap(), 2);

        // Replacement does not change the size.
        tree.put(Some("alice"), b"one").unwrap();
        assert_eq!(tree.get(Some("alice")).unwrap(), Some(b"one".to_vec()));
        assert_eq!(tree.size().unwrap(), 2);
    }

    #[test]
    fn test_remove_returns_old_value() {
        let dir = TempDir::new().unwrap();
        let tree = PrefixBTree::create(engine(&dir), "users", false).unwrap();
        tree.put(Some("k"), b"v").unwrap();
        assert_eq!(tree.remove(Some("k")).unwrap(), Some(b"v".to_vec()));
        assert_eq!(tree.remove(Some("k")).unwrap(), None);
        assert_eq!(tree.get(Some("k")).unwrap(), None);
        assert_eq!(tree.size().unwrap(), 0);
    }

    #[test]
    fn test_splits_preserve_order_and_size() {
        let dir = TempDir::new().unwrap();
        let tree = PrefixBTree::create(engine(&dir), "big", false).unwrap();

        let n = 2000u32;
        for i in 0..n {
            let key = format!("key:{i:06}");
            tree.put(Some(&key), format!("value-{i}").as_bytes()).unwrap();
        }
        assert_eq!(tree.size().unwrap(), n as u64);

        for i in (0..n).step_by(97) {
            let key = format!("key:{i:06}");
            assert_eq!(
                tree.get(Some(&key)).unwrap(),
                Some(format!("value-{i}").into_bytes()),
                "lookup of {key}"
            );
        }

        // A full ascending cursor sees every key exactly once, in order.
        let all = tree.cursor(true).collect_all().unwrap();
        assert_eq!(all.len(), n as usize);
        for (i, (key, _)) in all.iter().enumerate() {
            assert_eq!(key, &format!("key:{i:06}"));
        }

        assert_eq!(tree.first_key().unwrap(), Some("key:000000".into()));
        assert_eq!(tree.last_key().unwrap(), Some(format!("key:{:06}", n - 1)));
    }

    #[test]
    fn test_descending_cursor_mirrors_ascending() {
        let dir = TempDir::new().unwrap();
        let tree = PrefixBTree::create(engine(&dir), "rev", false).unwrap();
        for i in 0..500u32 {
            tree.put(Some(&format!("k{i:04}")), &i.to_be_bytes()).unwrap();
        }
        let forward = tree.cursor(true).collect_all().unwrap();
        let mut backward = tree.cursor(false).collect_all().unwrap();
        backward.reverse();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_range_cursors() {
        let dir = TempDir::new().unwrap();
        let tree = PrefixBTree::create(engine(&dir), "range", false).unwrap();
        for key in ["a", "ab", "abc", "abd", "abe", "abf"] {
            tree.put(Some(key), key.as_bytes()).unwrap();
        }

        let between = tree
            .iterate_entries_between("ab", true, "abe", true, true)
            .collect_all()
            .unwrap();
        let keys: Vec<_> = between.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["ab", "abc", "abd", "abe"]);

        let minor = tree
            .iterate_entries_minor("abc", false, true)
            .collect_all()
            .unwrap();
        let keys: Vec<_> = minor.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["a", "ab"]);

        let major = tree
            .iterate_entries_major("abd", false, true)
            .collect_all()
            .unwrap();
        let keys: Vec<_> = major.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["abe", "abf"]);
    }

    #[test]
    fn test_update_validator_can_veto() {
        let dir = TempDir::new().unwrap();
        let tree = PrefixBTree::create(engine(&dir), "upd", false).unwrap();
        tree.put(Some("counter"), b"1").unwrap();

        let allow = tree
            .update("counter", |_| b"2".to_vec(), None)
            .unwrap();
        assert!(allow);
        assert_eq!(tree.get(Some("counter")).unwrap(), Some(b"2".to_vec()));

        let veto: &dyn Fn(&str, Option<&[u8]>, &[u8]) -> Validation =
            &|_, _, new| {
                if new == b"3" {
                    Validation::Ignore
                } else {
                    Validation::Allow
                }
            };
        let applied = tree
            .update("counter", |_| b"3".to_vec(), Some(veto))
            .unwrap();
        assert!(!applied);
        assert_eq!(tree.get(Some("counter")).unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_null_key_support() {
        let dir = TempDir::new().unwrap();
        let eng = engine(&dir);
        let plain = PrefixBTree::create(eng.clone(), "plain", false).unwrap();
        assert!(plain.put(None, b"x").is_err());

        let nullable = PrefixBTree::create(eng, "nullable", true).unwrap();
        assert_eq!(nullable.get(None).unwrap(), None);
        nullable.put(None, b"null-value").unwrap();
        assert_eq!(nullable.get(None).unwrap(), Some(b"null-value".to_vec()));
        assert_eq!(nullable.remove(None).unwrap(), Some(b"null-value".to_vec()));
        assert_eq!(nullable.get(None).unwrap(), None);
    }

    #[test]
    fn test_large_values_roundtrip_through_overflow_chains() {
        let dir = TempDir::new().unwrap();
        let tree = PrefixBTree::create(engine(&dir), "blobs", false).unwrap();

        let big: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        tree.put(Some("big"), &big).unwrap();
        assert_eq!(tree.get(Some("big")).unwrap(), Some(big.clone()));

        // Replace with another large value; the old chain is recycled.
        let bigger: Vec<u8> = (0..30_000u32).map(|i| (i % 241) as u8).collect();
        tree.put(Some("big"), &bigger).unwrap();
        assert_eq!(tree.get(Some("big")).unwrap(), Some(bigger));

        assert_eq!(tree.remove(Some("big")).unwrap().map(|v| v.len()), Some(30_000));
        assert_eq!(tree.get(Some("big")).unwrap(), None);
    }

    #[test]
    fn test_clear_resets_tree() {
        let dir = TempDir::new().unwrap();
        let tree = PrefixBTree::create(engine(&dir), "clr", false).unwrap();
        for i in 0..300u32 {
            tree.put(Some(&format!("k{i}")), b"v").unwrap();
        }
        tree.clear().unwrap();
        assert_eq!(tree.size().unwrap(), 0);
        assert_eq!(tree.get(Some("k5")).unwrap(), None);
        assert!(tree.cursor(true).collect_all().unwrap().is_empty());

        tree.put(Some("fresh"), b"v").unwrap();
        assert_eq!(tree.size().unwrap(), 1);
    }

    #[test]
    fn test_reopen_preserves_contents() {
        let dir = TempDir::new().unwrap();
        {
            let tree = PrefixBTree::create(engine(&dir), "persist", false).unwrap();
            for i in 0..800u32 {
                tree.put(Some(&format!("p{i:04}")), &i.to_be_bytes()).unwrap();
            }
            tree.engine().close().unwrap();
        }
        let tree = PrefixBTree::open(engine(&dir), "persist").unwrap();
        assert_eq!(tree.size().unwrap(), 800);
        assert_eq!(
            tree.get(Some("p0500")).unwrap(),
            Some(500u32.to_be_bytes().to_vec())
        );
    }

    /// Every bucket's keys start with its stored prefix, and internal
    /// entries route correctly: left-child keys below, right-child keys at
    /// or above the entry key.
    #[test]
    fn test_bucket_prefix_and_routing_invariants() {
        let dir = TempDir::new().unwrap();
        let eng = engine(&dir);
        let tree = PrefixBTree::create(eng.clone(), "inv", false).unwrap();
        for i in 0..1500u32 {
            tree.put(Some(&format!("prefix:shared:{i:05}")), b"v").unwrap();
        }

        let file_id = tree.file_id();
        let mut stack: Vec<(PageIndex, Option<Vec<u8>>, Option<Vec<u8>>)> =
            vec![(0, None, None)];
        let mut leaves = 0;
        while let Some((page_index, low, high)) = stack.pop() {
            let page = eng.cache().load_for_read(file_id, page_index).unwrap();
            let prefix = bucket::prefix(&page);
            let count = bucket::entry_count(&page);
            let mut prev: Option<Vec<u8>> = None;
            for i in 0..count {
                let key = bucket::entry_key(&page, i);
                assert!(
                    key.starts_with(&prefix),
                    "key escapes its bucket prefix on page {page_index}"
                );
                if let Some(prev) = &prev {
                    assert!(prev < &key, "keys out of order on page {page_index}");
                }
                if let Some(low) = &low {
                    assert!(&key >= low, "key below subtree bound");
                }
                if let Some(high) = &high {
                    assert!(&key < high, "key above subtree bound");
                }
                prev = Some(key);
            }
            if bucket::is_leaf(&page) {
                leaves += 1;
                continue;
            }
            for i in 0..count {
                let key = bucket::entry_key(&page, i);
                let left_high = Some(key.clone());
                let right_low = Some(key.clone());
                stack.push((bucket::left_child(&page, i), low.clone(), left_high));
                stack.push((
                    bucket::right_child(&page, i),
                    right_low,
                    if i + 1 < count {
                        Some(bucket::entry_key(&page, i + 1))
                    } else {
                        high.clone()
                    },
                ));
            }
        }
        assert!(leaves > 1, "expected the tree to have split");
    }
}
