// Bonsai B-tree: many small trees per file, buckets carved out of shared
// pages, sys-bucket allocator with a free list.

mod bucket;
mod tree;

pub use bucket::BUCKET_SIZE;
pub use tree::{sys_free_list_length, BonsaiTree};

#[cfg(test)]
mod tests {
    use super::bucket;
    use super::tree::sys_free_list_length;
    use super::BonsaiTree;
    use super::BUCKET_SIZE;
    use crate::error::StorageError;
    use crate::{StorageConfig, StorageEngine};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> Arc<StorageEngine> {
        StorageEngine::open(StorageConfig {
            data_dir: dir.path().to_path_buf(),
            // Three bonsai regions per page, so buckets share pages.
            page_size: 8192,
            cache_pages: 128,
            wal_segment_size: 8 << 20,
            ..StorageConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_put_get_remove() {
        let dir = TempDir::new().unwrap();
        let tree: BonsaiTree<i64, u64> = BonsaiTree::create(engine(&dir), "ridbags.bon").unwrap();

        assert!(tree.put(&10, &100).unwrap());
        assert!(tree.put(&20, &200).unwrap());
        assert!(!tree.put(&10, &111).unwrap());

        assert_eq!(tree.get(&10).unwrap(), Some(111));
        assert_eq!(tree.get(&20).unwrap(), Some(200));
        assert_eq!(tree.get(&30).unwrap(), None);
        assert!(tree.contains_key(&20).unwrap());
        assert_eq!(tree.size().unwrap(), 2);

        assert_eq!(tree.remove(&10).unwrap(), Some(111));
        assert_eq!(tree.remove(&10).unwrap(), None);
        assert_eq!(tree.size().unwrap(), 1);
    }

    #[test]
    fn test_leaf_split_keeps_all_keys_findable() {
        let dir = TempDir::new().unwrap();
        let tree: BonsaiTree<i64, u64> = BonsaiTree::create(engine(&dir), "split.bon").unwrap();

        // Twice a bucket's worth of fixed-size keys forces splits.
        let n = (2 * BUCKET_SIZE / 8) as i64;
        for i in 0..n {
            assert!(tree.put(&i, &(i as u64 * 2)).unwrap(), "insert of {i}");
            assert_eq!(tree.get(&i).unwrap(), Some(i as u64 * 2), "find of {i}");
        }
        assert_eq!(tree.size().unwrap(), n as u64);
        for i in 0..n {
            assert_eq!(tree.get(&i).unwrap(), Some(i as u64 * 2));
        }
        assert_eq!(tree.first_key().unwrap(), Some(0));
        assert_eq!(tree.last_key().unwrap(), Some(n - 1));
    }

    #[test]
    fn test_first_split_leaves_one_separator_in_root() {
        let dir = TempDir::new().unwrap();
        let eng = engine(&dir);
        let tree: BonsaiTree<i64, u64> = BonsaiTree::create(eng.clone(), "root.bon").unwrap();
        let root = tree.root_pointer();

        let root_is_leaf = |eng: &std::sync::Arc<crate::StorageEngine>| {
            let page = eng
                .cache()
                .load_for_read(tree.file_id(), root.page_index)
                .unwrap();
            bucket::is_leaf(&page, root.page_offset as usize)
        };

        let mut inserted = 0i64;
        while root_is_leaf(&eng) {
            tree.put(&inserted, &(inserted as u64)).unwrap();
            inserted += 1;
        }

        // Right after the first split the root holds a single separator
        // and the halves still cover every key.
        let page = eng
            .cache()
            .load_for_read(tree.file_id(), root.page_index)
            .unwrap();
        assert_eq!(bucket::entry_count(&page, root.page_offset as usize), 1);
        drop(page);
        for i in 0..inserted {
            assert_eq!(tree.get(&i).unwrap(), Some(i as u64), "find of {i}");
        }
    }

    #[test]
    fn test_range_visitors() {
        let dir = TempDir::new().unwrap();
        let tree: BonsaiTree<i64, u64> = BonsaiTree::create(engine(&dir), "range.bon").unwrap();
        for i in 0..100i64 {
            tree.put(&i, &(i as u64)).unwrap();
        }

        let mut seen = Vec::new();
        tree.values_between(&10, true, &20, false, |k, v| {
            seen.push((*k, *v));
            true
        })
        .unwrap();
        assert_eq!(seen.len(), 10);
        assert_eq!(seen.first(), Some(&(10, 10)));
        assert_eq!(seen.last(), Some(&(19, 19)));

        let mut minor = Vec::new();
        tree.values_minor(&5, true, |k, _| {
            minor.push(*k);
            true
        })
        .unwrap();
        assert_eq!(minor, vec![0, 1, 2, 3, 4, 5]);

        let mut major = Vec::new();
        tree.values_major(&95, false, |k, _| {
            major.push(*k);
            true
        })
        .unwrap();
        assert_eq!(major, vec![96, 97, 98, 99]);

        // The visitor can stop the scan early.
        let mut count = 0;
        tree.values_major(&0, true, |_, _| {
            count += 1;
            count < 7
        })
        .unwrap();
        assert_eq!(count, 7);
    }

    #[test]
    fn test_delete_moves_buckets_to_free_list() {
        let dir = TempDir::new().unwrap();
        let eng = engine(&dir);
        let tree: BonsaiTree<i64, u64> = BonsaiTree::create(eng.clone(), "del.bon").unwrap();
        let n = (2 * BUCKET_SIZE / 8) as i64;
        for i in 0..n {
            tree.put(&i, &(i as u64)).unwrap();
        }
        assert_eq!(sys_free_list_length(&eng, "del.bon").unwrap(), 0);

        tree.delete().unwrap();
        let freed = sys_free_list_length(&eng, "del.bon").unwrap();
        assert!(freed >= 3, "a split tree frees root and children, got {freed}");

        // A new tree reuses reclaimed buckets instead of growing the file.
        let reborn: BonsaiTree<i64, u64> = BonsaiTree::create(eng.clone(), "del.bon").unwrap();
        assert!(sys_free_list_length(&eng, "del.bon").unwrap() < freed);
        reborn.put(&1, &1).unwrap();
        assert_eq!(reborn.get(&1).unwrap(), Some(1));
    }

    #[test]
    fn test_clear_keeps_root_usable() {
        let dir = TempDir::new().unwrap();
        let tree: BonsaiTree<i64, u64> = BonsaiTree::create(engine(&dir), "clr.bon").unwrap();
        let n = (2 * BUCKET_SIZE / 8) as i64;
        for i in 0..n {
            tree.put(&i, &(i as u64)).unwrap();
        }
        let root = tree.root_pointer();
        tree.clear().unwrap();
        assert_eq!(tree.size().unwrap(), 0);
        assert_eq!(tree.get(&5).unwrap(), None);
        assert_eq!(tree.root_pointer(), root);

        tree.put(&42, &7).unwrap();
        assert_eq!(tree.get(&42).unwrap(), Some(7));
        assert_eq!(tree.size().unwrap(), 1);
    }

    #[test]
    fn test_load_validates_serializer_ids() {
        let dir = TempDir::new().unwrap();
        let eng = engine(&dir);
        let tree: BonsaiTree<i64, u64> = BonsaiTree::create(eng.clone(), "typed.bon").unwrap();
        tree.put(&1, &2).unwrap();
        let root = tree.root_pointer();

        // Loading with the written types succeeds.
        let same: BonsaiTree<i64, u64> = BonsaiTree::load(eng.clone(), "typed.bon", root).unwrap();
        assert_eq!(same.get(&1).unwrap(), Some(2));

        // Loading with different types is a serializer mismatch.
        let wrong: Result<BonsaiTree<String, u64>, _> =
            BonsaiTree::load(eng, "typed.bon", root);
        assert!(matches!(wrong, Err(StorageError::SerializerMismatch(_))));
    }

    #[test]
    fn test_two_trees_share_one_file() {
        let dir = TempDir::new().unwrap();
        let eng = engine(&dir);
        let a: BonsaiTree<i64, u64> = BonsaiTree::create(eng.clone(), "shared.bon").unwrap();
        let b: BonsaiTree<i64, u64> = BonsaiTree::create(eng, "shared.bon").unwrap();
        assert_ne!(a.root_pointer(), b.root_pointer());

        for i in 0..50i64 {
            a.put(&i, &1).unwrap();
            b.put(&i, &2).unwrap();
        }
        assert_eq!(a.get(&25).unwrap(), Some(1));
        assert_eq!(b.get(&25).unwrap(), Some(2));
        assert_eq!(a.size().unwrap(), 50);
        assert_eq!(b.size().unwrap(), 50);
    }
}
