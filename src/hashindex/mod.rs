// Extendible hash directory plus a fixed-key hash index over it.

mod directory;

pub use directory::{HashTableDirectory, LEVEL_SIZE, NODE_SIZE, NULL_NODE};

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::common::{FileId, PageIndex, PAGE_DATA_OFFSET};
use crate::error::{Result, StorageError};
use crate::page::PageView;
use crate::StorageEngine;

const COMPONENT: &str = "hash-index";

// Metadata page (page 0 of the bucket file).
const SIZE_OFFSET: usize = PAGE_DATA_OFFSET;

// Bucket pages.
const LOCAL_DEPTH_OFFSET: usize = PAGE_DATA_OFFSET;
const COUNT_OFFSET: usize = LOCAL_DEPTH_OFFSET + 1;
const ENTRIES_OFFSET: usize = COUNT_OFFSET + 2;
const ENTRY_SIZE: usize = 16;

/// Directory depth a single node supports (LEVEL_SIZE pointers).
const MAX_DEPTH: u8 = 8;

/// Hash index with u64 keys and values, addressed through one directory
/// node. Buckets split by local depth; the pointer table doubles in place
/// until the node's level is exhausted.
pub struct HashIndex {
    engine: Arc<StorageEngine>,
    directory: HashTableDirectory,
    buckets_file: FileId,
    root_node: u64,
    rw: RwLock<()>,
}

/// Finalizing mixer so dense key ranges spread across the table's most
/// significant bits.
fn mix(mut key: u64) -> u64 {
    key = key.wrapping_add(0x9E37_79B9_7F4A_7C15);
    key = (key ^ (key >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    key = (key ^ (key >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    key ^ (key >> 31)
}

impl HashIndex {
    pub fn create(engine: Arc<StorageEngine>, name: &str) -> Result<Self> {
        engine.atomic().register_component(COMPONENT);
        let directory = HashTableDirectory::create(engine.clone(), &format!("{name}.hid"))?;
        let buckets_file = engine.add_file(&format!("{name}.hb"))?;

        let atomic = engine.atomic().clone();
        let _lock = engine.locks().exclusive(buckets_file);
        let scope = atomic.start_atomic_operation(COMPONENT)?;
        let root_node = {
            let result = (|| {
                let mut meta = atomic.allocate_new_page(buckets_file)?;
                meta.set_u64(SIZE_OFFSET, 0);
                atomic.release_page(meta)?;

                let mut bucket = atomic.allocate_new_page(buckets_file)?;
                bucket.set_u8(LOCAL_DEPTH_OFFSET, 0);
                bucket.set_u16(COUNT_OFFSET, 0);
                let first_bucket = bucket.page_index();
                atomic.release_page(bucket)?;

                let mut pointers = vec![NULL_NODE; LEVEL_SIZE];
                pointers[0] = first_bucket;
                directory.add_new_node(0, 0, 0, &pointers)
            })();
            match result {
                Ok(node) => {
                    scope.commit()?;
                    node
                }
                Err(e) => {
                    scope.abort()?;
                    return Err(e);
                }
            }
        };

        debug!(index = name, "hash index created");
        Ok(Self {
            engine,
            directory,
            buckets_file,
            root_node,
            rw: RwLock::new(()),
        })
    }

    pub fn open(engine: Arc<StorageEngine>, name: &str) -> Result<Self> {
        let directory = HashTableDirectory::open(engine.clone(), &format!("{name}.hid"))?;
        let buckets_file = engine.open_file(&format!("{name}.hb"))?;
        Ok(Self {
            engine,
            directory,
            buckets_file,
            root_node: 0,
            rw: RwLock::new(()),
        })
    }

    pub fn directory(&self) -> &HashTableDirectory {
        &self.directory
    }

    pub fn len(&self) -> Result<u64> {
        let _guard = self.rw.read();
        let meta = self.engine.cache().load_for_read(self.buckets_file, 0)?;
        Ok(meta.get_u64(SIZE_OFFSET))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn slot_for(&self, hash: u64, depth: u8) -> usize {
        if depth == 0 {
            0
        } else {
            (hash >> (64 - depth)) as usize
        }
    }

    pub fn get(&self, key: u64) -> Result<Option<u64>> {
        let _guard = self.rw.read();
        let _lock = self.engine.locks().shared(self.buckets_file);
        let depth = self.directory.node_local_depth(self.root_node)?;
        let slot = self.slot_for(mix(key), depth);
        let bucket_page = self.directory.node_pointer(self.root_node, slot)?;
        let page = self
            .engine
            .cache()
            .load_for_read(self.buckets_file, bucket_page)?;
        Ok(bucket_find(&page, key).ok().map(|i| entry_value(&page, i)))
    }

    pub fn contains_key(&self, key: u64) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Insert or replace. Returns true when the key was new.
    pub fn put(&self, key: u64, value: u64) -> Result<bool> {
        let _guard = self.rw.write();
        let atomic = self.engine.atomic().clone();
        let _lock = self.engine.locks().exclusive(self.buckets_file);
        let scope = atomic.start_atomic_operation(COMPONENT)?;
        let result = self.put_inner(key, value);
        match result {
            Ok(inserted) => {
                scope.commit()?;
                Ok(inserted)
            }
            Err(e) => {
                scope.abort()?;
                Err(e)
            }
        }
    }

    fn put_inner(&self, key: u64, value: u64) -> Result<bool> {
        let atomic = self.engine.atomic().clone();
        let hash = mix(key);
        let capacity = (self.engine.config().page_size - ENTRIES_OFFSET) / ENTRY_SIZE;

        // Splits and doublings are bounded by the node level.
        for _ in 0..=(MAX_DEPTH as usize + 1) {
            let depth = self.directory.node_local_depth(self.root_node)?;
            let slot = self.slot_for(hash, depth);
            let bucket_page = self.directory.node_pointer(self.root_node, slot)?;

            let mut page = atomic.load_for_write(self.buckets_file, bucket_page)?;
            match bucket_find(&page, key) {
                Ok(i) => {
                    page.set_u64(ENTRIES_OFFSET + i * ENTRY_SIZE + 8, value);
                    atomic.release_page(page)?;
                    return Ok(false);
                }
                Err(i) => {
                    let count = page.get_u16(COUNT_OFFSET) as usize;
                    if count < capacity {
                        let at = ENTRIES_OFFSET + i * ENTRY_SIZE;
                        if i < count {
                            page.copy_bytes(at, at + ENTRY_SIZE, (count - i) * ENTRY_SIZE);
                        }
                        page.set_u64(at, key);
                        page.set_u64(at + 8, value);
                        page.set_u16(COUNT_OFFSET, count as u16 + 1);
                        atomic.release_page(page)?;

                        let mut meta = atomic.load_for_write(self.buckets_file, 0)?;
                        let size = meta.get_u64(SIZE_OFFSET);
                        meta.set_u64(SIZE_OFFSET, size + 1);
                        atomic.release_page(meta)?;
                        return Ok(true);
                    }
                }
            }

            // Bucket full: split it, doubling the pointer table first when
            // its local depth has caught up with the directory depth.
            let local_depth = page.get_u8(LOCAL_DEPTH_OFFSET);
            atomic.release_page(page)?;
            if local_depth == depth {
                if depth >= MAX_DEPTH {
                    return Err(StorageError::OutOfSpace(format!(
                        "hash directory node level exhausted at depth {depth}"
                    )));
                }
                self.double_directory(depth)?;
            }
            self.split_bucket(bucket_page, local_depth)?;
        }
        Err(StorageError::Corruption(
            "hash bucket split did not converge".into(),
        ))
    }

    pub fn remove(&self, key: u64) -> Result<Option<u64>> {
        let _guard = self.rw.write();
        let atomic = self.engine.atomic().clone();
        let _lock = self.engine.locks().exclusive(self.buckets_file);
        let scope = atomic.start_atomic_operation(COMPONENT)?;
        let result = (|| {
            let depth = self.directory.node_local_depth(self.root_node)?;
            let slot = self.slot_for(mix(key), depth);
            let bucket_page = self.directory.node_pointer(self.root_node, slot)?;

            let mut page = atomic.load_for_write(self.buckets_file, bucket_page)?;
            let Ok(i) = bucket_find(&page, key) else {
                atomic.release_page(page)?;
                return Ok(None);
            };
            let value = entry_value(&page, i);
            let count = page.get_u16(COUNT_OFFSET) as usize;
            let at = ENTRIES_OFFSET + i * ENTRY_SIZE;
            if i + 1 < count {
                page.copy_bytes(at + ENTRY_SIZE, at, (count - i - 1) * ENTRY_SIZE);
            }
            page.set_u16(COUNT_OFFSET, count as u16 - 1);
            atomic.release_page(page)?;

            let mut meta = atomic.load_for_write(self.buckets_file, 0)?;
            let size = meta.get_u64(SIZE_OFFSET);
            meta.set_u64(SIZE_OFFSET, size.saturating_sub(1));
            atomic.release_page(meta)?;
            Ok(Some(value))
        })();
        match result {
            Ok(removed) => {
                scope.commit()?;
                Ok(removed)
            }
            Err(e) => {
                scope.abort()?;
                Err(e)
            }
        }
    }

    /// Double the pointer table in place: every pointer at index i fans
    /// out to indices 2i and 2i+1.
    fn double_directory(&self, depth: u8) -> Result<()> {
        let pointers = self.directory.node(self.root_node)?;
        let old_len = 1usize << depth;
        for i in (0..old_len).rev() {
            self.directory
                .set_node_pointer(self.root_node, 2 * i, pointers[i])?;
            self.directory
                .set_node_pointer(self.root_node, 2 * i + 1, pointers[i])?;
        }
        self.directory
            .set_node_local_depth(self.root_node, depth + 1)?;
        debug!(depth = depth + 1, "hash directory doubled");
        Ok(())
    }

    /// Split one bucket: entries whose next hash bit is set move into a
    /// fresh bucket, and the pointer range covering the old bucket is
    /// rewired accordingly.
    fn split_bucket(&self, bucket_page: PageIndex, local_depth: u8) -> Result<()> {
        let atomic = self.engine.atomic().clone();
        let depth = self.directory.node_local_depth(self.root_node)?;
        debug_assert!(local_depth < depth);

        let mut old = atomic.load_for_write(self.buckets_file, bucket_page)?;
        let count = old.get_u16(COUNT_OFFSET) as usize;
        let entries: Vec<(u64, u64)> = (0..count)
            .map(|i| {
                (
                    old.get_u64(ENTRIES_OFFSET + i * ENTRY_SIZE),
                    entry_value(&old, i),
                )
            })
            .collect();

        let new_depth = local_depth + 1;
        let bit = 1u64 << (64 - new_depth as u32);
        let (stay, move_out): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|(k, _)| mix(*k) & bit == 0);

        let mut fresh = atomic.allocate_new_page(self.buckets_file)?;
        let fresh_index = fresh.page_index();
        fresh.set_u8(LOCAL_DEPTH_OFFSET, new_depth);
        fresh.set_u16(COUNT_OFFSET, move_out.len() as u16);
        for (i, (k, v)) in move_out.iter().enumerate() {
            fresh.set_u64(ENTRIES_OFFSET + i * ENTRY_SIZE, *k);
            fresh.set_u64(ENTRIES_OFFSET + i * ENTRY_SIZE + 8, *v);
        }
        atomic.release_page(fresh)?;

        old.set_u8(LOCAL_DEPTH_OFFSET, new_depth);
        old.set_u16(COUNT_OFFSET, stay.len() as u16);
        for (i, (k, v)) in stay.iter().enumerate() {
            old.set_u64(ENTRIES_OFFSET + i * ENTRY_SIZE, *k);
            old.set_u64(ENTRIES_OFFSET + i * ENTRY_SIZE + 8, *v);
        }
        atomic.release_page(old)?;

        // Rewire the back half of the slot range that pointed at the old
        // bucket.
        let group = 1usize << (depth - local_depth);
        let slots = self.directory.node(self.root_node)?;
        let table = 1usize << depth;
        let mut slot = 0;
        while slot < table {
            if slots[slot] == bucket_page {
                let start = slot;
                let half = group / 2;
                for s in start + half..start + group {
                    self.directory
                        .set_node_pointer(self.root_node, s, fresh_index)?;
                }
                slot = start + group;
            } else {
                slot += 1;
            }
        }
        Ok(())
    }
}

fn bucket_find(page: &impl PageView, key: u64) -> std::result::Result<usize, usize> {
    let count = page.get_u16(COUNT_OFFSET) as usize;
    let mut low = 0usize;
    let mut high = count;
    while low < high {
        let mid = (low + high) / 2;
        let probe = page.get_u64(ENTRIES_OFFSET + mid * ENTRY_SIZE);
        match key.cmp(&probe) {
            std::cmp::Ordering::Less => high = mid,
            std::cmp::Ordering::Greater => low = mid + 1,
            std::cmp::Ordering::Equal => return Ok(mid),
        }
    }
    Err(low)
}

fn entry_value(page: &impl PageView, index: usize) -> u64 {
    page.get_u64(ENTRIES_OFFSET + index * ENTRY_SIZE + 8)
}
