// # Prefix B+-tree
//
// Variable-length string keys with per-bucket prefix compression. One tree
// per file, root bucket at page 0. Writers hold the index write lock plus
// the exclusive file lock; readers hold the shared pair. Structural
// changes run inside one atomic operation and roll back as a unit.
//
// Split separators are minimized: the split point is searched in a window
// around the median and the separator is the shortest key that still
// distinguishes the halves, which keeps parent buckets dense.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::common::{FileId, PageIndex, PAGE_DATA_OFFSET};
use crate::encryption::{EncryptionProvider, NoEncryption};
use crate::error::{Result, StorageError};
use crate::page::{DurablePage, PageView};
use crate::serializer::SerialType;
use crate::tx::AtomicOperationsManager;
use crate::StorageEngine;

use super::bucket::{self, BucketEntry, LeafValue};
use super::values;

pub(super) const ROOT_PAGE: PageIndex = 0;
const COMPONENT: &str = "prefix-btree";

// Null-bucket page layout.
const NULL_PRESENT_OFFSET: usize = PAGE_DATA_OFFSET;
const NULL_LEN_OFFSET: usize = NULL_PRESENT_OFFSET + 1;
const NULL_VALUE_OFFSET: usize = NULL_LEN_OFFSET + 4;

/// Outcome of the update validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Allow,
    /// Veto the update; the tree stays unchanged and `update` returns false.
    Ignore,
}

/// One level of a descent: the bucket page, the child slot taken from it,
/// and the bucket's own boundary keys inherited from its ancestors.
#[derive(Debug, Clone)]
pub(super) struct Level {
    pub page: PageIndex,
    pub slot: usize,
    pub left_bound: Option<Vec<u8>>,
    pub right_bound: Option<Vec<u8>>,
}

/// Ordered, durable string-keyed index with prefix-compressed buckets.
pub struct PrefixBTree {
    engine: Arc<StorageEngine>,
    name: String,
    file_id: FileId,
    null_file_id: Option<FileId>,
    /// Per-index shared/exclusive lock; the file-lock manager serializes
    /// against other components sharing the file.
    rw: RwLock<()>,
    encryption: Arc<dyn EncryptionProvider>,
}

impl PrefixBTree {
    /// Create a new tree. With `null_support`, a single-page side file
    /// holds the value associated with the null key.
    pub fn create(engine: Arc<StorageEngine>, name: &str, null_support: bool) -> Result<Self> {
        Self::create_with_encryption(engine, name, null_support, Arc::new(NoEncryption))
    }

    pub fn create_with_encryption(
        engine: Arc<StorageEngine>,
        name: &str,
        null_support: bool,
        encryption: Arc<dyn EncryptionProvider>,
    ) -> Result<Self> {
        engine.atomic().register_component(COMPONENT);
        let file_id = engine.add_file(&format!("{name}.pbt"))?;
        let null_file_id = if null_support {
            Some(engine.add_file(&format!("{name}.npt"))?)
        } else {
            None
        };
        let tree = Self {
            engine,
            name: name.to_string(),
            file_id,
            null_file_id,
            rw: RwLock::new(()),
            encryption,
        };

        let atomic = tree.engine.atomic().clone();
        let _lock = tree.engine.locks().exclusive(file_id);
        let scope = atomic.start_atomic_operation(COMPONENT)?;
        let result = (|| {
            let mut root = atomic.allocate_new_page(file_id)?;
            bucket::init(&mut root, true, &[]);
            bucket::set_tree_size(&mut root, 0);
            bucket::set_value_free_list(&mut root, bucket::NO_CHILD);
            atomic.release_page(root)?;
            if let Some(null_file) = tree.null_file_id {
                let mut null_page = atomic.allocate_new_page(null_file)?;
                null_page.set_u8(NULL_PRESENT_OFFSET, 0);
                atomic.release_page(null_page)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => scope.commit()?,
            Err(e) => {
                scope.abort()?;
                return Err(e);
            }
        }
        debug!(tree = name, "prefix b-tree created");
        Ok(tree)
    }

    /// Open an existing tree; null support is detected from the side file.
    pub fn open(engine: Arc<StorageEngine>, name: &str) -> Result<Self> {
        Self::open_with_encryption(engine, name, Arc::new(NoEncryption))
    }

    pub fn open_with_encryption(
        engine: Arc<StorageEngine>,
        name: &str,
        encryption: Arc<dyn EncryptionProvider>,
    ) -> Result<Self> {
        engine.atomic().register_component(COMPONENT);
        let file_id = engine.open_file(&format!("{name}.pbt"))?;
        let null_name = format!("{name}.npt");
        let null_file_id = if engine.exists(&null_name) {
            Some(engine.open_file(&null_name)?)
        } else {
            None
        };
        Ok(Self {
            engine,
            name: name.to_string(),
            file_id,
            null_file_id,
            rw: RwLock::new(()),
            encryption,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub(super) fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    pub(super) fn read_guard(&self) -> parking_lot::RwLockReadGuard<'_, ()> {
        self.rw.read()
    }

    /// Number of non-null keys in the tree.
    pub fn size(&self) -> Result<u64> {
        let _guard = self.rw.read();
        let _lock = self.engine.locks().shared(self.file_id);
        let root = self.engine.cache().load_for_read(self.file_id, ROOT_PAGE)?;
        Ok(bucket::tree_size(&root))
    }

    pub fn get(&self, key: Option<&str>) -> Result<Option<Vec<u8>>> {
        let _guard = self.rw.read();
        let _lock = self.engine.locks().shared(self.file_id);
        match key {
            None => self.read_null_value(),
            Some(key) => {
                let key = preprocess_key(key);
                let Some((leaf_page, index)) = self.find_leaf_entry(&key)? else {
                    return Ok(None);
                };
                let leaf = self.engine.cache().load_for_read(self.file_id, leaf_page)?;
                let value = bucket::leaf_value(&leaf, index);
                drop(leaf);
                self.materialize_value(value).map(Some)
            }
        }
    }

    pub fn key_exists(&self, key: &str) -> Result<bool> {
        let _guard = self.rw.read();
        let _lock = self.engine.locks().shared(self.file_id);
        let key = preprocess_key(key);
        Ok(self.find_leaf_entry(&key)?.is_some())
    }

    pub fn put(&self, key: Option<&str>, value: &[u8]) -> Result<()> {
        let _guard = self.rw.write();
        if let Some(key) = key {
            let key = preprocess_key(key);
            self.mutate(|tree, atomic| tree.put_inner(atomic, &key, value).map(|_| ()))
        } else {
            self.write_null_value(Some(value))
        }
    }

    /// Apply `updater` to the current value. A validator may veto the
    /// result, in which case nothing changes and `false` is returned.
    pub fn update(
        &self,
        key: &str,
        updater: impl FnOnce(Option<&[u8]>) -> Vec<u8>,
        validator: Option<&dyn Fn(&str, Option<&[u8]>, &[u8]) -> Validation>,
    ) -> Result<bool> {
        let _guard = self.rw.write();
        let key_bytes = preprocess_key(key);

        // Read the current value outside the operation; the exclusive index
        // lock keeps it stable.
        let current = {
            let _lock = self.engine.locks().shared(self.file_id);
            match self.find_leaf_entry(&key_bytes)? {
                None => None,
                Some((leaf_page, index)) => {
                    let leaf = self.engine.cache().load_for_read(self.file_id, leaf_page)?;
                    let value = bucket::leaf_value(&leaf, index);
                    drop(leaf);
                    Some(self.materialize_value(value)?)
                }
            }
        };

        let new_value = updater(current.as_deref());
        if let Some(validator) = validator {
            if validator(key, current.as_deref(), &new_value) == Validation::Ignore {
                return Ok(false);
            }
        }

        self.mutate(|tree, atomic| tree.put_inner(atomic, &key_bytes, &new_value).map(|_| ()))?;
        Ok(true)
    }

    pub fn remove(&self, key: Option<&str>) -> Result<Option<Vec<u8>>> {
        let _guard = self.rw.write();
        match key {
            None => {
                let old = self.read_null_value()?;
                if old.is_some() {
                    self.write_null_value(None)?;
                }
                Ok(old)
            }
            Some(key) => {
                let key = preprocess_key(key);
                let mut removed = None;
                self.mutate(|tree, atomic| {
                    removed = tree.remove_inner(atomic, &key)?;
                    Ok(())
                })?;
                Ok(removed)
            }
        }
    }

    /// Drop every entry. The root becomes an empty leaf again; detached
    /// bucket pages stay in the file and are reused through page
    /// allocation as the tree regrows.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.rw.write();
        self.mutate(|tree, atomic| {
            let mut root = atomic.load_for_write(tree.file_id, ROOT_PAGE)?;
            bucket::init(&mut root, true, &[]);
            bucket::set_tree_size(&mut root, 0);
            bucket::set_value_free_list(&mut root, bucket::NO_CHILD);
            atomic.release_page(root)?;
            Ok(())
        })?;
        if self.null_file_id.is_some() {
            self.write_null_value(None)?;
        }
        Ok(())
    }

    /// Delete the tree's files. Runs outside any atomic operation because
    /// file deletion cannot be rolled back.
    pub fn delete(self) -> Result<()> {
        self.engine.delete_file(self.file_id)?;
        if let Some(null_file) = self.null_file_id {
            self.engine.delete_file(null_file)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Run `body` under the exclusive file lock inside one atomic scope.
    fn mutate(
        &self,
        body: impl FnOnce(&Self, &AtomicOperationsManager) -> Result<()>,
    ) -> Result<()> {
        let atomic = self.engine.atomic().clone();
        let _lock = self.engine.locks().exclusive(self.file_id);
        let scope = atomic.start_atomic_operation(COMPONENT)?;
        match body(self, &atomic) {
            Ok(()) => scope.commit(),
            Err(e) => {
                scope.abort()?;
                Err(e)
            }
        }
    }

    fn put_inner(&self, atomic: &AtomicOperationsManager, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut root = atomic.load_for_write(self.file_id, ROOT_PAGE)?;
        let path = self.descend(&root, key)?;
        let leaf_level = path.last().expect("descent returns at least the root");

        let encrypted = self.encryption.encrypt(value)?;
        let leaf_value = if encrypted.len() <= self.engine.config().max_embedded_value_size {
            LeafValue::Embedded(encrypted)
        } else {
            let head = values::write_chain(atomic, self.file_id, &mut root, &encrypted)?;
            LeafValue::Overflow {
                head,
                len: encrypted.len() as u32,
            }
        };

        let leaf_is_root = leaf_level.page == ROOT_PAGE;
        let mut leaf_handle = if leaf_is_root {
            None
        } else {
            Some(atomic.load_for_write(self.file_id, leaf_level.page)?)
        };

        let (position, replaced_old) = {
            let leaf_view: &DurablePage = leaf_handle.as_ref().unwrap_or(&root);
            match bucket::find(leaf_view, key) {
                Ok(i) => (i, Some(bucket::leaf_value(leaf_view, i))),
                Err(i) => (i, None),
            }
        };

        // Free a replaced overflow chain before the entry is rewritten.
        if let Some(LeafValue::Overflow { head, .. }) = &replaced_old {
            let head = *head;
            values::free_chain(atomic, self.file_id, &mut root, head)?;
        }

        let entry = BucketEntry::Leaf {
            key: key.to_vec(),
            value: leaf_value,
        };

        let fitted = {
            let leaf_page: &mut DurablePage = leaf_handle.as_mut().unwrap_or(&mut root);
            if replaced_old.is_some() {
                bucket::remove(leaf_page, position);
            }
            bucket::insert(leaf_page, position, &entry)
        };

        if !fitted {
            let entries = {
                let leaf_page: &DurablePage = leaf_handle.as_ref().unwrap_or(&root);
                let mut entries = bucket::read_all_entries(leaf_page);
                entries.insert(position, entry);
                entries
            };
            self.split_insert(atomic, &mut root, &path, leaf_handle.take(), entries)?;
        } else if let Some(leaf) = leaf_handle.take() {
            atomic.release_page(leaf)?;
        }

        let inserted = replaced_old.is_none();
        if inserted {
            let size = bucket::tree_size(&root);
            bucket::set_tree_size(&mut root, size + 1);
        }
        atomic.release_page(root)?;
        Ok(inserted)
    }

    fn remove_inner(
        &self,
        atomic: &AtomicOperationsManager,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let mut root = atomic.load_for_write(self.file_id, ROOT_PAGE)?;
        let path = self.descend(&root, key)?;
        let leaf_level = path.last().expect("descent returns at least the root");
        let leaf_is_root = leaf_level.page == ROOT_PAGE;

        let mut leaf_handle = if leaf_is_root {
            None
        } else {
            Some(atomic.load_for_write(self.file_id, leaf_level.page)?)
        };

        let found = {
            let leaf_view: &DurablePage = leaf_handle.as_ref().unwrap_or(&root);
            bucket::find(leaf_view, key).ok().map(|i| {
                let value = bucket::leaf_value(leaf_view, i);
                (i, value)
            })
        };

        let Some((index, old_value)) = found else {
            if let Some(leaf) = leaf_handle.take() {
                atomic.release_page(leaf)?;
            }
            atomic.release_page(root)?;
            return Ok(None);
        };

        // Materialize before the chain is recycled.
        let old_bytes = self.materialize_value(old_value.clone())?;
        if let LeafValue::Overflow { head, .. } = old_value {
            values::free_chain(atomic, self.file_id, &mut root, head)?;
        }

        {
            let leaf_page: &mut DurablePage = leaf_handle.as_mut().unwrap_or(&mut root);
            bucket::remove(leaf_page, index);
        }
        if let Some(leaf) = leaf_handle.take() {
            atomic.release_page(leaf)?;
        }

        // Buckets are not merged on deletion; an emptied bucket stays and
        // is refilled by later inserts.
        let size = bucket::tree_size(&root);
        bucket::set_tree_size(&mut root, size.saturating_sub(1));
        atomic.release_page(root)?;
        Ok(Some(old_bytes))
    }

    /// Insert an entry set that no longer fits its bucket, splitting up
    /// the path as far as necessary.
    fn split_insert(
        &self,
        atomic: &AtomicOperationsManager,
        root: &mut DurablePage,
        path: &[Level],
        mut leaf_handle: Option<DurablePage>,
        mut entries: Vec<BucketEntry>,
    ) -> Result<()> {
        let mut idx = path.len() - 1;

        loop {
            let level = &path[idx];
            let is_root = level.page == ROOT_PAGE;
            if entries.len() < 2 {
                return Err(StorageError::EntryTooLarge(format!(
                    "a single entry exceeds the bucket capacity in tree '{}'",
                    self.name
                )));
            }

            let leaf_bucket = matches!(entries[0], BucketEntry::Leaf { .. });
            let (split_index, separator) = choose_split(&entries);
            let left_prefix = bound_prefix(level.left_bound.as_deref(), Some(&separator));
            let right_prefix = bound_prefix(Some(&separator), level.right_bound.as_deref());
            let right_entries = entries.split_off(split_index);
            let left_entries = entries;

            if is_root {
                // Both halves move into fresh pages; the root becomes an
                // internal bucket with the single separator.
                let mut left_page = atomic.allocate_new_page(self.file_id)?;
                if !bucket::rewrite(&mut left_page, leaf_bucket, &left_prefix, &left_entries) {
                    return Err(split_overflow(&self.name));
                }
                let left_index = left_page.page_index();
                atomic.release_page(left_page)?;

                let mut right_page = atomic.allocate_new_page(self.file_id)?;
                if !bucket::rewrite(&mut right_page, leaf_bucket, &right_prefix, &right_entries) {
                    return Err(split_overflow(&self.name));
                }
                let right_index = right_page.page_index();
                atomic.release_page(right_page)?;

                let root_entry = BucketEntry::Internal {
                    key: separator,
                    left: left_index,
                    right: right_index,
                };
                if !bucket::rewrite(root, false, &[], std::slice::from_ref(&root_entry)) {
                    return Err(split_overflow(&self.name));
                }
                debug!(tree = %self.name, "root split");
                return Ok(());
            }

            // Non-root: right half moves out, the left half stays in place
            // so the parent's existing child pointer remains valid.
            let mut right_page = atomic.allocate_new_page(self.file_id)?;
            if !bucket::rewrite(&mut right_page, leaf_bucket, &right_prefix, &right_entries) {
                return Err(split_overflow(&self.name));
            }
            let right_index = right_page.page_index();
            atomic.release_page(right_page)?;

            {
                let mut current = match leaf_handle.take() {
                    Some(page) => page,
                    None => atomic.load_for_write(self.file_id, level.page)?,
                };
                if !bucket::rewrite(&mut current, leaf_bucket, &left_prefix, &left_entries) {
                    return Err(split_overflow(&self.name));
                }
                atomic.release_page(current)?;
            }

            // Insert the separator into the parent, possibly splitting it.
            let parent = &path[idx - 1];
            let slot = parent.slot;
            if parent.page == ROOT_PAGE {
                if bucket::insert_separator(root, slot, &separator, level.page, right_index) {
                    return Ok(());
                }
                entries = bucket::read_all_entries(root);
            } else {
                let mut parent_page = atomic.load_for_write(self.file_id, parent.page)?;
                let fitted = bucket::insert_separator(
                    &mut parent_page,
                    slot,
                    &separator,
                    level.page,
                    right_index,
                );
                if fitted {
                    atomic.release_page(parent_page)?;
                    return Ok(());
                }
                entries = bucket::read_all_entries(&parent_page);
                atomic.release_page(parent_page)?;
            }

            // Parent overflow: materialize its entries with the separator
            // applied and recurse one level up.
            apply_separator(&mut entries, slot, &separator, level.page, right_index);
            idx -= 1;
        }
    }

    // ------------------------------------------------------------------
    // Descent
    // ------------------------------------------------------------------

    /// Walk from the root to the leaf that owns `key`, recording per level
    /// the child slot taken and the bucket boundary keys needed for split
    /// prefix computation. The returned path ends with the leaf level.
    pub(super) fn descend(&self, root: &DurablePage, key: &[u8]) -> Result<Vec<Level>> {
        let mut path = Vec::new();
        let mut page_index = ROOT_PAGE;
        let mut left_bound: Option<Vec<u8>> = None;
        let mut right_bound: Option<Vec<u8>> = None;

        loop {
            if path.len() >= self.engine.config().max_path_length {
                return Err(StorageError::Corruption(format!(
                    "descent in tree '{}' exceeded {} levels",
                    self.name,
                    self.engine.config().max_path_length
                )));
            }

            let routed = if page_index == ROOT_PAGE {
                route(root, key)
            } else {
                let entry = self.engine.cache().load_for_read(self.file_id, page_index)?;
                route(&entry, key)
                // Pin released here, before the child is loaded.
            };

            match routed {
                Routed::Leaf => {
                    path.push(Level {
                        page: page_index,
                        slot: 0,
                        left_bound,
                        right_bound,
                    });
                    return Ok(path);
                }
                Routed::Child {
                    slot,
                    child,
                    left_key,
                    right_key,
                } => {
                    path.push(Level {
                        page: page_index,
                        slot,
                        left_bound: left_bound.clone(),
                        right_bound: right_bound.clone(),
                    });
                    left_bound = left_key.or(left_bound);
                    right_bound = right_key.or(right_bound);
                    page_index = child;
                }
            }
        }
    }

    /// Read-only lookup of the leaf entry holding `key`.
    pub(super) fn find_leaf_entry(&self, key: &[u8]) -> Result<Option<(PageIndex, usize)>> {
        let mut page_index = ROOT_PAGE;
        let mut depth = 0usize;
        loop {
            depth += 1;
            if depth > self.engine.config().max_path_length {
                return Err(StorageError::Corruption(format!(
                    "descent in tree '{}' exceeded {} levels",
                    self.name,
                    self.engine.config().max_path_length
                )));
            }
            let entry = self.engine.cache().load_for_read(self.file_id, page_index)?;
            if bucket::is_leaf(&entry) {
                return Ok(bucket::find(&entry, key).ok().map(|i| (page_index, i)));
            }
            let child = bucket::child_for(&entry, key);
            drop(entry);
            page_index = child;
        }
    }

    pub(super) fn materialize_value(&self, value: LeafValue) -> Result<Vec<u8>> {
        let encrypted = match value {
            LeafValue::Embedded(bytes) => bytes,
            LeafValue::Overflow { head, len } => {
                values::read_chain(self.engine.cache(), self.file_id, head, len)?
            }
        };
        self.encryption.decrypt(&encrypted)
    }

    // ------------------------------------------------------------------
    // Null bucket
    // ------------------------------------------------------------------

    fn null_file(&self) -> Result<FileId> {
        self.null_file_id.ok_or_else(|| {
            StorageError::InvalidKey(format!(
                "tree '{}' was created without null key support",
                self.name
            ))
        })
    }

    fn read_null_value(&self) -> Result<Option<Vec<u8>>> {
        let null_file = self.null_file()?;
        let page = self.engine.cache().load_for_read(null_file, 0)?;
        if page.get_u8(NULL_PRESENT_OFFSET) == 0 {
            return Ok(None);
        }
        let len = page.get_u32(NULL_LEN_OFFSET) as usize;
        let encrypted = page.get_bytes(NULL_VALUE_OFFSET, len);
        drop(page);
        self.encryption.decrypt(&encrypted).map(Some)
    }

    fn write_null_value(&self, value: Option<&[u8]>) -> Result<()> {
        let null_file = self.null_file()?;
        let atomic = self.engine.atomic().clone();
        let _lock = self.engine.locks().exclusive(self.file_id);
        let scope = atomic.start_atomic_operation(COMPONENT)?;
        let result = (|| {
            let mut page = atomic.load_for_write(null_file, 0)?;
            match value {
                None => page.set_u8(NULL_PRESENT_OFFSET, 0),
                Some(value) => {
                    let encrypted = self.encryption.encrypt(value)?;
                    let capacity = page.page_size() - NULL_VALUE_OFFSET;
                    if encrypted.len() > capacity {
                        return Err(StorageError::EntryTooLarge(format!(
                            "null value of {} bytes exceeds the {capacity}-byte bucket",
                            encrypted.len()
                        )));
                    }
                    page.set_u8(NULL_PRESENT_OFFSET, 1);
                    page.set_u32(NULL_LEN_OFFSET, encrypted.len() as u32);
                    page.set_bytes(NULL_VALUE_OFFSET, &encrypted);
                }
            }
            atomic.release_page(page)
        })();
        match result {
            Ok(()) => scope.commit(),
            Err(e) => {
                scope.abort()?;
                Err(e)
            }
        }
    }
}

/// Keys are normalized through the serializer seam before comparison;
/// UTF-8 strings are already byte-comparable.
pub(super) fn preprocess_key(key: &str) -> Vec<u8> {
    key.to_string().preprocess().into_bytes()
}

enum Routed {
    Leaf,
    Child {
        slot: usize,
        child: PageIndex,
        left_key: Option<Vec<u8>>,
        right_key: Option<Vec<u8>>,
    },
}

fn route(view: &impl PageView, key: &[u8]) -> Routed {
    if bucket::is_leaf(view) {
        return Routed::Leaf;
    }
    let count = bucket::entry_count(view);
    let slot = bucket::child_slot_for(view, key);
    Routed::Child {
        slot,
        child: bucket::child_at_slot(view, slot),
        left_key: if slot > 0 {
            Some(bucket::entry_key(view, slot - 1))
        } else {
            None
        },
        right_key: if slot < count {
            Some(bucket::entry_key(view, slot))
        } else {
            None
        },
    }
}

/// Shortest prefix of `b` that still sorts strictly above `a`. Requires
/// `a < b`; returns `b` itself when nothing shorter distinguishes them.
pub(super) fn min_separation_key(a: &[u8], b: &[u8]) -> Vec<u8> {
    debug_assert!(a < b);
    let mut i = 0;
    while i < a.len() && i < b.len() && a[i] == b[i] {
        i += 1;
    }
    if i < b.len() {
        b[..i + 1].to_vec()
    } else {
        b.to_vec()
    }
}

pub(super) fn common_prefix(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut i = 0;
    while i < a.len() && i < b.len() && a[i] == b[i] {
        i += 1;
    }
    a[..i].to_vec()
}

/// Common prefix of two boundary keys; an open boundary contributes
/// nothing, so the prefix collapses to empty.
fn bound_prefix(a: Option<&[u8]>, b: Option<&[u8]>) -> Vec<u8> {
    match (a, b) {
        (Some(a), Some(b)) => common_prefix(a, b),
        _ => Vec::new(),
    }
}

/// Pick the split point. Large buckets search a +/-5% window around the
/// median for the index whose separator compresses best; ties go to the
/// candidate closest to the median.
fn choose_split(entries: &[BucketEntry]) -> (usize, Vec<u8>) {
    let n = entries.len();
    let mid = (n / 2).clamp(1, n - 1);
    if n < 100 {
        return (mid, min_separation_key(entries[mid - 1].key(), entries[mid].key()));
    }

    let delta = (n / 20).max(1);
    let low = mid.saturating_sub(delta).max(1);
    let high = (mid + delta).min(n - 1);

    let mut best = mid;
    let mut best_sep = min_separation_key(entries[mid - 1].key(), entries[mid].key());
    for i in low..=high {
        let sep = min_separation_key(entries[i - 1].key(), entries[i].key());
        let better = sep.len() < best_sep.len()
            || (sep.len() == best_sep.len()
                && i.abs_diff(mid) < best.abs_diff(mid));
        if better {
            best = i;
            best_sep = sep;
        }
    }
    (best, best_sep)
}

/// In-memory mirror of `bucket::insert_separator` for a materialized
/// entry list.
fn apply_separator(
    entries: &mut Vec<BucketEntry>,
    slot: usize,
    key: &[u8],
    left: PageIndex,
    right: PageIndex,
) {
    if slot > 0 {
        if let BucketEntry::Internal { right: r, .. } = &mut entries[slot - 1] {
            *r = left;
        }
    }
    if slot < entries.len() {
        if let BucketEntry::Internal { left: l, .. } = &mut entries[slot] {
            *l = right;
        }
    }
    entries.insert(
        slot,
        BucketEntry::Internal {
            key: key.to_vec(),
            left,
            right,
        },
    );
}

fn split_overflow(name: &str) -> StorageError {
    StorageError::Corruption(format!(
        "split of tree '{name}' produced a bucket that does not fit its page"
    ))
}
