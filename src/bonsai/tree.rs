// # Bonsai B-tree
//
// Many small B-trees share one file; a tree is identified by the pointer
// of its root bucket. The file's sys bucket (page 0, offset 16) runs the
// sub-page allocator: a bump pointer over never-used regions plus a LIFO
// free list of reclaimed buckets.
//
// Because several buckets share a page, every mutation routes its page
// access through a `PageSet` that hands out one write pin per page for
// the whole operation.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::common::{BonsaiPointer, FileId, PageIndex, PAGE_DATA_OFFSET};
use crate::error::{Result, StorageError};
use crate::page::{DurablePage, PageView};
use crate::serializer::SerialType;
use crate::tx::AtomicOperationsManager;
use crate::StorageEngine;

use super::bucket::{self, BUCKET_SIZE};

const COMPONENT: &str = "bonsai-btree";

// Sys bucket fields, relative to the sys region start.
const SYS_INIT: usize = 0;
const SYS_FREE_SPACE: usize = 4;
const SYS_FREE_LIST_HEAD: usize = 16;
const SYS_FREE_LIST_LEN: usize = 28;
const SYS_TREE_COUNT: usize = 36;

const SYS_REGION: usize = PAGE_DATA_OFFSET;
const SYS_INITIALIZED: u8 = 0xB5;

/// Write-pinned pages of one mutation, at most one handle per page.
struct PageSet<'a> {
    atomic: &'a AtomicOperationsManager,
    file_id: FileId,
    pages: Vec<DurablePage>,
}

impl<'a> PageSet<'a> {
    fn new(atomic: &'a AtomicOperationsManager, file_id: FileId) -> Self {
        Self {
            atomic,
            file_id,
            pages: Vec::new(),
        }
    }

    fn page(&mut self, index: PageIndex) -> Result<&mut DurablePage> {
        if let Some(pos) = self.pages.iter().position(|p| p.page_index() == index) {
            return Ok(&mut self.pages[pos]);
        }
        let page = self.atomic.load_for_write(self.file_id, index)?;
        self.pages.push(page);
        Ok(self.pages.last_mut().expect("just pushed"))
    }

    fn adopt(&mut self, page: DurablePage) -> &mut DurablePage {
        self.pages.push(page);
        self.pages.last_mut().expect("just pushed")
    }

    fn release_all(self) -> Result<()> {
        for page in self.pages {
            self.atomic.release_page(page)?;
        }
        Ok(())
    }
}

/// Initialize the file's sys bucket if the file is fresh. Returns the id.
fn open_or_create_file(engine: &Arc<StorageEngine>, file_name: &str) -> Result<FileId> {
    if engine.exists(file_name) {
        return engine.open_file(file_name);
    }
    let file_id = engine.add_file(file_name)?;
    let atomic = engine.atomic().clone();
    atomic.register_component(COMPONENT);
    let _lock = engine.locks().exclusive(file_id);
    let scope = atomic.start_atomic_operation(COMPONENT)?;
    let result = (|| {
        let mut page = atomic.allocate_new_page(file_id)?;
        page.set_u8(SYS_REGION + SYS_INIT, SYS_INITIALIZED);
        bucket::write_pointer(
            &mut page,
            SYS_REGION + SYS_FREE_SPACE,
            BonsaiPointer::new(0, (PAGE_DATA_OFFSET + BUCKET_SIZE) as u32),
        );
        bucket::write_pointer(&mut page, SYS_REGION + SYS_FREE_LIST_HEAD, BonsaiPointer::NULL);
        page.set_u64(SYS_REGION + SYS_FREE_LIST_LEN, 0);
        page.set_u64(SYS_REGION + SYS_TREE_COUNT, 0);
        atomic.release_page(page)
    })();
    match result {
        Ok(()) => scope.commit()?,
        Err(e) => {
            scope.abort()?;
            return Err(e);
        }
    }
    Ok(file_id)
}

/// Pop a reclaimed bucket off the free list, carve the next region out of
/// the tail page, or extend the file by a page.
fn allocate_bucket(ps: &mut PageSet<'_>, page_size: usize) -> Result<BonsaiPointer> {
    let head = {
        let sys = ps.page(0)?;
        bucket::read_pointer(sys, SYS_REGION + SYS_FREE_LIST_HEAD)
    };

    if !head.is_null() {
        let next = {
            let page = ps.page(head.page_index)?;
            bucket::free_list_next(page, head.page_offset as usize)
        };
        let sys = ps.page(0)?;
        bucket::write_pointer(sys, SYS_REGION + SYS_FREE_LIST_HEAD, next);
        let len = sys.get_u64(SYS_REGION + SYS_FREE_LIST_LEN);
        sys.set_u64(SYS_REGION + SYS_FREE_LIST_LEN, len.saturating_sub(1));
        return Ok(head);
    }

    let free_space = {
        let sys = ps.page(0)?;
        bucket::read_pointer(sys, SYS_REGION + SYS_FREE_SPACE)
    };

    let pointer = if free_space.page_offset as usize + BUCKET_SIZE <= page_size {
        free_space
    } else {
        let page = ps.atomic.allocate_new_page(ps.file_id)?;
        let index = page.page_index();
        ps.adopt(page);
        BonsaiPointer::new(index, PAGE_DATA_OFFSET as u32)
    };

    let next = BonsaiPointer::new(pointer.page_index, pointer.page_offset + BUCKET_SIZE as u32);
    let sys = ps.page(0)?;
    bucket::write_pointer(sys, SYS_REGION + SYS_FREE_SPACE, next);
    Ok(pointer)
}

/// Push a bucket onto the free list and mark it deleted.
fn free_bucket(ps: &mut PageSet<'_>, pointer: BonsaiPointer) -> Result<()> {
    let head = {
        let sys = ps.page(0)?;
        bucket::read_pointer(sys, SYS_REGION + SYS_FREE_LIST_HEAD)
    };
    {
        let page = ps.page(pointer.page_index)?;
        let region = pointer.page_offset as usize;
        bucket::mark_deleted(page, region);
        bucket::set_free_list_next(page, region, head);
    }
    let sys = ps.page(0)?;
    bucket::write_pointer(sys, SYS_REGION + SYS_FREE_LIST_HEAD, pointer);
    let len = sys.get_u64(SYS_REGION + SYS_FREE_LIST_LEN);
    sys.set_u64(SYS_REGION + SYS_FREE_LIST_LEN, len + 1);
    Ok(())
}

/// A single bonsai tree over typed keys and values.
pub struct BonsaiTree<K, V> {
    engine: Arc<StorageEngine>,
    file_id: FileId,
    root: BonsaiPointer,
    rw: RwLock<()>,
    _kv: PhantomData<fn() -> (K, V)>,
}

impl<K, V> BonsaiTree<K, V>
where
    K: SerialType + Ord + Clone,
    V: SerialType + Clone,
{
    /// Create a new tree inside `file_name` (creating the file and its sys
    /// bucket on first use). The root pointer identifies the tree and must
    /// be kept by the caller to `load` it later.
    pub fn create(engine: Arc<StorageEngine>, file_name: &str) -> Result<Self> {
        let file_id = open_or_create_file(&engine, file_name)?;
        let atomic = engine.atomic().clone();
        atomic.register_component(COMPONENT);
        let _lock = engine.locks().exclusive(file_id);
        let scope = atomic.start_atomic_operation(COMPONENT)?;
        let page_size = engine.config().page_size;

        let root = {
            let mut ps = PageSet::new(&atomic, file_id);
            let result = (|| {
                let root = allocate_bucket(&mut ps, page_size)?;
                let page = ps.page(root.page_index)?;
                let region = root.page_offset as usize;
                bucket::init(page, region, true, K::SERIALIZER_ID, V::SERIALIZER_ID);
                bucket::set_tree_size(page, region, 0);
                let sys = ps.page(0)?;
                let count = sys.get_u64(SYS_REGION + SYS_TREE_COUNT);
                sys.set_u64(SYS_REGION + SYS_TREE_COUNT, count + 1);
                Ok(root)
            })();
            match result {
                Ok(root) => {
                    ps.release_all()?;
                    root
                }
                Err(e) => {
                    ps.release_all()?;
                    scope.abort()?;
                    return Err(e);
                }
            }
        };
        scope.commit()?;
        debug!(file = file_name, root = %root, "bonsai tree created");

        Ok(Self {
            engine,
            file_id,
            root,
            rw: RwLock::new(()),
            _kv: PhantomData,
        })
    }

    /// Load an existing tree by its root pointer, validating that the
    /// serializers recorded in the bucket match this instantiation.
    pub fn load(engine: Arc<StorageEngine>, file_name: &str, root: BonsaiPointer) -> Result<Self> {
        let file_id = engine.open_file(file_name)?;
        let page = engine.cache().load_for_read(file_id, root.page_index)?;
        let region = root.page_offset as usize;
        let key_ser = bucket::key_serializer_id(&page, region);
        let value_ser = bucket::value_serializer_id(&page, region);
        drop(page);

        engine.serializers().validate(key_ser)?;
        engine.serializers().validate(value_ser)?;
        if key_ser != K::SERIALIZER_ID || value_ser != V::SERIALIZER_ID {
            return Err(StorageError::SerializerMismatch(format!(
                "tree at {root} was written with serializers ({key_ser}, {value_ser})"
            )));
        }
        Ok(Self {
            engine,
            file_id,
            root,
            rw: RwLock::new(()),
            _kv: PhantomData,
        })
    }

    pub fn root_pointer(&self) -> BonsaiPointer {
        self.root
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn size(&self) -> Result<u64> {
        let _guard = self.rw.read();
        let _lock = self.engine.locks().shared(self.file_id);
        let page = self
            .engine
            .cache()
            .load_for_read(self.file_id, self.root.page_index)?;
        Ok(bucket::tree_size(&page, self.root.page_offset as usize))
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let _guard = self.rw.read();
        let _lock = self.engine.locks().shared(self.file_id);
        let Some((leaf, index)) = self.find_leaf(key)? else {
            return Ok(None);
        };
        let page = self
            .engine
            .cache()
            .load_for_read(self.file_id, leaf.page_index)?;
        Ok(Some(bucket::leaf_value_at::<K, V>(
            &page,
            leaf.page_offset as usize,
            index,
        )))
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        let _guard = self.rw.read();
        let _lock = self.engine.locks().shared(self.file_id);
        Ok(self.find_leaf(key)?.is_some())
    }

    /// Insert or replace. Returns true when the key was new.
    pub fn put(&self, key: &K, value: &V) -> Result<bool> {
        let _guard = self.rw.write();
        let atomic = self.engine.atomic().clone();
        let _lock = self.engine.locks().exclusive(self.file_id);
        let scope = atomic.start_atomic_operation(COMPONENT)?;
        let mut ps = PageSet::new(&atomic, self.file_id);
        let result = self.put_inner(&mut ps, key, value);
        let release = ps.release_all();
        match (result, release) {
            (Ok(inserted), Ok(())) => {
                scope.commit()?;
                Ok(inserted)
            }
            (Err(e), _) | (_, Err(e)) => {
                scope.abort()?;
                Err(e)
            }
        }
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let _guard = self.rw.write();
        let atomic = self.engine.atomic().clone();
        let _lock = self.engine.locks().exclusive(self.file_id);
        let scope = atomic.start_atomic_operation(COMPONENT)?;
        let mut ps = PageSet::new(&atomic, self.file_id);
        let result = self.remove_inner(&mut ps, key);
        let release = ps.release_all();
        match (result, release) {
            (Ok(removed), Ok(())) => {
                scope.commit()?;
                Ok(removed)
            }
            (Err(e), _) | (_, Err(e)) => {
                scope.abort()?;
                Err(e)
            }
        }
    }

    /// Drop all entries but keep the tree alive: interior buckets go to
    /// the free list and the root reverts to an empty leaf.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.rw.write();
        self.deallocate(false)
    }

    /// Destroy the tree: every bucket, the root included, goes to the
    /// free list.
    pub fn delete(self) -> Result<()> {
        let _guard = self.rw.write();
        self.deallocate(true)
    }

    /// Flush the engine caches; the tree itself holds no volatile state.
    pub fn close(&self) -> Result<()> {
        self.engine.cache().flush_file(self.file_id)
    }

    pub fn first_key(&self) -> Result<Option<K>> {
        let _guard = self.rw.read();
        let _lock = self.engine.locks().shared(self.file_id);
        let mut current = self.edge_leaf(false)?;
        // Deletions can leave empty leaves; walk the sibling chain.
        loop {
            let page = self
                .engine
                .cache()
                .load_for_read(self.file_id, current.page_index)?;
            let region = current.page_offset as usize;
            if bucket::entry_count(&page, region) > 0 {
                return Ok(Some(bucket::key_at(&page, region, 0)));
            }
            let next = bucket::right_sibling(&page, region);
            drop(page);
            if next.is_null() {
                return Ok(None);
            }
            current = next;
        }
    }

    pub fn last_key(&self) -> Result<Option<K>> {
        let _guard = self.rw.read();
        let _lock = self.engine.locks().shared(self.file_id);
        let mut current = self.edge_leaf(true)?;
        loop {
            let page = self
                .engine
                .cache()
                .load_for_read(self.file_id, current.page_index)?;
            let region = current.page_offset as usize;
            let count = bucket::entry_count(&page, region);
            if count > 0 {
                return Ok(Some(bucket::key_at(&page, region, count - 1)));
            }
            let prev = bucket::left_sibling(&page, region);
            drop(page);
            if prev.is_null() {
                return Ok(None);
            }
            current = prev;
        }
    }

    /// Visit entries with `from <= key <= to` (bounds adjustable) in key
    /// order; the callback returns false to stop early.
    pub fn values_between(
        &self,
        from: &K,
        from_inclusive: bool,
        to: &K,
        to_inclusive: bool,
        mut visitor: impl FnMut(&K, &V) -> bool,
    ) -> Result<()> {
        self.scan(Some((from, from_inclusive)), Some((to, to_inclusive)), &mut visitor)
    }

    /// Visit entries below `to`.
    pub fn values_minor(
        &self,
        to: &K,
        inclusive: bool,
        mut visitor: impl FnMut(&K, &V) -> bool,
    ) -> Result<()> {
        self.scan(None, Some((to, inclusive)), &mut visitor)
    }

    /// Visit entries above `from`.
    pub fn values_major(
        &self,
        from: &K,
        inclusive: bool,
        mut visitor: impl FnMut(&K, &V) -> bool,
    ) -> Result<()> {
        self.scan(Some((from, inclusive)), None, &mut visitor)
    }

    // ------------------------------------------------------------------

    fn scan(
        &self,
        from: Option<(&K, bool)>,
        to: Option<(&K, bool)>,
        visitor: &mut impl FnMut(&K, &V) -> bool,
    ) -> Result<()> {
        let _guard = self.rw.read();
        let _lock = self.engine.locks().shared(self.file_id);

        let mut current = match from {
            None => self.edge_leaf(false)?,
            Some((key, _)) => self.leaf_for(key)?,
        };

        loop {
            let page = self
                .engine
                .cache()
                .load_for_read(self.file_id, current.page_index)?;
            let region = current.page_offset as usize;
            let count = bucket::entry_count(&page, region);
            for i in 0..count {
                let key: K = bucket::key_at(&page, region, i);
                if let Some((from, inclusive)) = from {
                    if key < *from || (!inclusive && key == *from) {
                        continue;
                    }
                }
                if let Some((to, inclusive)) = to {
                    if key > *to || (!inclusive && key == *to) {
                        return Ok(());
                    }
                }
                let value = bucket::leaf_value_at::<K, V>(&page, region, i);
                if !visitor(&key, &value) {
                    return Ok(());
                }
            }
            let next = bucket::right_sibling(&page, region);
            drop(page);
            if next.is_null() {
                return Ok(());
            }
            current = next;
        }
    }

    /// Leftmost or rightmost leaf of the tree.
    fn edge_leaf(&self, rightmost: bool) -> Result<BonsaiPointer> {
        let mut current = self.root;
        let mut depth = 0usize;
        loop {
            self.check_depth(&mut depth)?;
            let page = self
                .engine
                .cache()
                .load_for_read(self.file_id, current.page_index)?;
            let region = current.page_offset as usize;
            if bucket::is_leaf(&page, region) {
                return Ok(current);
            }
            let count = bucket::entry_count(&page, region);
            let slot = if rightmost { count } else { 0 };
            let child = bucket::child_at_slot::<K>(&page, region, slot);
            drop(page);
            current = child;
        }
    }

    fn leaf_for(&self, key: &K) -> Result<BonsaiPointer> {
        let mut current = self.root;
        let mut depth = 0usize;
        loop {
            self.check_depth(&mut depth)?;
            let page = self
                .engine
                .cache()
                .load_for_read(self.file_id, current.page_index)?;
            let region = current.page_offset as usize;
            if bucket::is_leaf(&page, region) {
                return Ok(current);
            }
            let slot = bucket::child_slot_for(&page, region, key);
            let child = bucket::child_at_slot::<K>(&page, region, slot);
            drop(page);
            current = child;
        }
    }

    fn find_leaf(&self, key: &K) -> Result<Option<(BonsaiPointer, usize)>> {
        let leaf = self.leaf_for(key)?;
        let page = self
            .engine
            .cache()
            .load_for_read(self.file_id, leaf.page_index)?;
        Ok(bucket::find(&page, leaf.page_offset as usize, key)
            .ok()
            .map(|i| (leaf, i)))
    }

    fn check_depth(&self, depth: &mut usize) -> Result<()> {
        *depth += 1;
        if *depth > self.engine.config().max_path_length {
            return Err(StorageError::Corruption(format!(
                "bonsai descent at {} exceeded {} levels",
                self.root,
                self.engine.config().max_path_length
            )));
        }
        Ok(())
    }

    fn put_inner(&self, ps: &mut PageSet<'_>, key: &K, value: &V) -> Result<bool> {
        let mut path: Vec<(BonsaiPointer, usize)> = Vec::new();
        let mut current = self.root;
        let mut depth = 0usize;
        loop {
            self.check_depth(&mut depth)?;
            let page = ps.page(current.page_index)?;
            let region = current.page_offset as usize;
            if bucket::is_leaf(page, region) {
                break;
            }
            let slot = bucket::child_slot_for(page, region, key);
            let child = bucket::child_at_slot::<K>(page, region, slot);
            path.push((current, slot));
            current = child;
        }

        let region = current.page_offset as usize;
        let (index, replaced) = {
            let page = ps.page(current.page_index)?;
            match bucket::find(page, region, key) {
                Ok(i) => {
                    let size = bucket::leaf_payload_size::<K, V>(page, region, i);
                    bucket::remove_entry(page, region, i, size);
                    (i, true)
                }
                Err(i) => (i, false),
            }
        };

        let fitted = {
            let page = ps.page(current.page_index)?;
            bucket::insert_leaf(page, region, index, key, value)
        };
        if !fitted {
            let mut entries = {
                let page = ps.page(current.page_index)?;
                bucket::read_leaf_entries::<K, V>(page, region)
            };
            entries.insert(index, (key.clone(), value.clone()));
            self.split_leaf(ps, current, &path, entries)?;
        }

        if !replaced {
            let root_region = self.root.page_offset as usize;
            let page = ps.page(self.root.page_index)?;
            let size = bucket::tree_size(page, root_region);
            bucket::set_tree_size(page, root_region, size + 1);
        }
        Ok(!replaced)
    }

    fn remove_inner(&self, ps: &mut PageSet<'_>, key: &K) -> Result<Option<V>> {
        let mut current = self.root;
        let mut depth = 0usize;
        loop {
            self.check_depth(&mut depth)?;
            let page = ps.page(current.page_index)?;
            let region = current.page_offset as usize;
            if bucket::is_leaf(page, region) {
                break;
            }
            let slot = bucket::child_slot_for(page, region, key);
            current = bucket::child_at_slot::<K>(page, region, slot);
        }

        let region = current.page_offset as usize;
        let removed = {
            let page = ps.page(current.page_index)?;
            match bucket::find(page, region, key) {
                Err(_) => None,
                Ok(i) => {
                    let value = bucket::leaf_value_at::<K, V>(page, region, i);
                    let size = bucket::leaf_payload_size::<K, V>(page, region, i);
                    bucket::remove_entry(page, region, i, size);
                    Some(value)
                }
            }
        };

        if removed.is_some() {
            let root_region = self.root.page_offset as usize;
            let page = ps.page(self.root.page_index)?;
            let size = bucket::tree_size(page, root_region);
            bucket::set_tree_size(page, root_region, size.saturating_sub(1));
        }
        Ok(removed)
    }

    /// Split a leaf that can no longer hold its entries, then propagate
    /// separators upward as needed.
    fn split_leaf(
        &self,
        ps: &mut PageSet<'_>,
        leaf: BonsaiPointer,
        path: &[(BonsaiPointer, usize)],
        entries: Vec<(K, V)>,
    ) -> Result<()> {
        let page_size = self.engine.config().page_size;
        if entries.len() < 2 {
            return Err(StorageError::EntryTooLarge(
                "a single entry exceeds the bonsai bucket capacity".into(),
            ));
        }
        let mid = entries.len() / 2;
        let separator = entries[mid].0.clone();
        let right_entries = entries[mid..].to_vec();
        let left_entries = entries[..mid].to_vec();

        if leaf == self.root {
            // The root pointer must stay stable: both halves move out.
            let left_ptr = allocate_bucket(ps, page_size)?;
            let right_ptr = allocate_bucket(ps, page_size)?;

            {
                let page = ps.page(left_ptr.page_index)?;
                let region = left_ptr.page_offset as usize;
                bucket::init(page, region, true, K::SERIALIZER_ID, V::SERIALIZER_ID);
                if !bucket::rewrite_leaf(page, region, &left_entries, BonsaiPointer::NULL, right_ptr)
                {
                    return Err(split_overflow());
                }
            }
            {
                let page = ps.page(right_ptr.page_index)?;
                let region = right_ptr.page_offset as usize;
                bucket::init(page, region, true, K::SERIALIZER_ID, V::SERIALIZER_ID);
                if !bucket::rewrite_leaf(page, region, &right_entries, left_ptr, BonsaiPointer::NULL)
                {
                    return Err(split_overflow());
                }
            }
            let page = ps.page(self.root.page_index)?;
            let region = self.root.page_offset as usize;
            if !bucket::rewrite_internal(
                page,
                region,
                &[(separator, left_ptr, right_ptr)],
            ) {
                return Err(split_overflow());
            }
            debug!(root = %self.root, "bonsai root split");
            return Ok(());
        }

        // Non-root leaf: the left half stays in place, the right half moves
        // into a fresh bucket spliced into the sibling chain.
        let right_ptr = allocate_bucket(ps, page_size)?;
        let (old_left_sibling, old_right_sibling) = {
            let page = ps.page(leaf.page_index)?;
            let region = leaf.page_offset as usize;
            (
                bucket::left_sibling(page, region),
                bucket::right_sibling(page, region),
            )
        };

        {
            let page = ps.page(right_ptr.page_index)?;
            let region = right_ptr.page_offset as usize;
            bucket::init(page, region, true, K::SERIALIZER_ID, V::SERIALIZER_ID);
            if !bucket::rewrite_leaf(page, region, &right_entries, leaf, old_right_sibling) {
                return Err(split_overflow());
            }
        }
        {
            let page = ps.page(leaf.page_index)?;
            let region = leaf.page_offset as usize;
            if !bucket::rewrite_leaf(page, region, &left_entries, old_left_sibling, right_ptr) {
                return Err(split_overflow());
            }
        }
        if !old_right_sibling.is_null() {
            let page = ps.page(old_right_sibling.page_index)?;
            bucket::set_left_sibling(page, old_right_sibling.page_offset as usize, right_ptr);
        }

        self.insert_separator_upward(ps, path, separator, leaf, right_ptr)
    }

    /// Insert a separator into the parent chain, splitting internal
    /// buckets on the way up when they overflow.
    fn insert_separator_upward(
        &self,
        ps: &mut PageSet<'_>,
        path: &[(BonsaiPointer, usize)],
        mut separator: K,
        mut left: BonsaiPointer,
        mut right: BonsaiPointer,
    ) -> Result<()> {
        let page_size = self.engine.config().page_size;
        let mut level = path.len();

        loop {
            if level == 0 {
                // The root itself split; handled by the caller for leaves
                // and below for internal buckets.
                unreachable!("separator propagation starts below the root");
            }
            level -= 1;
            let (parent, slot) = path[level].clone();

            let fitted = {
                let page = ps.page(parent.page_index)?;
                bucket::insert_separator(
                    page,
                    parent.page_offset as usize,
                    slot,
                    &separator,
                    left,
                    right,
                )
            };
            if fitted {
                return Ok(());
            }

            // Materialize, apply, split.
            let mut entries = {
                let page = ps.page(parent.page_index)?;
                bucket::read_internal_entries::<K>(page, parent.page_offset as usize)
            };
            if slot > 0 {
                entries[slot - 1].2 = left;
            }
            if slot < entries.len() {
                entries[slot].1 = right;
            }
            entries.insert(slot, (separator.clone(), left, right));

            let mid = entries.len() / 2;
            let parent_separator = entries[mid].0.clone();
            let right_entries = entries[mid..].to_vec();
            let left_entries = entries[..mid].to_vec();

            if parent == self.root {
                let left_ptr = allocate_bucket(ps, page_size)?;
                let right_ptr = allocate_bucket(ps, page_size)?;
                {
                    let page = ps.page(left_ptr.page_index)?;
                    let region = left_ptr.page_offset as usize;
                    bucket::init(page, region, false, K::SERIALIZER_ID, V::SERIALIZER_ID);
                    if !bucket::rewrite_internal(page, region, &left_entries) {
                        return Err(split_overflow());
                    }
                }
                {
                    let page = ps.page(right_ptr.page_index)?;
                    let region = right_ptr.page_offset as usize;
                    bucket::init(page, region, false, K::SERIALIZER_ID, V::SERIALIZER_ID);
                    if !bucket::rewrite_internal(page, region, &right_entries) {
                        return Err(split_overflow());
                    }
                }
                let page = ps.page(self.root.page_index)?;
                let region = self.root.page_offset as usize;
                if !bucket::rewrite_internal(
                    page,
                    region,
                    &[(parent_separator, left_ptr, right_ptr)],
                ) {
                    return Err(split_overflow());
                }
                return Ok(());
            }

            let right_ptr = allocate_bucket(ps, page_size)?;
            {
                let page = ps.page(right_ptr.page_index)?;
                let region = right_ptr.page_offset as usize;
                bucket::init(page, region, false, K::SERIALIZER_ID, V::SERIALIZER_ID);
                if !bucket::rewrite_internal(page, region, &right_entries) {
                    return Err(split_overflow());
                }
            }
            {
                let page = ps.page(parent.page_index)?;
                if !bucket::rewrite_internal(page, parent.page_offset as usize, &left_entries) {
                    return Err(split_overflow());
                }
            }

            separator = parent_separator;
            left = parent;
            right = right_ptr;
        }
    }

    /// Walk the tree depth-first, free every bucket, and either retire the
    /// root (`delete`) or reset it to an empty leaf (`clear`).
    fn deallocate(&self, delete_root: bool) -> Result<()> {
        let atomic = self.engine.atomic().clone();
        let _lock = self.engine.locks().exclusive(self.file_id);
        let scope = atomic.start_atomic_operation(COMPONENT)?;
        let mut ps = PageSet::new(&atomic, self.file_id);

        let result = (|| {
            // Collect child pointers depth-first into a queue.
            let mut queue = vec![self.root];
            let mut to_free = Vec::new();
            while let Some(pointer) = queue.pop() {
                let page = ps.page(pointer.page_index)?;
                let region = pointer.page_offset as usize;
                if !bucket::is_leaf(page, region) {
                    let count = bucket::entry_count(page, region);
                    for slot in 0..=count {
                        queue.push(bucket::child_at_slot::<K>(page, region, slot));
                    }
                }
                if pointer != self.root {
                    to_free.push(pointer);
                }
            }

            for pointer in to_free {
                free_bucket(&mut ps, pointer)?;
            }

            if delete_root {
                free_bucket(&mut ps, self.root)?;
                let sys = ps.page(0)?;
                let count = sys.get_u64(SYS_REGION + SYS_TREE_COUNT);
                sys.set_u64(SYS_REGION + SYS_TREE_COUNT, count.saturating_sub(1));
            } else {
                let page = ps.page(self.root.page_index)?;
                let region = self.root.page_offset as usize;
                bucket::init(page, region, true, K::SERIALIZER_ID, V::SERIALIZER_ID);
                bucket::set_tree_size(page, region, 0);
            }
            Ok(())
        })();

        let release = ps.release_all();
        match result.and(release) {
            Ok(()) => scope.commit(),
            Err(e) => {
                scope.abort()?;
                Err(e)
            }
        }
    }
}

/// Free-list statistics of a bonsai file's sys bucket.
pub fn sys_free_list_length(engine: &Arc<StorageEngine>, file_name: &str) -> Result<u64> {
    let file_id = engine.open_file(file_name)?;
    let page = engine.cache().load_for_read(file_id, 0)?;
    Ok(page.get_u64(SYS_REGION + SYS_FREE_LIST_LEN))
}

fn split_overflow() -> StorageError {
    StorageError::Corruption("bonsai split produced a bucket that does not fit its region".into())
}
