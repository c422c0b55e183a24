// # Cluster Position Map
//
// Page-organized array mapping logical record positions to physical
// (page, record position) pairs. One bucket per page:
//
// ```text
// offset 16  u32  entry count in this bucket
// offset 20  u64  next-page link (chained when a bucket fills)
// offset 28       entries, 13 bytes each: flag u8, page u64, position u32
// ```
//
// Entry flags move `ALLOCATED -> FILLED -> REMOVED -> FILLED` (resurrect);
// every transition is journalled and undo-exact.

use std::sync::Arc;

use crate::common::{PageIndex, PagePosition, INVALID_PAGE_INDEX, PAGE_DATA_OFFSET};
use crate::error::{Result, StorageError};
use crate::page::{DurablePage, PageView};
use crate::StorageEngine;

const SIZE_OFFSET: usize = PAGE_DATA_OFFSET;
const NEXT_PAGE_OFFSET: usize = SIZE_OFFSET + 4;
const POSITIONS_OFFSET: usize = NEXT_PAGE_OFFSET + 8;
const ENTRY_SIZE: usize = 1 + 8 + 4;

const COMPONENT: &str = "cluster-position-map";

/// Allocation state of one logical position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionState {
    /// Out of range: never added or allocated.
    NotExistent,
    Removed,
    Filled,
    Allocated,
}

const FLAG_NOT_EXISTENT: u8 = 0;
const FLAG_REMOVED: u8 = 1;
const FLAG_FILLED: u8 = 2;
const FLAG_ALLOCATED: u8 = 3;

impl PositionState {
    fn from_flag(flag: u8) -> Self {
        match flag {
            FLAG_REMOVED => PositionState::Removed,
            FLAG_FILLED => PositionState::Filled,
            FLAG_ALLOCATED => PositionState::Allocated,
            _ => PositionState::NotExistent,
        }
    }
}

pub struct ClusterPositionMap {
    engine: Arc<StorageEngine>,
    file_id: crate::common::FileId,
    entries_per_page: u64,
}

impl ClusterPositionMap {
    /// Create the map file. The first bucket page is allocated eagerly so
    /// `is_full` and `size` have a bucket to look at.
    pub fn create(engine: Arc<StorageEngine>, name: &str) -> Result<Self> {
        let file_id = engine.add_file(name)?;
        let map = Self::with_file(engine, file_id);

        let atomic = map.engine.atomic().clone();
        atomic.register_component(COMPONENT);
        let scope = atomic.start_atomic_operation(COMPONENT)?;
        let mut page = atomic.allocate_new_page(file_id)?;
        page.set_u64(NEXT_PAGE_OFFSET, INVALID_PAGE_INDEX);
        atomic.release_page(page)?;
        scope.commit()?;
        Ok(map)
    }

    pub fn open(engine: Arc<StorageEngine>, name: &str) -> Result<Self> {
        let file_id = engine.open_file(name)?;
        Ok(Self::with_file(engine, file_id))
    }

    fn with_file(engine: Arc<StorageEngine>, file_id: crate::common::FileId) -> Self {
        let entries_per_page = ((engine.config().page_size - POSITIONS_OFFSET) / ENTRY_SIZE) as u64;
        Self {
            engine,
            file_id,
            entries_per_page,
        }
    }

    /// Maximum entries a single bucket holds at this page size.
    pub fn entries_per_page(&self) -> u64 {
        self.entries_per_page
    }

    /// Append a `FILLED` entry; returns its logical position.
    pub fn add(&self, entry: PagePosition) -> Result<u64> {
        self.append(FLAG_FILLED, entry)
    }

    /// Append an `ALLOCATED` placeholder with sentinel coordinates.
    pub fn allocate(&self) -> Result<u64> {
        self.append(FLAG_ALLOCATED, PagePosition::new(INVALID_PAGE_INDEX, u32::MAX))
    }

    fn append(&self, flag: u8, entry: PagePosition) -> Result<u64> {
        let _lock = self.engine.locks().exclusive(self.file_id);
        let atomic = self.engine.atomic().clone();
        let scope = atomic.start_atomic_operation(COMPONENT)?;
        let result = self.append_inner(flag, entry);
        match result {
            Ok(index) => {
                scope.commit()?;
                Ok(index)
            }
            Err(e) => {
                scope.abort()?;
                Err(e)
            }
        }
    }

    fn append_inner(&self, flag: u8, entry: PagePosition) -> Result<u64> {
        let atomic = self.engine.atomic();
        let pages = self.engine.files().filled_up_to(self.file_id)?;
        debug_assert!(pages > 0, "position map file has no bucket page");
        let last_page = pages - 1;

        let mut page = atomic.load_for_write(self.file_id, last_page)?;
        let local = page.get_u32(SIZE_OFFSET) as u64;

        let (mut page, bucket_page, local) = if local >= self.entries_per_page {
            // Bucket full: chain a fresh one through the next-page link.
            let mut fresh = atomic.allocate_new_page(self.file_id)?;
            fresh.set_u64(NEXT_PAGE_OFFSET, INVALID_PAGE_INDEX);
            let fresh_index = fresh.page_index();
            page.set_u64(NEXT_PAGE_OFFSET, fresh_index);
            atomic.release_page(page)?;
            (fresh, fresh_index, 0u64)
        } else {
            let index = page.page_index();
            (page, index, local)
        };

        let offset = POSITIONS_OFFSET + local as usize * ENTRY_SIZE;
        page.set_u8(offset, flag);
        page.set_u64(offset + 1, entry.page_index);
        page.set_u32(offset + 9, entry.record_position);
        page.set_u32(SIZE_OFFSET, local as u32 + 1);
        atomic.release_page(page)?;

        Ok(bucket_page * self.entries_per_page + local)
    }

    /// Fill a position. Legal on `ALLOCATED` (becomes `FILLED`) and on
    /// `FILLED` (overwrite); `REMOVED` and out-of-range are errors.
    pub fn set(&self, index: u64, entry: PagePosition) -> Result<()> {
        self.mutate_entry(index, |page, offset| {
            match page.get_u8(offset) {
                FLAG_ALLOCATED | FLAG_FILLED => {}
                FLAG_REMOVED => {
                    return Err(StorageError::ContractViolation(format!(
                        "set on removed position {index}"
                    )))
                }
                _ => {
                    return Err(StorageError::ContractViolation(format!(
                        "set on non-existent position {index}"
                    )))
                }
            }
            page.set_u8(offset, FLAG_FILLED);
            page.set_u64(offset + 1, entry.page_index);
            page.set_u32(offset + 9, entry.record_position);
            Ok(())
        })
    }

    /// Tombstone a `FILLED` position. Any other state, including an
    /// out-of-range index, is a no-op.
    pub fn remove(&self, index: u64) -> Result<()> {
        let _lock = self.engine.locks().exclusive(self.file_id);
        let atomic = self.engine.atomic().clone();
        let scope = atomic.start_atomic_operation(COMPONENT)?;
        let result = (|| {
            let Ok((page_index, offset)) = self.locate(index) else {
                return Ok(());
            };
            let mut page = atomic.load_for_write(self.file_id, page_index)?;
            let local = (index % self.entries_per_page) as u32;
            if local < page.get_u32(SIZE_OFFSET) && page.get_u8(offset) == FLAG_FILLED {
                page.set_u8(offset, FLAG_REMOVED);
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

    /// Bring a `REMOVED` position back with fresh coordinates.
    pub fn resurrect(&self, index: u64, entry: PagePosition) -> Result<()> {
        self.mutate_entry(index, |page, offset| {
            if page.get_u8(offset) != FLAG_REMOVED {
                return Err(StorageError::ContractViolation(format!(
                    "resurrect on a position that is not removed: {index}"
                )));
            }
            page.set_u8(offset, FLAG_FILLED);
            page.set_u64(offset + 1, entry.page_index);
            page.set_u32(offset + 9, entry.record_position);
            Ok(())
        })
    }

    fn mutate_entry(
        &self,
        index: u64,
        f: impl FnOnce(&mut DurablePage, usize) -> Result<()>,
    ) -> Result<()> {
        let _lock = self.engine.locks().exclusive(self.file_id);
        let atomic = self.engine.atomic().clone();
        let scope = atomic.start_atomic_operation(COMPONENT)?;
        let result = (|| {
            let (page_index, offset) = self.locate(index)?;
            let mut page = atomic.load_for_write(self.file_id, page_index)?;
            let local = (index % self.entries_per_page) as u32;
            if local >= page.get_u32(SIZE_OFFSET) {
                return Err(StorageError::ContractViolation(format!(
                    "position {index} out of range"
                )));
            }
            f(&mut page, offset)?;
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

    /// Coordinates of a filled position; `None` for allocated, removed or
    /// out-of-range positions.
    pub fn get(&self, index: u64) -> Result<Option<PagePosition>> {
        let _lock = self.engine.locks().shared(self.file_id);
        let Some((page, offset)) = self.read_entry(index)? else {
            return Ok(None);
        };
        if page.get_u8(offset) != FLAG_FILLED {
            return Ok(None);
        }
        Ok(Some(PagePosition::new(
            page.get_u64(offset + 1),
            page.get_u32(offset + 9),
        )))
    }

    pub fn exists(&self, index: u64) -> Result<bool> {
        Ok(self.status(index)? == PositionState::Filled)
    }

    pub fn status(&self, index: u64) -> Result<PositionState> {
        let _lock = self.engine.locks().shared(self.file_id);
        let Some((page, offset)) = self.read_entry(index)? else {
            return Ok(PositionState::NotExistent);
        };
        Ok(PositionState::from_flag(page.get_u8(offset)))
    }

    /// True when the newest bucket has no room left.
    pub fn is_full(&self) -> Result<bool> {
        let _lock = self.engine.locks().shared(self.file_id);
        let pages = self.engine.files().filled_up_to(self.file_id)?;
        let page = self.engine.cache().load_for_read(self.file_id, pages - 1)?;
        Ok(page.get_u32(SIZE_OFFSET) as u64 >= self.entries_per_page)
    }

    /// Total number of positions ever appended (including removed ones).
    pub fn size(&self) -> Result<u64> {
        let _lock = self.engine.locks().shared(self.file_id);
        let pages = self.engine.files().filled_up_to(self.file_id)?;
        let last = self.engine.cache().load_for_read(self.file_id, pages - 1)?;
        Ok((pages - 1) * self.entries_per_page + last.get_u32(SIZE_OFFSET) as u64)
    }

    fn locate(&self, index: u64) -> Result<(PageIndex, usize)> {
        let page_index = index / self.entries_per_page;
        let pages = self.engine.files().filled_up_to(self.file_id)?;
        if page_index >= pages {
            return Err(StorageError::ContractViolation(format!(
                "position {index} out of range"
            )));
        }
        let local = (index % self.entries_per_page) as usize;
        Ok((page_index, POSITIONS_OFFSET + local * ENTRY_SIZE))
    }

    fn read_entry(&self, index: u64) -> Result<Option<(crate::buffer::CacheEntry, usize)>> {
        let page_index = index / self.entries_per_page;
        let pages = self.engine.files().filled_up_to(self.file_id)?;
        if page_index >= pages {
            return Ok(None);
        }
        let page = self.engine.cache().load_for_read(self.file_id, page_index)?;
        let local = (index % self.entries_per_page) as u32;
        if local >= page.get_u32(SIZE_OFFSET) {
            return Ok(None);
        }
        let offset = POSITIONS_OFFSET + local as usize * ENTRY_SIZE;
        Ok(Some((page, offset)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageConfig;
    use tempfile::TempDir;

    fn map(dir: &TempDir) -> ClusterPositionMap {
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            page_size: 4096,
            cache_pages: 64,
            wal_segment_size: 1 << 20,
            ..StorageConfig::default()
        };
        let engine = StorageEngine::open(config).unwrap();
        ClusterPositionMap::create(engine, "positions.cpm").unwrap()
    }

    #[test]
    fn test_allocate_then_set() {
        let dir = TempDir::new().unwrap();
        let map = map(&dir);

        let a = map.allocate().unwrap();
        let b = map.allocate().unwrap();
        let c = map.allocate().unwrap();
        assert_eq!((a, b, c), (0, 1, 2));

        map.set(1, PagePosition::new(100, 7)).unwrap();

        assert_eq!(map.get(0).unwrap(), None);
        assert_eq!(map.get(1).unwrap(), Some(PagePosition::new(100, 7)));
        assert_eq!(map.get(2).unwrap(), None);
        assert!(!map.is_full().unwrap());
        assert_eq!(map.size().unwrap(), 3);
    }

    #[test]
    fn test_remove_and_resurrect_restore_entry() {
        let dir = TempDir::new().unwrap();
        let map = map(&dir);

        let index = map.add(PagePosition::new(12, 3)).unwrap();
        map.remove(index).unwrap();
        assert_eq!(map.status(index).unwrap(), PositionState::Removed);
        assert_eq!(map.get(index).unwrap(), None);

        map.resurrect(index, PagePosition::new(12, 3)).unwrap();
        assert_eq!(map.get(index).unwrap(), Some(PagePosition::new(12, 3)));
        assert!(map.exists(index).unwrap());
        assert_eq!(map.status(index).unwrap(), PositionState::Filled);
    }

    #[test]
    fn test_set_on_removed_is_error() {
        let dir = TempDir::new().unwrap();
        let map = map(&dir);
        let index = map.add(PagePosition::new(1, 1)).unwrap();
        map.remove(index).unwrap();
        assert!(matches!(
            map.set(index, PagePosition::new(2, 2)),
            Err(StorageError::ContractViolation(_))
        ));
        // The failed transition left the tombstone in place.
        assert_eq!(map.status(index).unwrap(), PositionState::Removed);
    }

    #[test]
    fn test_remove_out_of_range_is_noop() {
        let dir = TempDir::new().unwrap();
        let map = map(&dir);
        map.remove(99).unwrap();
        assert_eq!(map.status(99).unwrap(), PositionState::NotExistent);
    }

    #[test]
    fn test_bucket_chains_when_full() {
        let dir = TempDir::new().unwrap();
        let map = map(&dir);
        let per_page = map.entries_per_page();

        for i in 0..per_page + 3 {
            let index = map.add(PagePosition::new(i, i as u32)).unwrap();
            assert_eq!(index, i);
        }
        assert_eq!(map.size().unwrap(), per_page + 3);
        assert_eq!(
            map.get(per_page + 1).unwrap(),
            Some(PagePosition::new(per_page + 1, per_page as u32 + 1))
        );
        assert!(!map.is_full().unwrap());
    }
}
