// # Page Cache
//
// Bounded pool of buffer frames keyed by (file, page). Load misses read
// through the file manager; eviction is LRU over unpinned, non-resident
// frames and honors the write-ahead rule: a dirty page never reaches disk
// before the WAL is durable through that page's LSN.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::buffer::frame::{BufferFrame, CacheEntry, PinMode};
use crate::common::{FileId, PageIndex};
use crate::error::{Result, StorageError};
use crate::io::FileManager;
use crate::wal::WriteAheadLog;

/// Point-in-time cache counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub write_backs: u64,
}

#[derive(Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    write_backs: AtomicU64,
}

pub struct PageCache {
    files: Arc<FileManager>,
    capacity: usize,
    page_size: usize,
    frames: Mutex<HashMap<(FileId, PageIndex), Arc<BufferFrame>>>,
    /// Attached after construction; eviction and flush consult it for the
    /// write-ahead rule. `None` only during engine bootstrap.
    wal: RwLock<Option<Arc<WriteAheadLog>>>,
    tick: AtomicU64,
    stats: CacheStats,
}

impl PageCache {
    pub fn new(files: Arc<FileManager>, capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        let page_size = files.page_size();
        Self {
            files,
            capacity,
            page_size,
            frames: Mutex::new(HashMap::new()),
            wal: RwLock::new(None),
            tick: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    pub fn attach_wal(&self, wal: Arc<WriteAheadLog>) {
        *self.wal.write() = Some(wal);
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn files(&self) -> &Arc<FileManager> {
        &self.files
    }

    /// Load a page with a shared pin.
    pub fn load_for_read(&self, file_id: FileId, page_index: PageIndex) -> Result<CacheEntry> {
        self.load(file_id, page_index, PinMode::Read)
    }

    /// Load a page with an exclusive pin.
    pub fn load_for_write(&self, file_id: FileId, page_index: PageIndex) -> Result<CacheEntry> {
        self.load(file_id, page_index, PinMode::Write)
    }

    /// Extend the file by one page and return the new page write-pinned.
    /// The fresh frame is dirty so the page materializes on flush even if
    /// the caller never touches it.
    pub fn allocate_new_page(&self, file_id: FileId) -> Result<CacheEntry> {
        let page_index = self.files.extend_file(file_id)?;

        let frame = {
            let mut frames = self.frames.lock();
            self.evict_if_full(&mut frames)?;
            let frame = Arc::new(BufferFrame::new(file_id, page_index, self.page_size));
            frame.set_dirty(true);
            frame.touch(self.tick.fetch_add(1, Ordering::Relaxed));
            frames.insert((file_id, page_index), frame.clone());
            frame
        };

        frame.pin(PinMode::Write);
        Ok(CacheEntry::new(frame, PinMode::Write))
    }

    /// Mark the page as resident: retained in memory, never evicted.
    /// Used for directory root pages that every operation touches.
    pub fn pin_page(&self, entry: &CacheEntry) {
        entry.frame().set_resident();
    }

    fn load(&self, file_id: FileId, page_index: PageIndex, mode: PinMode) -> Result<CacheEntry> {
        let (frame, needs_io) = {
            let mut frames = self.frames.lock();
            if let Some(frame) = frames.get(&(file_id, page_index)) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                let frame = frame.clone();
                frame.touch(self.tick.fetch_add(1, Ordering::Relaxed));
                (frame, false)
            } else {
                if page_index >= self.files.filled_up_to(file_id)? {
                    return Err(StorageError::ContractViolation(format!(
                        "load of page {page_index} beyond end of file {file_id}"
                    )));
                }
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                self.evict_if_full(&mut frames)?;
                let frame = Arc::new(BufferFrame::new(file_id, page_index, self.page_size));
                frame.begin_io();
                frame.touch(self.tick.fetch_add(1, Ordering::Relaxed));
                frames.insert((file_id, page_index), frame.clone());
                (frame, true)
            }
        };

        if needs_io {
            let mut buf = vec![0u8; self.page_size];
            match self.files.read_page(file_id, page_index, &mut buf) {
                Ok(()) => {
                    frame.load_from(&buf);
                    let lsn = crate::common::Lsn(u64::from_be_bytes(
                        buf[0..8].try_into().expect("8-byte slice"),
                    ));
                    frame.set_page_lsn(lsn);
                    frame.finish_io();
                }
                Err(e) => {
                    // Drop the half-initialized frame so later loads retry.
                    self.frames.lock().remove(&(file_id, page_index));
                    frame.finish_io();
                    return Err(e);
                }
            }
        } else {
            frame.wait_io();
        }

        frame.pin(mode);
        Ok(CacheEntry::new(frame, mode))
    }

    /// Evict one LRU frame if the pool is at capacity. Caller holds the
    /// frame-map lock.
    fn evict_if_full(
        &self,
        frames: &mut HashMap<(FileId, PageIndex), Arc<BufferFrame>>,
    ) -> Result<()> {
        if frames.len() < self.capacity {
            return Ok(());
        }

        let victim = frames
            .iter()
            .filter(|(_, f)| f.is_unpinned() && !f.is_resident())
            .min_by_key(|(_, f)| f.last_access())
            .map(|(k, f)| (*k, f.clone()));

        let Some((key, frame)) = victim else {
            return Err(StorageError::OutOfSpace(
                "page cache exhausted: every frame is pinned".into(),
            ));
        };

        if frame.is_dirty() {
            self.write_back(&frame)?;
        }
        frames.remove(&key);
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        trace!(file = key.0, page = key.1, "evicted page");
        Ok(())
    }

    /// Write a dirty frame through the file manager, flushing the WAL first
    /// if the page LSN is ahead of the durable LSN.
    fn write_back(&self, frame: &BufferFrame) -> Result<()> {
        let lsn = frame.page_lsn();
        if let Some(wal) = self.wal.read().as_ref() {
            if lsn > wal.flushed_lsn() {
                wal.flush()?;
            }
        }
        let mut buf = vec![0u8; self.page_size];
        frame.snapshot_into(&mut buf);
        self.files
            .write_page(frame.file_id(), frame.page_index(), &mut buf)?;
        frame.set_dirty(false);
        self.stats.write_backs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flush every dirty frame and fsync the backing files.
    pub fn flush(&self) -> Result<()> {
        let dirty: Vec<Arc<BufferFrame>> = {
            let frames = self.frames.lock();
            frames.values().filter(|f| f.is_dirty()).cloned().collect()
        };
        for frame in &dirty {
            self.write_back(frame)?;
        }
        self.files.fsync_all()?;
        debug!(pages = dirty.len(), "cache flushed");
        Ok(())
    }

    /// Flush dirty frames belonging to one file.
    pub fn flush_file(&self, file_id: FileId) -> Result<()> {
        let dirty: Vec<Arc<BufferFrame>> = {
            let frames = self.frames.lock();
            frames
                .values()
                .filter(|f| f.file_id() == file_id && f.is_dirty())
                .cloned()
                .collect()
        };
        for frame in &dirty {
            self.write_back(frame)?;
        }
        self.files.fsync_file(file_id)?;
        Ok(())
    }

    /// Drop every cached page of a file without write-back. Used by file
    /// deletion and truncation, where the content is going away anyway.
    pub fn drop_file(&self, file_id: FileId) {
        let mut frames = self.frames.lock();
        frames.retain(|(fid, _), _| *fid != file_id);
    }

    /// Drop all clean frames and forget dirty state without writing. Test
    /// hook for crash simulation: the WAL survives, the cache does not.
    pub fn discard_all(&self) {
        self.frames.lock().clear();
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            write_backs: self.stats.write_backs.load(Ordering::Relaxed),
        }
    }

    pub fn cached_pages(&self) -> usize {
        self.frames.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PAGE: usize = 4096;

    fn cache(dir: &TempDir, capacity: usize) -> (Arc<FileManager>, PageCache) {
        let fm = Arc::new(FileManager::open(dir.path(), PAGE).unwrap());
        let cache = PageCache::new(fm.clone(), capacity);
        (fm, cache)
    }

    #[test]
    fn test_allocate_and_reload() {
        let dir = TempDir::new().unwrap();
        let (fm, cache) = cache(&dir, 8);
        let file = fm.add_new_file("t.idx").unwrap();

        let entry = cache.allocate_new_page(file).unwrap();
        let page_index = entry.page_index();
        entry.write_bytes(100, &[1, 2, 3]);
        drop(entry);

        let entry = cache.load_for_read(file, page_index).unwrap();
        let mut got = [0u8; 3];
        entry.read_bytes(100, &mut got);
        assert_eq!(got, [1, 2, 3]);
    }

    #[test]
    fn test_load_beyond_length_fails() {
        let dir = TempDir::new().unwrap();
        let (fm, cache) = cache(&dir, 8);
        let file = fm.add_new_file("t.idx").unwrap();
        assert!(matches!(
            cache.load_for_read(file, 0),
            Err(StorageError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_eviction_writes_back_dirty_pages() {
        let dir = TempDir::new().unwrap();
        let (fm, cache) = cache(&dir, 2);
        let file = fm.add_new_file("t.idx").unwrap();

        for i in 0..4u8 {
            let entry = cache.allocate_new_page(file).unwrap();
            entry.write_bytes(64, &[i]);
        }
        assert!(cache.cached_pages() <= 2);
        assert!(cache.stats().evictions >= 2);

        // Evicted pages must read back their content from disk.
        let entry = cache.load_for_read(file, 0).unwrap();
        let mut got = [0u8; 1];
        entry.read_bytes(64, &mut got);
        assert_eq!(got, [0]);
    }

    #[test]
    fn test_resident_pages_survive_eviction() {
        let dir = TempDir::new().unwrap();
        let (fm, cache) = cache(&dir, 2);
        let file = fm.add_new_file("t.idx").unwrap();

        let root = cache.allocate_new_page(file).unwrap();
        cache.pin_page(&root);
        root.write_bytes(32, &[9]);
        drop(root);

        for _ in 0..4 {
            let e = cache.allocate_new_page(file).unwrap();
            drop(e);
        }

        // The resident page is still cached: loading it is a hit.
        let before = cache.stats().misses;
        let entry = cache.load_for_read(file, 0).unwrap();
        let mut got = [0u8; 1];
        entry.read_bytes(32, &mut got);
        assert_eq!(got, [9]);
        assert_eq!(cache.stats().misses, before);
    }

    #[test]
    fn test_flush_then_reopen() {
        let dir = TempDir::new().unwrap();
        let file;
        {
            let (fm, cache) = cache(&dir, 8);
            file = fm.add_new_file("t.idx").unwrap();
            let entry = cache.allocate_new_page(file).unwrap();
            entry.write_bytes(200, &[42]);
            drop(entry);
            cache.flush().unwrap();
        }
        let (fm, cache) = cache(&dir, 8);
        let reopened = fm.open_file("t.idx").unwrap();
        assert_eq!(reopened, file);
        let entry = cache.load_for_read(file, 0).unwrap();
        let mut got = [0u8; 1];
        entry.read_bytes(200, &mut got);
        assert_eq!(got, [42]);
    }
}
