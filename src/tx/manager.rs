// # Atomic Operations Manager
//
// Coordinates multi-page mutations: hands out durable pages under the
// current thread's operation, appends their journalled records to the WAL
// on release, and commits or rolls back the whole unit. Nested starts on
// one thread are re-entrant; only the outermost end completes the
// operation, and an inner abort poisons the outer scope.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::buffer::PageCache;
use crate::common::{FileId, Lsn, OperationId, PageIndex};
use crate::error::{Result, StorageError};
use crate::lock::FileLockGuard;
use crate::page::DurablePage;
use crate::tx::operation::AtomicOperation;
use crate::wal::{WalRecord, WriteAheadLog};

pub struct AtomicOperationsManager {
    wal: Arc<WriteAheadLog>,
    cache: Arc<PageCache>,
    ops: DashMap<ThreadId, AtomicOperation>,
    next_op_id: AtomicU64,
    /// Set when a rollback fails; every further mutation is refused.
    read_only: AtomicBool,
    components: Mutex<Vec<&'static str>>,
}

impl AtomicOperationsManager {
    pub fn new(wal: Arc<WriteAheadLog>, cache: Arc<PageCache>) -> Self {
        Self {
            wal,
            cache,
            ops: DashMap::new(),
            next_op_id: AtomicU64::new(1),
            read_only: AtomicBool::new(false),
            components: Mutex::new(Vec::new()),
        }
    }

    /// Register a component name for diagnostics. Idempotent.
    pub fn register_component(&self, name: &'static str) {
        let mut components = self.components.lock();
        if !components.contains(&name) {
            components.push(name);
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn in_atomic_operation(&self) -> bool {
        self.ops.contains_key(&thread::current().id())
    }

    pub fn current_operation_id(&self) -> Option<OperationId> {
        self.ops.get(&thread::current().id()).map(|op| op.id())
    }

    /// Begin (or re-enter) the current thread's atomic operation. The
    /// returned scope aborts on drop unless `commit` is called.
    pub fn start_atomic_operation(&self, component: &'static str) -> Result<AtomicScope<'_>> {
        if self.is_read_only() {
            return Err(StorageError::ReadOnly);
        }
        let thread_id = thread::current().id();
        if let Some(mut op) = self.ops.get_mut(&thread_id) {
            op.enter_nested();
            trace!(op = op.id(), component, "re-entered atomic operation");
            return Ok(AtomicScope {
                manager: self,
                finished: false,
            });
        }

        let id = self.next_op_id.fetch_add(1, Ordering::AcqRel);
        self.wal.log(&WalRecord::AtomicBegin { op: id })?;
        self.ops
            .insert(thread_id, AtomicOperation::new(id, component));
        trace!(op = id, component, "started atomic operation");
        Ok(AtomicScope {
            manager: self,
            finished: false,
        })
    }

    /// End the current thread's operation. Only the outermost end performs
    /// the commit or rollback; inner ends just unwind one nesting level.
    pub fn end_atomic_operation(&self, rollback: bool) -> Result<()> {
        let thread_id = thread::current().id();
        let outermost = {
            let mut op = self.ops.get_mut(&thread_id).ok_or_else(|| {
                StorageError::AtomicOperation("end without a started operation".into())
            })?;
            op.leave(rollback)
        };
        if !outermost {
            return Ok(());
        }

        let (_, op) = self
            .ops
            .remove(&thread_id)
            .expect("operation present for this thread");

        if op.rollback_requested() {
            match self.rollback(&op) {
                Ok(()) => Ok(()),
                Err(e) => {
                    // A half-undone operation leaves pages in a state only
                    // restart recovery can repair.
                    self.read_only.store(true, Ordering::Release);
                    error!(op = op.id(), error = %e, "rollback failed; storage is now read-only");
                    Err(e)
                }
            }
        } else {
            self.commit(&op)
        }
    }

    fn commit(&self, op: &AtomicOperation) -> Result<()> {
        let lsn = self.wal.log(&WalRecord::AtomicCommit { op: op.id() })?;
        self.wal.flush()?;
        debug_assert!(self.wal.flushed_lsn() >= lsn);
        trace!(op = op.id(), records = op.records().len(), "committed");
        Ok(())
        // Retained locks drop with `op`.
    }

    fn rollback(&self, op: &AtomicOperation) -> Result<()> {
        for (_, record) in op.records().iter().rev() {
            let entry = self
                .cache
                .load_for_write(record.file_id, record.page_index)?;
            record.undo(&entry);
            let restore = op
                .start_lsn(record.file_id, record.page_index)
                .unwrap_or(Lsn::ZERO);
            entry.set_page_lsn(restore);
        }
        self.wal.log(&WalRecord::AtomicRollback { op: op.id() })?;
        self.wal.flush()?;
        debug!(op = op.id(), records = op.records().len(), "rolled back");
        Ok(())
    }

    /// Load a page for write under the current operation.
    pub fn load_for_write(&self, file_id: FileId, page_index: PageIndex) -> Result<DurablePage> {
        let thread_id = thread::current().id();
        let entry = self.cache.load_for_write(file_id, page_index)?;
        let mut op = self.ops.get_mut(&thread_id).ok_or_else(|| {
            StorageError::AtomicOperation("page write outside an atomic operation".into())
        })?;
        op.note_page_touched(file_id, page_index, entry.page_lsn());
        Ok(DurablePage::new(entry, op.id()))
    }

    /// Extend the file by one page under the current operation.
    pub fn allocate_new_page(&self, file_id: FileId) -> Result<DurablePage> {
        let thread_id = thread::current().id();
        let entry = self.cache.allocate_new_page(file_id)?;
        let mut op = self.ops.get_mut(&thread_id).ok_or_else(|| {
            StorageError::AtomicOperation("page allocation outside an atomic operation".into())
        })?;
        op.note_page_touched(file_id, entry.page_index(), Lsn::ZERO);
        Ok(DurablePage::new(entry, op.id()))
    }

    /// Release a write-pinned page: append its journalled mutations to the
    /// WAL in order and stamp the page LSN with the last assigned LSN.
    ///
    /// If an append fails the already-applied mutations of this page are
    /// reverted in place and the operation is poisoned; it can only roll
    /// back from here.
    pub fn release_page(&self, mut page: DurablePage) -> Result<()> {
        let thread_id = thread::current().id();
        let mut records = page.take_pending();
        if records.is_empty() {
            return Ok(());
        }

        let mut op = self.ops.get_mut(&thread_id).ok_or_else(|| {
            StorageError::AtomicOperation("page release outside an atomic operation".into())
        })?;

        let mut last_lsn = None;
        for (idx, record) in records.iter().enumerate() {
            match self.wal.log(&WalRecord::PageOp(record.clone())) {
                Ok(lsn) => {
                    op.push_record(lsn, record.clone());
                    last_lsn = Some(lsn);
                }
                Err(e) => {
                    // Revert this page's unlogged tail so the buffered image
                    // matches what the WAL knows.
                    for failed in records[idx..].iter().rev() {
                        failed.undo(page.entry());
                    }
                    op.request_rollback();
                    return Err(e);
                }
            }
        }

        if let Some(lsn) = last_lsn {
            page.entry().set_page_lsn(lsn);
        }
        Ok(())
        // Dropping `page` releases the write pin.
    }

    /// Keep a file lock alive until the current operation ends.
    pub fn retain_lock(&self, guard: FileLockGuard) -> Result<()> {
        let thread_id = thread::current().id();
        let mut op = self.ops.get_mut(&thread_id).ok_or_else(|| {
            StorageError::AtomicOperation("lock retention outside an atomic operation".into())
        })?;
        op.retain_lock(guard);
        Ok(())
    }

    /// Flush all dirty pages and record a checkpoint the next recovery can
    /// start from.
    pub fn checkpoint(&self) -> Result<Lsn> {
        self.wal.flush()?;
        self.cache.flush()?;
        self.wal.write_checkpoint()
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }
}

/// Scope guard for one `start_atomic_operation`. Dropping it without
/// `commit` rolls the operation back, so every early return and `?` exit
/// is covered.
pub struct AtomicScope<'a> {
    manager: &'a AtomicOperationsManager,
    finished: bool,
}

impl AtomicScope<'_> {
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.manager.end_atomic_operation(false)
    }

    pub fn abort(mut self) -> Result<()> {
        self.finished = true;
        self.manager.end_atomic_operation(true)
    }
}

impl Drop for AtomicScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.manager.end_atomic_operation(true) {
                error!(error = %e, "implicit rollback on scope drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FileManager;
    use tempfile::TempDir;

    const PAGE: usize = 4096;

    fn engine(dir: &TempDir) -> (Arc<FileManager>, Arc<PageCache>, AtomicOperationsManager) {
        let fm = Arc::new(FileManager::open(dir.path(), PAGE).unwrap());
        let cache = Arc::new(PageCache::new(fm.clone(), 32));
        let wal = Arc::new(WriteAheadLog::open(dir.path(), "pagevault", 1 << 20).unwrap());
        cache.attach_wal(wal.clone());
        let manager = AtomicOperationsManager::new(wal, cache.clone());
        (fm, cache, manager)
    }

    #[test]
    fn test_commit_stamps_page_lsn() {
        let dir = TempDir::new().unwrap();
        let (fm, _cache, mgr) = engine(&dir);
        let file = fm.add_new_file("t.idx").unwrap();

        let scope = mgr.start_atomic_operation("test").unwrap();
        let mut page = mgr.allocate_new_page(file).unwrap();
        page.set_u64(100, 42);
        mgr.release_page(page).unwrap();
        scope.commit().unwrap();

        let entry = mgr.cache().load_for_read(file, 0).unwrap();
        assert!(entry.page_lsn() > Lsn::ZERO);
        assert!(mgr.wal().flushed_lsn() >= entry.page_lsn());
    }

    #[test]
    fn test_rollback_restores_bytes_and_lsn() {
        let dir = TempDir::new().unwrap();
        let (fm, cache, mgr) = engine(&dir);
        let file = fm.add_new_file("t.idx").unwrap();

        // Commit an initial state.
        let scope = mgr.start_atomic_operation("test").unwrap();
        let mut page = mgr.allocate_new_page(file).unwrap();
        page.set_u64(100, 1);
        mgr.release_page(page).unwrap();
        scope.commit().unwrap();
        let lsn_before = cache.load_for_read(file, 0).unwrap().page_lsn();

        // Mutate and roll back.
        let scope = mgr.start_atomic_operation("test").unwrap();
        let mut page = mgr.load_for_write(file, 0).unwrap();
        page.set_u64(100, 2);
        page.set_u64(200, 3);
        mgr.release_page(page).unwrap();
        scope.abort().unwrap();

        let entry = cache.load_for_read(file, 0).unwrap();
        let mut buf = [0u8; 8];
        entry.read_bytes(100, &mut buf);
        assert_eq!(u64::from_be_bytes(buf), 1);
        entry.read_bytes(200, &mut buf);
        assert_eq!(u64::from_be_bytes(buf), 0);
        assert_eq!(entry.page_lsn(), lsn_before);
    }

    #[test]
    fn test_drop_without_commit_rolls_back() {
        let dir = TempDir::new().unwrap();
        let (fm, cache, mgr) = engine(&dir);
        let file = fm.add_new_file("t.idx").unwrap();

        {
            let _scope = mgr.start_atomic_operation("test").unwrap();
            let mut page = mgr.allocate_new_page(file).unwrap();
            page.set_u64(64, 9);
            mgr.release_page(page).unwrap();
            // Scope dropped here without commit.
        }

        let entry = cache.load_for_read(file, 0).unwrap();
        let mut buf = [0u8; 8];
        entry.read_bytes(64, &mut buf);
        assert_eq!(u64::from_be_bytes(buf), 0);
    }

    #[test]
    fn test_nested_scopes_commit_once() {
        let dir = TempDir::new().unwrap();
        let (fm, _cache, mgr) = engine(&dir);
        let file = fm.add_new_file("t.idx").unwrap();

        let outer = mgr.start_atomic_operation("outer").unwrap();
        let outer_id = mgr.current_operation_id().unwrap();
        {
            let inner = mgr.start_atomic_operation("inner").unwrap();
            assert_eq!(mgr.current_operation_id(), Some(outer_id));
            let mut page = mgr.allocate_new_page(file).unwrap();
            page.set_u64(32, 5);
            mgr.release_page(page).unwrap();
            inner.commit().unwrap();
        }
        // Still in the outer operation.
        assert!(mgr.in_atomic_operation());
        outer.commit().unwrap();
        assert!(!mgr.in_atomic_operation());
    }

    #[test]
    fn test_inner_abort_poisons_outer_commit() {
        let dir = TempDir::new().unwrap();
        let (fm, cache, mgr) = engine(&dir);
        let file = fm.add_new_file("t.idx").unwrap();

        let outer = mgr.start_atomic_operation("outer").unwrap();
        let mut page = mgr.allocate_new_page(file).unwrap();
        page.set_u64(32, 5);
        mgr.release_page(page).unwrap();
        {
            let inner = mgr.start_atomic_operation("inner").unwrap();
            inner.abort().unwrap();
        }
        // Outer commit still ends the op, but as a rollback.
        outer.commit().unwrap();

        let entry = cache.load_for_read(file, 0).unwrap();
        let mut buf = [0u8; 8];
        entry.read_bytes(32, &mut buf);
        assert_eq!(u64::from_be_bytes(buf), 0);
    }
}
