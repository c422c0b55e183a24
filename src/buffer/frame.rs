// Buffer frames and pin accounting.
//
// A frame is a reference-counted holder of one page image. Shared (read)
// pins may coexist; an exclusive (write) pin excludes every other pin on
// the same frame. Pin transitions block on a per-frame condvar rather than
// spinning.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::common::{FileId, Lsn, PageIndex};

#[derive(Debug, Default)]
struct PinState {
    readers: u32,
    writer: bool,
}

/// A single cached page image plus its bookkeeping.
pub struct BufferFrame {
    file_id: FileId,
    page_index: PageIndex,
    page_size: usize,

    state: Mutex<PinState>,
    unpinned: Condvar,

    /// Page bytes. Accessors take the lock per call; an exclusive pin
    /// already guarantees a single writer.
    data: RwLock<Box<[u8]>>,

    dirty: AtomicBool,
    /// Set while the initial disk read populates `data`.
    io_in_progress: AtomicBool,
    io_done: Condvar,
    io_lock: Mutex<()>,

    /// Explicitly retained in memory (directory roots); skipped by eviction.
    resident: AtomicBool,

    /// LSN of the last WAL record applied to this page.
    page_lsn: AtomicU64,

    /// LRU tick of the last pin.
    last_access: AtomicU64,
}

impl BufferFrame {
    pub(crate) fn new(file_id: FileId, page_index: PageIndex, page_size: usize) -> Self {
        Self {
            file_id,
            page_index,
            page_size,
            state: Mutex::new(PinState::default()),
            unpinned: Condvar::new(),
            data: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
            dirty: AtomicBool::new(false),
            io_in_progress: AtomicBool::new(false),
            io_done: Condvar::new(),
            io_lock: Mutex::new(()),
            resident: AtomicBool::new(false),
            page_lsn: AtomicU64::new(0),
            last_access: AtomicU64::new(0),
        }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn page_index(&self) -> PageIndex {
        self.page_index
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    pub fn page_lsn(&self) -> Lsn {
        Lsn(self.page_lsn.load(Ordering::Acquire))
    }

    pub(crate) fn set_page_lsn(&self, lsn: Lsn) {
        self.page_lsn.store(lsn.0, Ordering::Release);
    }

    pub fn is_resident(&self) -> bool {
        self.resident.load(Ordering::Acquire)
    }

    pub(crate) fn set_resident(&self) {
        self.resident.store(true, Ordering::Release);
    }

    pub(crate) fn touch(&self, tick: u64) {
        self.last_access.store(tick, Ordering::Relaxed);
    }

    pub(crate) fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub(crate) fn begin_io(&self) {
        self.io_in_progress.store(true, Ordering::Release);
    }

    pub(crate) fn finish_io(&self) {
        let _guard = self.io_lock.lock();
        self.io_in_progress.store(false, Ordering::Release);
        self.io_done.notify_all();
    }

    pub(crate) fn wait_io(&self) {
        let mut guard = self.io_lock.lock();
        while self.io_in_progress.load(Ordering::Acquire) {
            self.io_done.wait(&mut guard);
        }
    }

    /// Blocking pin acquisition honoring read/write exclusion.
    pub(crate) fn pin(&self, mode: PinMode) {
        let mut state = self.state.lock();
        match mode {
            PinMode::Read => {
                while state.writer {
                    self.unpinned.wait(&mut state);
                }
                state.readers += 1;
            }
            PinMode::Write => {
                while state.writer || state.readers > 0 {
                    self.unpinned.wait(&mut state);
                }
                state.writer = true;
            }
        }
    }

    pub(crate) fn unpin(&self, mode: PinMode) {
        let mut state = self.state.lock();
        match mode {
            PinMode::Read => {
                debug_assert!(state.readers > 0, "read unpin without pin");
                state.readers -= 1;
            }
            PinMode::Write => {
                debug_assert!(state.writer, "write unpin without pin");
                state.writer = false;
            }
        }
        drop(state);
        self.unpinned.notify_all();
    }

    /// True when no pin of any kind is held.
    pub(crate) fn is_unpinned(&self) -> bool {
        let state = self.state.lock();
        !state.writer && state.readers == 0
    }

    /// Copy the page image out (used by eviction and flushing).
    pub(crate) fn snapshot_into(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&self.data.read());
    }

    pub(crate) fn load_from(&self, buf: &[u8]) {
        self.data.write().copy_from_slice(buf);
    }

    pub(crate) fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        let data = self.data.read();
        out.copy_from_slice(&data[offset..offset + out.len()]);
    }

    pub(crate) fn write_bytes(&self, offset: usize, src: &[u8]) {
        let mut data = self.data.write();
        data[offset..offset + src.len()].copy_from_slice(src);
    }

    pub(crate) fn copy_within(&self, src: usize, dst: usize, len: usize) {
        let mut data = self.data.write();
        data.copy_within(src..src + len, dst);
    }
}

/// Pin flavor held by a `CacheEntry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Read,
    Write,
}

/// RAII handle over a pinned frame. Dropping the entry releases the pin.
pub struct CacheEntry {
    frame: Arc<BufferFrame>,
    mode: PinMode,
}

impl CacheEntry {
    pub(crate) fn new(frame: Arc<BufferFrame>, mode: PinMode) -> Self {
        Self { frame, mode }
    }

    pub fn file_id(&self) -> FileId {
        self.frame.file_id()
    }

    pub fn page_index(&self) -> PageIndex {
        self.frame.page_index()
    }

    pub fn page_size(&self) -> usize {
        self.frame.page_size()
    }

    pub fn mode(&self) -> PinMode {
        self.mode
    }

    pub fn page_lsn(&self) -> Lsn {
        self.frame.page_lsn()
    }

    pub fn frame(&self) -> &Arc<BufferFrame> {
        &self.frame
    }

    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        self.frame.read_bytes(offset, out);
    }

    /// Write raw bytes. Callers go through `DurablePage`, which records the
    /// mutation; only write-pinned entries may be mutated.
    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        debug_assert_eq!(self.mode, PinMode::Write, "mutation on a read pin");
        self.frame.write_bytes(offset, src);
        self.frame.set_dirty(true);
    }

    pub fn copy_within(&self, src: usize, dst: usize, len: usize) {
        debug_assert_eq!(self.mode, PinMode::Write, "mutation on a read pin");
        self.frame.copy_within(src, dst, len);
        self.frame.set_dirty(true);
    }

    /// Stamp the page LSN both in the page header bytes and in the frame
    /// metadata used by the write-ahead check.
    pub fn set_page_lsn(&self, lsn: Lsn) {
        debug_assert_eq!(self.mode, PinMode::Write, "LSN stamp on a read pin");
        self.frame.write_bytes(0, &lsn.0.to_be_bytes());
        self.frame.set_page_lsn(lsn);
        self.frame.set_dirty(true);
    }
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        self.frame.unpin(self.mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_read_pins_share() {
        let frame = Arc::new(BufferFrame::new(1, 0, 4096));
        frame.pin(PinMode::Read);
        frame.pin(PinMode::Read);
        frame.unpin(PinMode::Read);
        frame.unpin(PinMode::Read);
        assert!(frame.is_unpinned());
    }

    #[test]
    fn test_write_pin_excludes_readers() {
        let frame = Arc::new(BufferFrame::new(1, 0, 4096));
        frame.pin(PinMode::Write);

        let f = frame.clone();
        let reader = thread::spawn(move || {
            f.pin(PinMode::Read);
            f.unpin(PinMode::Read);
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!reader.is_finished());
        frame.unpin(PinMode::Write);
        reader.join().unwrap();
    }

    #[test]
    fn test_lsn_stamp_updates_header_bytes() {
        let frame = Arc::new(BufferFrame::new(1, 0, 4096));
        frame.pin(PinMode::Write);
        let entry = CacheEntry::new(frame.clone(), PinMode::Write);
        entry.set_page_lsn(Lsn::new(2, 64));

        let mut header = [0u8; 8];
        frame.read_bytes(0, &mut header);
        assert_eq!(u64::from_be_bytes(header), Lsn::new(2, 64).0);
        assert_eq!(frame.page_lsn(), Lsn::new(2, 64));
    }
}
