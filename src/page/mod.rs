// # Durable Page
//
// A typed view over a write-pinned cache entry. Every setter emits exactly
// one page-operation record carrying the previous bytes, so the pending
// list can be drained to the WAL on release and replayed in either
// direction. All multi-byte fields are big-endian.

use crate::buffer::{CacheEntry, PinMode};
use crate::common::{Lsn, OperationId};
use crate::wal::{PageOpKind, PageOpRecord};

/// Read-side binary accessors shared by plain read pins and durable pages.
pub trait PageView {
    fn view_bytes(&self, offset: usize, out: &mut [u8]);

    fn get_u8(&self, offset: usize) -> u8 {
        let mut b = [0u8; 1];
        self.view_bytes(offset, &mut b);
        b[0]
    }

    fn get_u16(&self, offset: usize) -> u16 {
        let mut b = [0u8; 2];
        self.view_bytes(offset, &mut b);
        u16::from_be_bytes(b)
    }

    fn get_u32(&self, offset: usize) -> u32 {
        let mut b = [0u8; 4];
        self.view_bytes(offset, &mut b);
        u32::from_be_bytes(b)
    }

    fn get_u64(&self, offset: usize) -> u64 {
        let mut b = [0u8; 8];
        self.view_bytes(offset, &mut b);
        u64::from_be_bytes(b)
    }

    fn get_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.view_bytes(offset, &mut out);
        out
    }
}

impl PageView for CacheEntry {
    fn view_bytes(&self, offset: usize, out: &mut [u8]) {
        self.read_bytes(offset, out);
    }
}

/// Exclusive, journalled view of one page.
pub struct DurablePage {
    entry: CacheEntry,
    op: OperationId,
    pending: Vec<PageOpRecord>,
}

impl PageView for DurablePage {
    fn view_bytes(&self, offset: usize, out: &mut [u8]) {
        self.entry.read_bytes(offset, out);
    }
}

impl DurablePage {
    /// Wrap a write-pinned entry. Mutations are journalled under `op`.
    pub fn new(entry: CacheEntry, op: OperationId) -> Self {
        debug_assert_eq!(entry.mode(), PinMode::Write);
        Self {
            entry,
            op,
            pending: Vec::new(),
        }
    }

    pub fn file_id(&self) -> crate::common::FileId {
        self.entry.file_id()
    }

    pub fn page_index(&self) -> crate::common::PageIndex {
        self.entry.page_index()
    }

    pub fn page_size(&self) -> usize {
        self.entry.page_size()
    }

    pub fn page_lsn(&self) -> Lsn {
        self.entry.page_lsn()
    }

    pub fn operation_id(&self) -> OperationId {
        self.op
    }

    fn record(&mut self, kind: PageOpKind) {
        self.pending.push(PageOpRecord {
            op: self.op,
            file_id: self.entry.file_id(),
            page_index: self.entry.page_index(),
            // The header LSN is only restamped on release, so every record
            // of one release batch shares the pre-batch LSN.
            prev_lsn: self.entry.page_lsn(),
            kind,
        });
    }

    pub fn set_u8(&mut self, offset: usize, value: u8) {
        let prev = self.get_u8(offset);
        self.entry.write_bytes(offset, &[value]);
        self.record(PageOpKind::SetByte {
            offset: offset as u32,
            value,
            prev,
        });
    }

    pub fn set_u16(&mut self, offset: usize, value: u16) {
        let prev = self.get_u16(offset);
        self.entry.write_bytes(offset, &value.to_be_bytes());
        self.record(PageOpKind::SetShort {
            offset: offset as u32,
            value,
            prev,
        });
    }

    pub fn set_u32(&mut self, offset: usize, value: u32) {
        let prev = self.get_u32(offset);
        self.entry.write_bytes(offset, &value.to_be_bytes());
        self.record(PageOpKind::SetInt {
            offset: offset as u32,
            value,
            prev,
        });
    }

    pub fn set_u64(&mut self, offset: usize, value: u64) {
        let prev = self.get_u64(offset);
        self.entry.write_bytes(offset, &value.to_be_bytes());
        self.record(PageOpKind::SetLong {
            offset: offset as u32,
            value,
            prev,
        });
    }

    pub fn set_bytes(&mut self, offset: usize, value: &[u8]) {
        let prev = self.get_bytes(offset, value.len());
        self.entry.write_bytes(offset, value);
        self.record(PageOpKind::SetBinary {
            offset: offset as u32,
            value: value.to_vec(),
            prev,
        });
    }

    /// Move `len` bytes from `src` to `dst` within the page.
    pub fn copy_bytes(&mut self, src: usize, dst: usize, len: usize) {
        let prev = self.get_bytes(dst, len);
        self.entry.copy_within(src, dst, len);
        self.record(PageOpKind::CopyBytes {
            src: src as u32,
            dst: dst as u32,
            len: len as u32,
            prev,
        });
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drain the journalled mutations in emission order.
    pub(crate) fn take_pending(&mut self) -> Vec<PageOpRecord> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn entry(&self) -> &CacheEntry {
        &self.entry
    }
}

impl Drop for DurablePage {
    /// A page dropped without being released carries mutations the WAL
    /// never saw; revert them so the cached image stays replayable.
    fn drop(&mut self) {
        for record in self.pending.iter().rev() {
            record.undo(&self.entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PageCache;
    use crate::io::FileManager;
    use std::sync::Arc;
    use tempfile::TempDir;

    const PAGE: usize = 4096;

    fn write_page(dir: &TempDir) -> (PageCache, DurablePage) {
        let fm = Arc::new(FileManager::open(dir.path(), PAGE).unwrap());
        let cache = PageCache::new(fm.clone(), 8);
        let file = fm.add_new_file("t.idx").unwrap();
        let entry = cache.allocate_new_page(file).unwrap();
        (cache, DurablePage::new(entry, 1))
    }

    #[test]
    fn test_every_mutation_emits_one_record() {
        let dir = TempDir::new().unwrap();
        let (_cache, mut page) = write_page(&dir);

        page.set_u8(100, 7);
        page.set_u32(104, 1234);
        page.set_bytes(200, &[1, 2, 3]);
        page.copy_bytes(200, 300, 3);
        assert_eq!(page.take_pending().len(), 4);
        assert!(!page.has_pending());

        assert_eq!(page.get_u8(100), 7);
        assert_eq!(page.get_u32(104), 1234);
        assert_eq!(page.get_bytes(300, 3), vec![1, 2, 3]);
    }

    #[test]
    fn test_redo_undo_restore_bytes_exactly() {
        let dir = TempDir::new().unwrap();
        let (_cache, mut page) = write_page(&dir);

        page.set_u64(64, 0xAABB);
        page.set_bytes(80, &[4, 5, 6, 7]);
        let records = page.take_pending();

        let before: Vec<u8> = {
            // Undo in reverse returns the page to its initial image.
            for rec in records.iter().rev() {
                rec.undo(page.entry());
            }
            page.get_bytes(0, PAGE)
        };
        assert_eq!(&before[64..72], &[0u8; 8]);
        assert_eq!(&before[80..84], &[0u8; 4]);

        // Redo in order reproduces the mutated image.
        for rec in &records {
            rec.redo(page.entry());
        }
        assert_eq!(page.get_u64(64), 0xAABB);
        assert_eq!(page.get_bytes(80, 4), vec![4, 5, 6, 7]);
    }
}
