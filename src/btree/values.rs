// Overflow value pages: values too large to embed in a leaf entry live in
// a singly linked chain of pages in the same file. Freed chains go onto a
// free list headed in the root bucket so the space is reused.
//
// ```text
// offset 16  u64  next page (INVALID_PAGE_INDEX terminates the chain)
// offset 24  u32  chunk length
// offset 28       chunk bytes
// ```

use crate::buffer::PageCache;
use crate::common::{FileId, PageIndex, INVALID_PAGE_INDEX, PAGE_DATA_OFFSET};
use crate::error::{Result, StorageError};
use crate::page::{DurablePage, PageView};
use crate::tx::AtomicOperationsManager;

use super::bucket;

const NEXT_PAGE_OFFSET: usize = PAGE_DATA_OFFSET;
const CHUNK_LEN_OFFSET: usize = NEXT_PAGE_OFFSET + 8;
const CHUNK_OFFSET: usize = CHUNK_LEN_OFFSET + 4;

pub fn chunk_capacity(page_size: usize) -> usize {
    page_size - CHUNK_OFFSET
}

/// Pop a page off the root's value free list, or extend the file.
fn allocate_value_page(
    atomic: &AtomicOperationsManager,
    file_id: FileId,
    root: &mut DurablePage,
) -> Result<DurablePage> {
    let head = bucket::value_free_list(root);
    if head != INVALID_PAGE_INDEX {
        let page = atomic.load_for_write(file_id, head)?;
        bucket::set_value_free_list(root, page.get_u64(NEXT_PAGE_OFFSET));
        Ok(page)
    } else {
        atomic.allocate_new_page(file_id)
    }
}

/// Write `value` as a page chain, back to front so each page links to the
/// already-written remainder. Returns the head page index.
pub fn write_chain(
    atomic: &AtomicOperationsManager,
    file_id: FileId,
    root: &mut DurablePage,
    value: &[u8],
) -> Result<PageIndex> {
    let capacity = chunk_capacity(atomic.cache().page_size());
    let mut next = INVALID_PAGE_INDEX;
    let chunks: Vec<&[u8]> = value.chunks(capacity).collect();
    for chunk in chunks.into_iter().rev() {
        let mut page = allocate_value_page(atomic, file_id, root)?;
        page.set_u64(NEXT_PAGE_OFFSET, next);
        page.set_u32(CHUNK_LEN_OFFSET, chunk.len() as u32);
        page.set_bytes(CHUNK_OFFSET, chunk);
        next = page.page_index();
        atomic.release_page(page)?;
    }
    Ok(next)
}

/// Read a whole chain back. `total_len` comes from the leaf entry and is
/// cross-checked against the chunks found.
pub fn read_chain(
    cache: &PageCache,
    file_id: FileId,
    head: PageIndex,
    total_len: u32,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(total_len as usize);
    let mut current = head;
    while current != INVALID_PAGE_INDEX {
        let page = cache.load_for_read(file_id, current)?;
        let len = page.get_u32(CHUNK_LEN_OFFSET) as usize;
        if len > chunk_capacity(cache.page_size()) {
            return Err(StorageError::Corruption(format!(
                "value page {current} claims an impossible chunk length {len}"
            )));
        }
        out.extend_from_slice(&page.get_bytes(CHUNK_OFFSET, len));
        current = page.get_u64(NEXT_PAGE_OFFSET);
        if out.len() > total_len as usize {
            return Err(StorageError::Corruption(format!(
                "value chain at {head} longer than its declared {total_len} bytes"
            )));
        }
    }
    if out.len() != total_len as usize {
        return Err(StorageError::Corruption(format!(
            "value chain at {head} truncated: {} of {total_len} bytes",
            out.len()
        )));
    }
    Ok(out)
}

/// Splice a freed chain onto the root's free list, newest first.
pub fn free_chain(
    atomic: &AtomicOperationsManager,
    file_id: FileId,
    root: &mut DurablePage,
    head: PageIndex,
) -> Result<()> {
    let mut current = head;
    while current != INVALID_PAGE_INDEX {
        let mut page = atomic.load_for_write(file_id, current)?;
        let next = page.get_u64(NEXT_PAGE_OFFSET);
        page.set_u64(NEXT_PAGE_OFFSET, bucket::value_free_list(root));
        atomic.release_page(page)?;
        bucket::set_value_free_list(root, current);
        current = next;
    }
    Ok(())
}
