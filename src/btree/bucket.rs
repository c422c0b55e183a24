// # Prefix B+-tree bucket layout
//
// One bucket per page. Keys are stored as suffixes relative to the bucket
// prefix; the full key of entry `i` is `prefix + suffix(i)`.
//
// ```text
// offset 16  u8   flags (bit 0: leaf)
// offset 17  u8   reserved
// offset 18  u16  entry count
// offset 20  u16  free pointer (start of the tail area)
// offset 22  u16  prefix length
// offset 24  u64  tree size            (root bucket only)
// offset 32  u64  value free-list head (root bucket only)
// offset 40       prefix bytes, then the offset array (u16 per entry)
// ...             free space
// free pointer..  entry payloads, growing down from the page end
// ```
//
// Leaf entry:     u16 suffix len | suffix | u8 value kind |
//                 embedded: u32 len | bytes
//                 overflow: u64 head page | u32 total len
// Internal entry: u16 suffix len | suffix | u64 left child | u64 right child
//
// Neighboring internal entries share a child: entry[i].right_child and
// entry[i+1].left_child point at the same bucket.

use crate::common::{PageIndex, INVALID_PAGE_INDEX, PAGE_DATA_OFFSET};
use crate::page::{DurablePage, PageView};

const FLAGS_OFFSET: usize = PAGE_DATA_OFFSET;
const COUNT_OFFSET: usize = FLAGS_OFFSET + 2;
const FREE_POINTER_OFFSET: usize = COUNT_OFFSET + 2;
const PREFIX_LEN_OFFSET: usize = FREE_POINTER_OFFSET + 2;
pub const TREE_SIZE_OFFSET: usize = PREFIX_LEN_OFFSET + 2;
pub const VALUE_FREE_LIST_OFFSET: usize = TREE_SIZE_OFFSET + 8;
const PREFIX_OFFSET: usize = VALUE_FREE_LIST_OFFSET + 8;

const LEAF_FLAG: u8 = 0x01;

const VALUE_EMBEDDED: u8 = 0;
const VALUE_OVERFLOW: u8 = 1;

/// Value cell of a leaf entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafValue {
    Embedded(Vec<u8>),
    Overflow { head: PageIndex, len: u32 },
}

/// A fully materialized bucket entry, key reassembled from the prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketEntry {
    Leaf {
        key: Vec<u8>,
        value: LeafValue,
    },
    Internal {
        key: Vec<u8>,
        left: PageIndex,
        right: PageIndex,
    },
}

impl BucketEntry {
    pub fn key(&self) -> &[u8] {
        match self {
            BucketEntry::Leaf { key, .. } => key,
            BucketEntry::Internal { key, .. } => key,
        }
    }
}

fn entry_payload_size(suffix_len: usize, entry: &BucketEntry) -> usize {
    2 + suffix_len
        + match entry {
            BucketEntry::Leaf { value, .. } => match value {
                LeafValue::Embedded(v) => 1 + 4 + v.len(),
                LeafValue::Overflow { .. } => 1 + 8 + 4,
            },
            BucketEntry::Internal { .. } => 8 + 8,
        }
}

pub fn is_leaf(page: &impl PageView) -> bool {
    page.get_u8(FLAGS_OFFSET) & LEAF_FLAG != 0
}

pub fn entry_count(page: &impl PageView) -> usize {
    page.get_u16(COUNT_OFFSET) as usize
}

pub fn prefix(page: &impl PageView) -> Vec<u8> {
    let len = page.get_u16(PREFIX_LEN_OFFSET) as usize;
    page.get_bytes(PREFIX_OFFSET, len)
}

pub fn tree_size(page: &impl PageView) -> u64 {
    page.get_u64(TREE_SIZE_OFFSET)
}

pub fn set_tree_size(page: &mut DurablePage, size: u64) {
    page.set_u64(TREE_SIZE_OFFSET, size);
}

pub fn value_free_list(page: &impl PageView) -> PageIndex {
    page.get_u64(VALUE_FREE_LIST_OFFSET)
}

pub fn set_value_free_list(page: &mut DurablePage, head: PageIndex) {
    page.set_u64(VALUE_FREE_LIST_OFFSET, head);
}

fn offsets_start(page: &impl PageView) -> usize {
    PREFIX_OFFSET + page.get_u16(PREFIX_LEN_OFFSET) as usize
}

fn entry_offset(page: &impl PageView, index: usize) -> usize {
    page.get_u16(offsets_start(page) + index * 2) as usize
}

/// Usable bytes between the offset array and the tail area.
pub fn free_space(page: &impl PageView) -> usize {
    let array_end = offsets_start(page) + entry_count(page) * 2;
    (page.get_u16(FREE_POINTER_OFFSET) as usize).saturating_sub(array_end)
}

pub fn entry_suffix(page: &impl PageView, index: usize) -> Vec<u8> {
    let at = entry_offset(page, index);
    let len = page.get_u16(at) as usize;
    page.get_bytes(at + 2, len)
}

pub fn entry_key(page: &impl PageView, index: usize) -> Vec<u8> {
    let mut key = prefix(page);
    key.extend_from_slice(&entry_suffix(page, index));
    key
}

pub fn leaf_value(page: &impl PageView, index: usize) -> LeafValue {
    let at = entry_offset(page, index);
    let suffix_len = page.get_u16(at) as usize;
    let value_at = at + 2 + suffix_len;
    match page.get_u8(value_at) {
        VALUE_EMBEDDED => {
            let len = page.get_u32(value_at + 1) as usize;
            LeafValue::Embedded(page.get_bytes(value_at + 5, len))
        }
        _ => LeafValue::Overflow {
            head: page.get_u64(value_at + 1),
            len: page.get_u32(value_at + 9),
        },
    }
}

pub fn left_child(page: &impl PageView, index: usize) -> PageIndex {
    let at = entry_offset(page, index);
    let suffix_len = page.get_u16(at) as usize;
    page.get_u64(at + 2 + suffix_len)
}

pub fn right_child(page: &impl PageView, index: usize) -> PageIndex {
    let at = entry_offset(page, index);
    let suffix_len = page.get_u16(at) as usize;
    page.get_u64(at + 2 + suffix_len + 8)
}

pub fn set_left_child(page: &mut DurablePage, index: usize, child: PageIndex) {
    let at = entry_offset(page, index);
    let suffix_len = page.get_u16(at) as usize;
    page.set_u64(at + 2 + suffix_len, child);
}

pub fn set_right_child(page: &mut DurablePage, index: usize, child: PageIndex) {
    let at = entry_offset(page, index);
    let suffix_len = page.get_u16(at) as usize;
    page.set_u64(at + 2 + suffix_len + 8, child);
}

pub fn read_entry(page: &impl PageView, index: usize) -> BucketEntry {
    let key = entry_key(page, index);
    if is_leaf(page) {
        BucketEntry::Leaf {
            key,
            value: leaf_value(page, index),
        }
    } else {
        BucketEntry::Internal {
            key,
            left: left_child(page, index),
            right: right_child(page, index),
        }
    }
}

pub fn read_all_entries(page: &impl PageView) -> Vec<BucketEntry> {
    (0..entry_count(page)).map(|i| read_entry(page, i)).collect()
}

/// Binary search for a full key. `Ok` is an exact match, `Err` the
/// insertion point.
pub fn find(page: &impl PageView, key: &[u8]) -> std::result::Result<usize, usize> {
    use std::cmp::Ordering;

    let pfx = prefix(page);
    let mut low = 0usize;
    let mut high = entry_count(page);
    while low < high {
        let mid = (low + high) / 2;
        // Compare against the prefix first, then the suffix, avoiding a
        // key concatenation per probe.
        let ordering = if key.len() < pfx.len() {
            match key.cmp(&pfx[..key.len()]) {
                Ordering::Equal => Ordering::Less,
                other => other,
            }
        } else {
            match key[..pfx.len()].cmp(&pfx) {
                Ordering::Equal => {
                    let suffix = entry_suffix(page, mid);
                    key[pfx.len()..].cmp(&suffix)
                }
                other => other,
            }
        };
        match ordering {
            Ordering::Less => high = mid,
            Ordering::Greater => low = mid + 1,
            Ordering::Equal => return Ok(mid),
        }
    }
    Err(low)
}

/// Child page to follow when descending with `key`: the left child of the
/// first entry when the key sorts below everything, otherwise the right
/// child of the last entry whose key is `<= key`.
pub fn child_for(page: &impl PageView, key: &[u8]) -> PageIndex {
    debug_assert!(!is_leaf(page));
    match find(page, key) {
        Ok(i) => right_child(page, i),
        Err(0) => left_child(page, 0),
        Err(i) => right_child(page, i - 1),
    }
}

/// Position of the child slot followed for `key`, 0..=entry_count. Slot 0
/// is entry 0's left child; slot i (i >= 1) is entry i-1's right child.
pub fn child_slot_for(page: &impl PageView, key: &[u8]) -> usize {
    match find(page, key) {
        Ok(i) => i + 1,
        Err(i) => i,
    }
}

pub fn child_at_slot(page: &impl PageView, slot: usize) -> PageIndex {
    if slot == 0 {
        left_child(page, 0)
    } else {
        right_child(page, slot - 1)
    }
}

/// Initialize an empty bucket with the given prefix.
pub fn init(page: &mut DurablePage, leaf: bool, prefix: &[u8]) {
    let page_end = page_size_of(page);
    page.set_u8(FLAGS_OFFSET, if leaf { LEAF_FLAG } else { 0 });
    page.set_u16(COUNT_OFFSET, 0);
    page.set_u16(FREE_POINTER_OFFSET, page_end as u16);
    page.set_u16(PREFIX_LEN_OFFSET, prefix.len() as u16);
    if !prefix.is_empty() {
        page.set_bytes(PREFIX_OFFSET, prefix);
    }
}

// The free pointer is 16 bits, so bucket layouts address at most 64 KiB.
// A 64 KiB tail starts at offset 65536 which wraps a u16 to 0; the free
// pointer therefore stores `page_size - 1` semantics via saturation below.
fn page_size_of(page: &DurablePage) -> usize {
    page.page_size().min(u16::MAX as usize)
}

/// Rewrite the bucket in place with a new prefix and entry set. Returns
/// false (leaving the page untouched) when the entries do not fit.
///
/// Root-only header fields (tree size, free list) are preserved.
pub fn rewrite(page: &mut DurablePage, leaf: bool, prefix: &[u8], entries: &[BucketEntry]) -> bool {
    let page_end = page_size_of(page);
    let mut needed = 0usize;
    for entry in entries {
        debug_assert!(entry.key().starts_with(prefix), "key outside bucket prefix");
        needed += 2 + entry_payload_size(entry.key().len() - prefix.len(), entry);
    }
    let available = page_end - PREFIX_OFFSET - prefix.len();
    if needed > available {
        return false;
    }

    init(page, leaf, prefix);
    let mut free_pointer = page_end;
    let array_start = PREFIX_OFFSET + prefix.len();
    for (i, entry) in entries.iter().enumerate() {
        let suffix = &entry.key()[prefix.len()..];
        let size = entry_payload_size(suffix.len(), entry);
        free_pointer -= size;
        write_entry_at(page, free_pointer, suffix, entry);
        page.set_u16(array_start + i * 2, free_pointer as u16);
    }
    page.set_u16(COUNT_OFFSET, entries.len() as u16);
    page.set_u16(FREE_POINTER_OFFSET, free_pointer as u16);
    true
}

fn write_entry_at(page: &mut DurablePage, at: usize, suffix: &[u8], entry: &BucketEntry) {
    page.set_u16(at, suffix.len() as u16);
    if !suffix.is_empty() {
        page.set_bytes(at + 2, suffix);
    }
    let value_at = at + 2 + suffix.len();
    match entry {
        BucketEntry::Leaf { value, .. } => match value {
            LeafValue::Embedded(v) => {
                page.set_u8(value_at, VALUE_EMBEDDED);
                page.set_u32(value_at + 1, v.len() as u32);
                if !v.is_empty() {
                    page.set_bytes(value_at + 5, v);
                }
            }
            LeafValue::Overflow { head, len } => {
                page.set_u8(value_at, VALUE_OVERFLOW);
                page.set_u64(value_at + 1, *head);
                page.set_u32(value_at + 9, *len);
            }
        },
        BucketEntry::Internal { left, right, .. } => {
            page.set_u64(value_at, *left);
            page.set_u64(value_at + 8, *right);
        }
    }
}

/// Insert an entry at `index`. The key must extend the current bucket
/// prefix. Returns false when the bucket lacks space.
pub fn insert(page: &mut DurablePage, index: usize, entry: &BucketEntry) -> bool {
    let pfx_len = page.get_u16(PREFIX_LEN_OFFSET) as usize;
    debug_assert!(
        entry.key().len() >= pfx_len,
        "key shorter than bucket prefix"
    );
    let suffix_len = entry.key().len() - pfx_len;
    let payload = entry_payload_size(suffix_len, entry);
    if free_space(page) < payload + 2 {
        return false;
    }

    let count = entry_count(page);
    let array_start = offsets_start(page);
    // Shift the offset array right of the insertion point.
    if index < count {
        page.copy_bytes(
            array_start + index * 2,
            array_start + (index + 1) * 2,
            (count - index) * 2,
        );
    }
    let free_pointer = page.get_u16(FREE_POINTER_OFFSET) as usize - payload;
    let suffix = entry.key()[pfx_len..].to_vec();
    write_entry_at(page, free_pointer, &suffix, entry);
    page.set_u16(array_start + index * 2, free_pointer as u16);
    page.set_u16(FREE_POINTER_OFFSET, free_pointer as u16);
    page.set_u16(COUNT_OFFSET, count as u16 + 1);
    true
}

/// Insert a separator produced by a child split: the new entry's neighbors
/// adopt the split halves so shared child pointers stay consistent.
pub fn insert_separator(
    page: &mut DurablePage,
    index: usize,
    key: &[u8],
    left: PageIndex,
    right: PageIndex,
) -> bool {
    let count = entry_count(page);
    let entry = BucketEntry::Internal {
        key: key.to_vec(),
        left,
        right,
    };
    if !insert(page, index, &entry) {
        return false;
    }
    if index > 0 {
        set_right_child(page, index - 1, left);
    }
    if index + 1 < count + 1 {
        set_left_child(page, index + 1, right);
    }
    true
}

/// Remove the entry at `index`, compacting the tail area.
pub fn remove(page: &mut DurablePage, index: usize) {
    let count = entry_count(page);
    debug_assert!(index < count);
    let at = entry_offset(page, index);
    let suffix_len = page.get_u16(at) as usize;
    let entry = read_entry(page, index);
    let size = entry_payload_size(suffix_len, &entry);

    let array_start = offsets_start(page);
    // Close the gap in the offset array.
    if index + 1 < count {
        page.copy_bytes(
            array_start + (index + 1) * 2,
            array_start + index * 2,
            (count - index - 1) * 2,
        );
    }
    page.set_u16(COUNT_OFFSET, count as u16 - 1);

    // Compact the tail: slide everything below the removed entry up.
    let free_pointer = page.get_u16(FREE_POINTER_OFFSET) as usize;
    if at > free_pointer {
        page.copy_bytes(free_pointer, free_pointer + size, at - free_pointer);
    }
    page.set_u16(FREE_POINTER_OFFSET, (free_pointer + size) as u16);

    // Offsets below the removed payload moved up by `size`.
    for i in 0..count - 1 {
        let off = page.get_u16(array_start + i * 2) as usize;
        if off < at {
            page.set_u16(array_start + i * 2, (off + size) as u16);
        }
    }
}

/// Replace the value of a leaf entry, keeping its key. Returns false when
/// the new value does not fit even after removing the old entry.
pub fn replace_leaf_value(page: &mut DurablePage, index: usize, value: LeafValue) -> bool {
    let key = entry_key(page, index);
    remove(page, index);
    insert(
        page,
        index,
        &BucketEntry::Leaf {
            key: key.clone(),
            value,
        },
    )
}

pub const NO_CHILD: PageIndex = INVALID_PAGE_INDEX;
