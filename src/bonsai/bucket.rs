// # Bonsai bucket layout
//
// A bonsai bucket is a fixed 2 KiB region; several share one page, so many
// small trees coexist in a single file. All offsets below are relative to
// the region start (the pointer's page offset).
//
// ```text
// 0   u8   flags (bit 0: leaf, bit 1: deleted)
// 1   u8   key serializer id
// 2   u8   value serializer id
// 3   u8   reserved
// 4   u16  entry count
// 6   u16  free pointer (relative; tail grows down from the region end)
// 8   left sibling pointer  (u64 page + u32 offset)
// 20  right sibling pointer
// 32  free-list next pointer (meaningful while the bucket is freed)
// 44  u64  tree size (root bucket only)
// 52  offset array (u16 per entry), then free space, then entry payloads
// ```
//
// Leaf entry: serialized key | serialized value.
// Internal entry: serialized key | left child pointer | right child pointer.
// Like the page-sized tree, neighboring internal entries share a child.

use crate::common::BonsaiPointer;
use crate::page::{DurablePage, PageView};
use crate::serializer::SerialType;

pub const BUCKET_SIZE: usize = 2048;

const FLAGS: usize = 0;
const KEY_SERIALIZER: usize = 1;
const VALUE_SERIALIZER: usize = 2;
const COUNT: usize = 4;
const FREE_POINTER: usize = 6;
const LEFT_SIBLING: usize = 8;
const RIGHT_SIBLING: usize = 20;
const FREE_LIST_NEXT: usize = 32;
const TREE_SIZE: usize = 44;
const OFFSETS: usize = 52;

const LEAF_FLAG: u8 = 0x01;
const DELETED_FLAG: u8 = 0x02;

const POINTER_SIZE: usize = 12;

pub fn write_pointer(page: &mut DurablePage, at: usize, pointer: BonsaiPointer) {
    page.set_u64(at, pointer.page_index);
    page.set_u32(at + 8, pointer.page_offset);
}

pub fn read_pointer(view: &impl PageView, at: usize) -> BonsaiPointer {
    BonsaiPointer {
        page_index: view.get_u64(at),
        page_offset: view.get_u32(at + 8),
    }
}

pub fn init(
    page: &mut DurablePage,
    region: usize,
    leaf: bool,
    key_serializer: u8,
    value_serializer: u8,
) {
    page.set_u8(region + FLAGS, if leaf { LEAF_FLAG } else { 0 });
    page.set_u8(region + KEY_SERIALIZER, key_serializer);
    page.set_u8(region + VALUE_SERIALIZER, value_serializer);
    page.set_u16(region + COUNT, 0);
    page.set_u16(region + FREE_POINTER, BUCKET_SIZE as u16);
    write_pointer(page, region + LEFT_SIBLING, BonsaiPointer::NULL);
    write_pointer(page, region + RIGHT_SIBLING, BonsaiPointer::NULL);
    write_pointer(page, region + FREE_LIST_NEXT, BonsaiPointer::NULL);
}

pub fn is_leaf(view: &impl PageView, region: usize) -> bool {
    view.get_u8(region + FLAGS) & LEAF_FLAG != 0
}

pub fn is_deleted(view: &impl PageView, region: usize) -> bool {
    view.get_u8(region + FLAGS) & DELETED_FLAG != 0
}

pub fn mark_deleted(page: &mut DurablePage, region: usize) {
    let flags = page.get_u8(region + FLAGS);
    page.set_u8(region + FLAGS, flags | DELETED_FLAG);
}

pub fn key_serializer_id(view: &impl PageView, region: usize) -> u8 {
    view.get_u8(region + KEY_SERIALIZER)
}

pub fn value_serializer_id(view: &impl PageView, region: usize) -> u8 {
    view.get_u8(region + VALUE_SERIALIZER)
}

pub fn entry_count(view: &impl PageView, region: usize) -> usize {
    view.get_u16(region + COUNT) as usize
}

pub fn left_sibling(view: &impl PageView, region: usize) -> BonsaiPointer {
    read_pointer(view, region + LEFT_SIBLING)
}

pub fn right_sibling(view: &impl PageView, region: usize) -> BonsaiPointer {
    read_pointer(view, region + RIGHT_SIBLING)
}

pub fn set_left_sibling(page: &mut DurablePage, region: usize, pointer: BonsaiPointer) {
    write_pointer(page, region + LEFT_SIBLING, pointer);
}

pub fn set_right_sibling(page: &mut DurablePage, region: usize, pointer: BonsaiPointer) {
    write_pointer(page, region + RIGHT_SIBLING, pointer);
}

pub fn free_list_next(view: &impl PageView, region: usize) -> BonsaiPointer {
    read_pointer(view, region + FREE_LIST_NEXT)
}

pub fn set_free_list_next(page: &mut DurablePage, region: usize, pointer: BonsaiPointer) {
    write_pointer(page, region + FREE_LIST_NEXT, pointer);
}

pub fn tree_size(view: &impl PageView, region: usize) -> u64 {
    view.get_u64(region + TREE_SIZE)
}

pub fn set_tree_size(page: &mut DurablePage, region: usize, size: u64) {
    page.set_u64(region + TREE_SIZE, size);
}

fn entry_offset(view: &impl PageView, region: usize, index: usize) -> usize {
    region + view.get_u16(region + OFFSETS + index * 2) as usize
}

pub fn free_space(view: &impl PageView, region: usize) -> usize {
    let array_end = OFFSETS + entry_count(view, region) * 2;
    (view.get_u16(region + FREE_POINTER) as usize).saturating_sub(array_end)
}

pub fn key_at<K: SerialType>(view: &impl PageView, region: usize, index: usize) -> K {
    let at = entry_offset(view, region, index);
    let bytes = view.get_bytes(at, BUCKET_SIZE.min((region + BUCKET_SIZE) - at));
    K::read_from(&bytes, 0)
}

pub fn leaf_value_at<K: SerialType, V: SerialType>(
    view: &impl PageView,
    region: usize,
    index: usize,
) -> V {
    let at = entry_offset(view, region, index);
    let bytes = view.get_bytes(at, (region + BUCKET_SIZE) - at);
    let key_size = K::size_at(&bytes, 0);
    V::read_from(&bytes, key_size)
}

pub fn left_child_at<K: SerialType>(
    view: &impl PageView,
    region: usize,
    index: usize,
) -> BonsaiPointer {
    let at = entry_offset(view, region, index);
    let bytes = view.get_bytes(at, (region + BUCKET_SIZE) - at);
    let key_size = K::size_at(&bytes, 0);
    read_pointer(view, at + key_size)
}

pub fn right_child_at<K: SerialType>(
    view: &impl PageView,
    region: usize,
    index: usize,
) -> BonsaiPointer {
    let at = entry_offset(view, region, index);
    let bytes = view.get_bytes(at, (region + BUCKET_SIZE) - at);
    let key_size = K::size_at(&bytes, 0);
    read_pointer(view, at + key_size + POINTER_SIZE)
}

pub fn set_left_child_at<K: SerialType>(
    page: &mut DurablePage,
    region: usize,
    index: usize,
    child: BonsaiPointer,
) {
    let at = entry_offset(page, region, index);
    let bytes = page.get_bytes(at, (region + BUCKET_SIZE) - at);
    let key_size = K::size_at(&bytes, 0);
    write_pointer(page, at + key_size, child);
}

pub fn set_right_child_at<K: SerialType>(
    page: &mut DurablePage,
    region: usize,
    index: usize,
    child: BonsaiPointer,
) {
    let at = entry_offset(page, region, index);
    let bytes = page.get_bytes(at, (region + BUCKET_SIZE) - at);
    let key_size = K::size_at(&bytes, 0);
    write_pointer(page, at + key_size + POINTER_SIZE, child);
}

pub fn find<K: SerialType + Ord>(
    view: &impl PageView,
    region: usize,
    key: &K,
) -> std::result::Result<usize, usize> {
    let mut low = 0usize;
    let mut high = entry_count(view, region);
    while low < high {
        let mid = (low + high) / 2;
        let probe: K = key_at(view, region, mid);
        match key.cmp(&probe) {
            std::cmp::Ordering::Less => high = mid,
            std::cmp::Ordering::Greater => low = mid + 1,
            std::cmp::Ordering::Equal => return Ok(mid),
        }
    }
    Err(low)
}

pub fn child_slot_for<K: SerialType + Ord>(view: &impl PageView, region: usize, key: &K) -> usize {
    match find(view, region, key) {
        Ok(i) => i + 1,
        Err(i) => i,
    }
}

pub fn child_at_slot<K: SerialType>(
    view: &impl PageView,
    region: usize,
    slot: usize,
) -> BonsaiPointer {
    if slot == 0 {
        left_child_at::<K>(view, region, 0)
    } else {
        right_child_at::<K>(view, region, slot - 1)
    }
}

fn push_payload(page: &mut DurablePage, region: usize, index: usize, payload: &[u8]) -> bool {
    let count = entry_count(page, region);
    let needed = payload.len() + 2;
    if free_space(page, region) < needed {
        return false;
    }
    let array_start = region + OFFSETS;
    if index < count {
        page.copy_bytes(
            array_start + index * 2,
            array_start + (index + 1) * 2,
            (count - index) * 2,
        );
    }
    let free_pointer = page.get_u16(region + FREE_POINTER) as usize - payload.len();
    page.set_bytes(region + free_pointer, payload);
    page.set_u16(array_start + index * 2, free_pointer as u16);
    page.set_u16(region + FREE_POINTER, free_pointer as u16);
    page.set_u16(region + COUNT, count as u16 + 1);
    true
}

pub fn insert_leaf<K: SerialType, V: SerialType>(
    page: &mut DurablePage,
    region: usize,
    index: usize,
    key: &K,
    value: &V,
) -> bool {
    let mut payload = vec![0u8; key.serial_size() + value.serial_size()];
    key.write_to(&mut payload, 0);
    value.write_to(&mut payload, key.serial_size());
    push_payload(page, region, index, &payload)
}

/// Insert a separator into an internal bucket, updating the neighbors'
/// shared child pointers.
pub fn insert_separator<K: SerialType>(
    page: &mut DurablePage,
    region: usize,
    index: usize,
    key: &K,
    left: BonsaiPointer,
    right: BonsaiPointer,
) -> bool {
    let count = entry_count(page, region);
    let mut payload = vec![0u8; key.serial_size() + 2 * POINTER_SIZE];
    key.write_to(&mut payload, 0);
    payload[key.serial_size()..key.serial_size() + 8].copy_from_slice(&left.page_index.to_be_bytes());
    payload[key.serial_size() + 8..key.serial_size() + 12]
        .copy_from_slice(&left.page_offset.to_be_bytes());
    let right_at = key.serial_size() + POINTER_SIZE;
    payload[right_at..right_at + 8].copy_from_slice(&right.page_index.to_be_bytes());
    payload[right_at + 8..right_at + 12].copy_from_slice(&right.page_offset.to_be_bytes());

    if !push_payload(page, region, index, &payload) {
        return false;
    }
    if index > 0 {
        set_right_child_at::<K>(page, region, index - 1, left);
    }
    if index + 1 < count + 1 {
        set_left_child_at::<K>(page, region, index + 1, right);
    }
    true
}

/// Remove the entry at `index`, compacting the region tail.
pub fn remove_entry(page: &mut DurablePage, region: usize, index: usize, payload_size: usize) {
    let count = entry_count(page, region);
    debug_assert!(index < count);
    let at = entry_offset(page, region, index);

    let array_start = region + OFFSETS;
    if index + 1 < count {
        page.copy_bytes(
            array_start + (index + 1) * 2,
            array_start + index * 2,
            (count - index - 1) * 2,
        );
    }
    page.set_u16(region + COUNT, count as u16 - 1);

    let free_pointer = page.get_u16(region + FREE_POINTER) as usize;
    let tail_start = region + free_pointer;
    if at > tail_start {
        page.copy_bytes(tail_start, tail_start + payload_size, at - tail_start);
    }
    page.set_u16(region + FREE_POINTER, (free_pointer + payload_size) as u16);

    let relative_removed = at - region;
    for i in 0..count - 1 {
        let off = page.get_u16(array_start + i * 2) as usize;
        if off < relative_removed {
            page.set_u16(array_start + i * 2, (off + payload_size) as u16);
        }
    }
}

pub fn leaf_payload_size<K: SerialType, V: SerialType>(
    view: &impl PageView,
    region: usize,
    index: usize,
) -> usize {
    let at = entry_offset(view, region, index);
    let bytes = view.get_bytes(at, (region + BUCKET_SIZE) - at);
    let key_size = K::size_at(&bytes, 0);
    key_size + V::size_at(&bytes, key_size)
}

pub fn read_leaf_entries<K: SerialType, V: SerialType>(
    view: &impl PageView,
    region: usize,
) -> Vec<(K, V)> {
    (0..entry_count(view, region))
        .map(|i| (key_at(view, region, i), leaf_value_at::<K, V>(view, region, i)))
        .collect()
}

pub fn read_internal_entries<K: SerialType>(
    view: &impl PageView,
    region: usize,
) -> Vec<(K, BonsaiPointer, BonsaiPointer)> {
    (0..entry_count(view, region))
        .map(|i| {
            (
                key_at(view, region, i),
                left_child_at::<K>(view, region, i),
                right_child_at::<K>(view, region, i),
            )
        })
        .collect()
}

/// Rewrite a bucket as a leaf with the given entries, preserving header
/// identity fields and taking explicit sibling pointers.
pub fn rewrite_leaf<K: SerialType, V: SerialType>(
    page: &mut DurablePage,
    region: usize,
    entries: &[(K, V)],
    left_sibling: BonsaiPointer,
    right_sibling: BonsaiPointer,
) -> bool {
    let needed: usize = entries
        .iter()
        .map(|(k, v)| 2 + k.serial_size() + v.serial_size())
        .sum();
    if needed > BUCKET_SIZE - OFFSETS {
        return false;
    }
    let key_ser = key_serializer_id(page, region);
    let value_ser = value_serializer_id(page, region);
    let size = tree_size(page, region);
    init(page, region, true, key_ser, value_ser);
    set_left_sibling(page, region, left_sibling);
    set_right_sibling(page, region, right_sibling);
    set_tree_size(page, region, size);
    for (i, (k, v)) in entries.iter().enumerate() {
        let ok = insert_leaf(page, region, i, k, v);
        debug_assert!(ok, "sized entries must fit");
    }
    true
}

pub fn rewrite_internal<K: SerialType>(
    page: &mut DurablePage,
    region: usize,
    entries: &[(K, BonsaiPointer, BonsaiPointer)],
) -> bool {
    let needed: usize = entries
        .iter()
        .map(|(k, _, _)| 2 + k.serial_size() + 2 * POINTER_SIZE)
        .sum();
    if needed > BUCKET_SIZE - OFFSETS {
        return false;
    }
    let key_ser = key_serializer_id(page, region);
    let value_ser = value_serializer_id(page, region);
    let size = tree_size(page, region);
    init(page, region, false, key_ser, value_ser);
    set_tree_size(page, region, size);
    for (i, (k, l, r)) in entries.iter().enumerate() {
        let ok = insert_separator(page, region, i, k, *l, *r);
        debug_assert!(ok, "sized entries must fit");
    }
    true
}
