// # Extendible hash directory
//
// A pointer table for an extendible hash index. The first page carries the
// table header and an inline run of nodes; further pages are packed with
// `NODES_PER_PAGE` nodes each. A node is three depth bytes plus
// `LEVEL_SIZE` bucket pointers.
//
// ```text
// first page:  offset 16  u64 tree size
//              offset 24  u64 tombstone head (NULL_NODE when empty)
//              offset 32  inline nodes
// other pages: offset 16  nodes
// node:        u8 max-left-child-depth | u8 max-right-child-depth |
//              u8 node-local-depth | LEVEL_SIZE x u64 pointers
// ```
//
// Deleted nodes chain through their pointer[0] slot: the tombstone head
// stores the most recently deleted node, so reuse is LIFO.

use std::sync::Arc;

use tracing::debug;

use crate::common::{FileId, PageIndex, PAGE_DATA_OFFSET};
use crate::error::{Result, StorageError};
use crate::page::{DurablePage, PageView};
use crate::tx::AtomicOperationsManager;
use crate::StorageEngine;

pub const LEVEL_SIZE: usize = 256;
pub const NODE_SIZE: usize = 3 + LEVEL_SIZE * 8;

/// Sentinel for "no node" in the tombstone chain.
pub const NULL_NODE: u64 = u64::MAX;

const TREE_SIZE_OFFSET: usize = PAGE_DATA_OFFSET;
const TOMBSTONE_OFFSET: usize = TREE_SIZE_OFFSET + 8;
const FIRST_NODES_OFFSET: usize = TOMBSTONE_OFFSET + 8;

const COMPONENT: &str = "hash-directory";

pub struct HashTableDirectory {
    engine: Arc<StorageEngine>,
    file_id: FileId,
    first_page_nodes: usize,
    nodes_per_page: usize,
}

impl HashTableDirectory {
    pub fn create(engine: Arc<StorageEngine>, name: &str) -> Result<Self> {
        let file_id = engine.add_file(name)?;
        let dir = Self::with_file(engine, file_id);
        let atomic = dir.engine.atomic().clone();
        atomic.register_component(COMPONENT);
        let _lock = dir.engine.locks().exclusive(file_id);
        let scope = atomic.start_atomic_operation(COMPONENT)?;
        let result = (|| {
            let mut page = atomic.allocate_new_page(file_id)?;
            page.set_u64(TREE_SIZE_OFFSET, 0);
            page.set_u64(TOMBSTONE_OFFSET, NULL_NODE);
            atomic.release_page(page)
        })();
        match result {
            Ok(()) => scope.commit()?,
            Err(e) => {
                scope.abort()?;
                return Err(e);
            }
        }
        Ok(dir)
    }

    pub fn open(engine: Arc<StorageEngine>, name: &str) -> Result<Self> {
        let file_id = engine.open_file(name)?;
        Ok(Self::with_file(engine, file_id))
    }

    fn with_file(engine: Arc<StorageEngine>, file_id: FileId) -> Self {
        let page_size = engine.config().page_size;
        assert!(
            page_size >= FIRST_NODES_OFFSET + NODE_SIZE,
            "page size too small for a directory node"
        );
        Self {
            first_page_nodes: (page_size - FIRST_NODES_OFFSET) / NODE_SIZE,
            nodes_per_page: (page_size - PAGE_DATA_OFFSET) / NODE_SIZE,
            engine,
            file_id,
        }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// (page index, byte offset) of a node, with the first-page special
    /// case.
    fn locate(&self, node_index: u64) -> (PageIndex, usize) {
        if (node_index as usize) < self.first_page_nodes {
            (
                0,
                FIRST_NODES_OFFSET + node_index as usize * NODE_SIZE,
            )
        } else {
            let rest = node_index as usize - self.first_page_nodes;
            (
                1 + (rest / self.nodes_per_page) as PageIndex,
                PAGE_DATA_OFFSET + (rest % self.nodes_per_page) * NODE_SIZE,
            )
        }
    }

    /// Number of node slots ever allocated, tombstoned slots included.
    pub fn node_count(&self) -> Result<u64> {
        let page = self.engine.cache().load_for_read(self.file_id, 0)?;
        Ok(page.get_u64(TREE_SIZE_OFFSET))
    }

    pub fn tombstone_head(&self) -> Result<u64> {
        let page = self.engine.cache().load_for_read(self.file_id, 0)?;
        Ok(page.get_u64(TOMBSTONE_OFFSET))
    }

    /// Allocate a node slot: pop the tombstone stack when one is
    /// available, otherwise append, growing the file as needed.
    pub fn add_new_node(
        &self,
        max_left_child_depth: u8,
        max_right_child_depth: u8,
        node_local_depth: u8,
        pointers: &[u64],
    ) -> Result<u64> {
        debug_assert_eq!(pointers.len(), LEVEL_SIZE);
        let _lock = self.engine.locks().exclusive(self.file_id);
        let atomic = self.engine.atomic().clone();
        let scope = atomic.start_atomic_operation(COMPONENT)?;
        let result = self.add_new_node_inner(
            &atomic,
            max_left_child_depth,
            max_right_child_depth,
            node_local_depth,
            pointers,
        );
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

    fn add_new_node_inner(
        &self,
        atomic: &AtomicOperationsManager,
        max_left_child_depth: u8,
        max_right_child_depth: u8,
        node_local_depth: u8,
        pointers: &[u64],
    ) -> Result<u64> {
        let mut first = atomic.load_for_write(self.file_id, 0)?;
        let tombstone = first.get_u64(TOMBSTONE_OFFSET);

        let index = if tombstone != NULL_NODE {
            // Reuse the most recently deleted slot; its pointer[0] holds
            // the next tombstone.
            let (page_index, offset) = self.locate(tombstone);
            let next = if page_index == 0 {
                first.get_u64(offset + 3)
            } else {
                let page = self.engine.cache().load_for_read(self.file_id, page_index)?;
                page.get_u64(offset + 3)
            };
            first.set_u64(TOMBSTONE_OFFSET, next);
            tombstone
        } else {
            let count = first.get_u64(TREE_SIZE_OFFSET);
            first.set_u64(TREE_SIZE_OFFSET, count + 1);
            count
        };

        let (page_index, offset) = self.locate(index);
        // The slot may live on an overflow page that does not exist yet.
        while page_index >= self.engine.files().filled_up_to(self.file_id)? {
            let fresh = atomic.allocate_new_page(self.file_id)?;
            atomic.release_page(fresh)?;
        }

        if page_index == 0 {
            write_node(
                &mut first,
                offset,
                max_left_child_depth,
                max_right_child_depth,
                node_local_depth,
                pointers,
            );
            atomic.release_page(first)?;
        } else {
            atomic.release_page(first)?;
            let mut page = atomic.load_for_write(self.file_id, page_index)?;
            write_node(
                &mut page,
                offset,
                max_left_child_depth,
                max_right_child_depth,
                node_local_depth,
                pointers,
            );
            atomic.release_page(page)?;
        }
        debug!(node = index, "directory node added");
        Ok(index)
    }

    /// Push a node onto the tombstone stack for reuse.
    pub fn delete_node(&self, node_index: u64) -> Result<()> {
        let _lock = self.engine.locks().exclusive(self.file_id);
        let atomic = self.engine.atomic().clone();
        let scope = atomic.start_atomic_operation(COMPONENT)?;
        let result = (|| {
            let mut first = atomic.load_for_write(self.file_id, 0)?;
            let head = first.get_u64(TOMBSTONE_OFFSET);
            let (page_index, offset) = self.locate(node_index);
            if page_index == 0 {
                first.set_u64(offset + 3, head);
                first.set_u64(TOMBSTONE_OFFSET, node_index);
                atomic.release_page(first)?;
            } else {
                first.set_u64(TOMBSTONE_OFFSET, node_index);
                atomic.release_page(first)?;
                let mut page = atomic.load_for_write(self.file_id, page_index)?;
                page.set_u64(offset + 3, head);
                atomic.release_page(page)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => scope.commit(),
            Err(e) => {
                scope.abort()?;
                Err(e)
            }
        }
    }

    pub fn max_left_child_depth(&self, node_index: u64) -> Result<u8> {
        self.read_node_byte(node_index, 0)
    }

    pub fn set_max_left_child_depth(&self, node_index: u64, depth: u8) -> Result<()> {
        self.write_node_byte(node_index, 0, depth)
    }

    pub fn max_right_child_depth(&self, node_index: u64) -> Result<u8> {
        self.read_node_byte(node_index, 1)
    }

    pub fn set_max_right_child_depth(&self, node_index: u64, depth: u8) -> Result<()> {
        self.write_node_byte(node_index, 1, depth)
    }

    pub fn node_local_depth(&self, node_index: u64) -> Result<u8> {
        self.read_node_byte(node_index, 2)
    }

    pub fn set_node_local_depth(&self, node_index: u64, depth: u8) -> Result<()> {
        self.write_node_byte(node_index, 2, depth)
    }

    pub fn node_pointer(&self, node_index: u64, slot: usize) -> Result<u64> {
        debug_assert!(slot < LEVEL_SIZE);
        let (page_index, offset) = self.locate(node_index);
        let page = self.engine.cache().load_for_read(self.file_id, page_index)?;
        Ok(page.get_u64(offset + 3 + slot * 8))
    }

    pub fn set_node_pointer(&self, node_index: u64, slot: usize, pointer: u64) -> Result<()> {
        debug_assert!(slot < LEVEL_SIZE);
        let _lock = self.engine.locks().exclusive(self.file_id);
        let atomic = self.engine.atomic().clone();
        let scope = atomic.start_atomic_operation(COMPONENT)?;
        let result = (|| {
            let (page_index, offset) = self.locate(node_index);
            let mut page = atomic.load_for_write(self.file_id, page_index)?;
            page.set_u64(offset + 3 + slot * 8, pointer);
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

    pub fn node(&self, node_index: u64) -> Result<Vec<u64>> {
        let (page_index, offset) = self.locate(node_index);
        let page = self.engine.cache().load_for_read(self.file_id, page_index)?;
        Ok((0..LEVEL_SIZE)
            .map(|slot| page.get_u64(offset + 3 + slot * 8))
            .collect())
    }

    fn read_node_byte(&self, node_index: u64, byte: usize) -> Result<u8> {
        self.check_index(node_index)?;
        let (page_index, offset) = self.locate(node_index);
        let page = self.engine.cache().load_for_read(self.file_id, page_index)?;
        Ok(page.get_u8(offset + byte))
    }

    fn write_node_byte(&self, node_index: u64, byte: usize, value: u8) -> Result<()> {
        self.check_index(node_index)?;
        let _lock = self.engine.locks().exclusive(self.file_id);
        let atomic = self.engine.atomic().clone();
        let scope = atomic.start_atomic_operation(COMPONENT)?;
        let result = (|| {
            let (page_index, offset) = self.locate(node_index);
            let mut page = atomic.load_for_write(self.file_id, page_index)?;
            page.set_u8(offset + byte, value);
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

    fn check_index(&self, node_index: u64) -> Result<()> {
        let page = self.engine.cache().load_for_read(self.file_id, 0)?;
        if node_index >= page.get_u64(TREE_SIZE_OFFSET) {
            return Err(StorageError::ContractViolation(format!(
                "directory node {node_index} out of range"
            )));
        }
        Ok(())
    }
}

fn write_node(
    page: &mut DurablePage,
    offset: usize,
    max_left_child_depth: u8,
    max_right_child_depth: u8,
    node_local_depth: u8,
    pointers: &[u64],
) {
    page.set_u8(offset, max_left_child_depth);
    page.set_u8(offset + 1, max_right_child_depth);
    page.set_u8(offset + 2, node_local_depth);
    let mut bytes = vec![0u8; LEVEL_SIZE * 8];
    for (i, pointer) in pointers.iter().enumerate() {
        bytes[i * 8..(i + 1) * 8].copy_from_slice(&pointer.to_be_bytes());
    }
    page.set_bytes(offset + 3, &bytes);
}
