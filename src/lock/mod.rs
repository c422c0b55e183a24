// # File Lock Manager
//
// Shared/exclusive locks keyed by file ID, partitioned to keep unrelated
// files off the same mutex. Acquisition blocks on a per-partition condvar;
// guards release on drop. Index structures take the exclusive lock for
// structural mutations and the shared lock for reads.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::common::FileId;

const PARTITIONS: usize = 16;

#[derive(Debug, Default)]
struct LockState {
    readers: u32,
    writer: bool,
}

struct Partition {
    table: Mutex<HashMap<FileId, LockState>>,
    released: Condvar,
}

pub struct FileLockManager {
    partitions: Vec<Partition>,
}

impl Default for FileLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FileLockManager {
    pub fn new() -> Self {
        Self {
            partitions: (0..PARTITIONS)
                .map(|_| Partition {
                    table: Mutex::new(HashMap::new()),
                    released: Condvar::new(),
                })
                .collect(),
        }
    }

    fn partition(&self, file_id: FileId) -> &Partition {
        &self.partitions[file_id as usize % PARTITIONS]
    }

    /// Acquire the shared lock on a file, blocking while an exclusive
    /// holder exists.
    pub fn shared(self: &Arc<Self>, file_id: FileId) -> FileLockGuard {
        let part = self.partition(file_id);
        let mut table = part.table.lock();
        loop {
            let state = table.entry(file_id).or_default();
            if !state.writer {
                state.readers += 1;
                break;
            }
            part.released.wait(&mut table);
        }
        FileLockGuard {
            manager: self.clone(),
            file_id,
            exclusive: false,
        }
    }

    /// Acquire the exclusive lock on a file, blocking while any holder
    /// exists.
    pub fn exclusive(self: &Arc<Self>, file_id: FileId) -> FileLockGuard {
        let part = self.partition(file_id);
        let mut table = part.table.lock();
        loop {
            let state = table.entry(file_id).or_default();
            if !state.writer && state.readers == 0 {
                state.writer = true;
                break;
            }
            part.released.wait(&mut table);
        }
        FileLockGuard {
            manager: self.clone(),
            file_id,
            exclusive: true,
        }
    }

    fn release(&self, file_id: FileId, exclusive: bool) {
        let part = self.partition(file_id);
        let mut table = part.table.lock();
        if let Some(state) = table.get_mut(&file_id) {
            if exclusive {
                debug_assert!(state.writer);
                state.writer = false;
            } else {
                debug_assert!(state.readers > 0);
                state.readers -= 1;
            }
            if !state.writer && state.readers == 0 {
                table.remove(&file_id);
            }
        }
        drop(table);
        part.released.notify_all();
    }
}

/// RAII lock over one file. Owned (holds an `Arc` to the manager) so an
/// atomic operation can retain it past the acquiring call's scope.
pub struct FileLockGuard {
    manager: Arc<FileLockManager>,
    file_id: FileId,
    exclusive: bool,
}

impl FileLockGuard {
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        self.manager.release(self.file_id, self.exclusive);
    }
}
