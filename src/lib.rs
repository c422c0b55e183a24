// PageVault - durable paginated indexing engine
// Core library module

pub mod bonsai;
pub mod btree;
pub mod buffer;
pub mod cluster;
pub mod common;
pub mod encryption;
pub mod error;
pub mod hashindex;
pub mod io;
pub mod lock;
pub mod page;
pub mod serializer;
pub mod tx;
pub mod wal;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

pub use error::{Result, StorageError};

use crate::buffer::PageCache;
use crate::common::FileId;
use crate::io::FileManager;
use crate::lock::FileLockManager;
use crate::serializer::SerializerRegistry;
use crate::tx::{recover, AtomicOperationsManager, RecoveryStats};
use crate::wal::{WalRecord, WriteAheadLog};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Page size in bytes. Fixed for the lifetime of the data directory.
    pub page_size: usize,
    /// Page cache capacity, in pages.
    pub cache_pages: usize,
    /// WAL segment roll threshold, in bytes.
    pub wal_segment_size: u64,
    /// Descent depth beyond which a tree is considered corrupt.
    pub max_path_length: usize,
    /// Values larger than this are stored in overflow page chains.
    pub max_embedded_value_size: usize,
    /// Write a checkpoint when the engine closes cleanly.
    pub checkpoint_on_close: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            page_size: 64 * 1024,
            cache_pages: 256,
            wal_segment_size: 64 << 20,
            max_path_length: 64,
            max_embedded_value_size: 1024,
            checkpoint_on_close: true,
        }
    }
}

impl StorageConfig {
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: dir.into(),
            ..Self::default()
        }
    }
}

/// Explicit engine context threaded through every component: file manager,
/// page cache, WAL, atomic-operation manager, file locks and the
/// serializer registry. There are no process-wide singletons; two engines
/// over two directories coexist in one process.
pub struct StorageEngine {
    config: StorageConfig,
    files: Arc<FileManager>,
    cache: Arc<PageCache>,
    wal: Arc<WriteAheadLog>,
    atomic: Arc<AtomicOperationsManager>,
    locks: Arc<FileLockManager>,
    serializers: SerializerRegistry,
    recovery: RecoveryStats,
}

impl StorageEngine {
    /// Open the engine over a data directory, running crash recovery
    /// before anything else touches the files.
    pub fn open(config: StorageConfig) -> Result<Arc<Self>> {
        let files = Arc::new(FileManager::open(&config.data_dir, config.page_size)?);
        let wal = Arc::new(WriteAheadLog::open(
            &config.data_dir,
            "pagevault",
            config.wal_segment_size,
        )?);
        let cache = Arc::new(PageCache::new(files.clone(), config.cache_pages));
        cache.attach_wal(wal.clone());

        let recovery = recover(&files, &cache, &wal)?;
        let atomic = Arc::new(AtomicOperationsManager::new(wal.clone(), cache.clone()));

        let engine = Arc::new(Self {
            config,
            files,
            cache,
            wal,
            atomic,
            locks: Arc::new(FileLockManager::new()),
            serializers: SerializerRegistry::with_builtins(),
            recovery,
        });
        engine.wal.write_checkpoint()?;
        info!(dir = %engine.config.data_dir.display(), "storage engine opened");
        Ok(engine)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn files(&self) -> &Arc<FileManager> {
        &self.files
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }

    pub fn atomic(&self) -> &Arc<AtomicOperationsManager> {
        &self.atomic
    }

    pub fn locks(&self) -> &Arc<FileLockManager> {
        &self.locks
    }

    pub fn serializers(&self) -> &SerializerRegistry {
        &self.serializers
    }

    /// Statistics of the recovery pass that ran at open.
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery
    }

    /// Create a durable file: the creation is logged and flushed before the
    /// backing file exists, so a crash in between replays it.
    pub fn add_file(&self, name: &str) -> Result<FileId> {
        let id = self.files.book_file_id(name)?;
        self.wal.log(&WalRecord::FileCreated {
            name: name.to_string(),
            file_id: id,
        })?;
        self.wal.flush()?;
        self.files.add_file(name, id)?;
        Ok(id)
    }

    pub fn open_file(&self, name: &str) -> Result<FileId> {
        self.files.open_file(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.files.exists(name)
    }

    /// Delete a file. Deletion cannot be rolled back, so it is rejected
    /// inside an atomic operation.
    pub fn delete_file(&self, file_id: FileId) -> Result<()> {
        if self.atomic.in_atomic_operation() {
            return Err(StorageError::ContractViolation(
                "file deletion inside an atomic operation is not reversible".into(),
            ));
        }
        self.cache.drop_file(file_id);
        self.wal.log(&WalRecord::FileDeleted { file_id })?;
        self.wal.flush()?;
        self.files.delete_file(file_id)
    }

    pub fn truncate_file(&self, file_id: FileId) -> Result<()> {
        if self.atomic.in_atomic_operation() {
            return Err(StorageError::ContractViolation(
                "file truncation inside an atomic operation is not reversible".into(),
            ));
        }
        self.cache.drop_file(file_id);
        self.files.truncate_file(file_id)
    }

    /// Flush dirty pages and record a checkpoint.
    pub fn checkpoint(&self) -> Result<()> {
        self.atomic.checkpoint()?;
        Ok(())
    }

    /// Flush everything; with `checkpoint_on_close` a final checkpoint
    /// marks the shutdown clean.
    pub fn close(&self) -> Result<()> {
        self.wal.flush()?;
        self.cache.flush()?;
        if self.config.checkpoint_on_close {
            self.wal.write_checkpoint()?;
        }
        info!("storage engine closed");
        Ok(())
    }
}
