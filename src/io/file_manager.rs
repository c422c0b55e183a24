// # File Manager
//
// Maps logical file names to numeric file IDs, tracks file length in pages
// and performs page-aligned IO with per-page CRC32 verification.
//
// The name registry is persisted in a `files.map` file next to the data
// files and rewritten atomically (write-temp + rename) on every change, so
// a crash between registry updates never leaves a half-written map.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::common::{FileId, PageIndex};
use crate::error::{Result, StorageError};

const REGISTRY_FILE: &str = "files.map";
const REGISTRY_MAGIC: u32 = 0x5056_464D; // "PVFM"

/// Offset of the content CRC within the page header.
const PAGE_CRC_OFFSET: usize = 8;
/// Checksummed region starts after the LSN and CRC fields.
const PAGE_CRC_DATA_START: usize = 12;

struct FileEntry {
    name: String,
    file: Mutex<File>,
    /// Length in pages, including pages allocated but not yet written back.
    pages: AtomicU64,
}

/// File manager: the durable side of the write cache.
pub struct FileManager {
    root: PathBuf,
    page_size: usize,
    files: DashMap<FileId, FileEntry>,
    registry: Mutex<NameRegistry>,
}

struct NameRegistry {
    names: Vec<(String, FileId)>,
    booked: HashSet<FileId>,
    next_id: FileId,
}

impl NameRegistry {
    fn id_of(&self, name: &str) -> Option<FileId> {
        self.names
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
    }
}

impl FileManager {
    /// Open the file manager over `root`, creating the directory and loading
    /// the name registry if one exists. Files named in the registry are
    /// opened eagerly so their lengths are known.
    pub fn open(root: impl Into<PathBuf>, page_size: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let registry = Self::load_registry(&root)?;
        let manager = Self {
            root,
            page_size,
            files: DashMap::new(),
            registry: Mutex::new(registry),
        };

        let known: Vec<(String, FileId)> = manager.registry.lock().names.clone();
        for (name, id) in known {
            manager.open_entry(&name, id)?;
        }

        Ok(manager)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reserve a file ID for `name` without creating the backing file. The
    /// reservation is in-memory only; it becomes durable when `add_file`
    /// is called with the same ID.
    pub fn book_file_id(&self, name: &str) -> Result<FileId> {
        let mut reg = self.registry.lock();
        if reg.id_of(name).is_some() {
            return Err(StorageError::FileAlreadyExists(name.to_string()));
        }
        let id = reg.next_id;
        reg.next_id += 1;
        reg.booked.insert(id);
        Ok(id)
    }

    /// Create the backing file for a previously booked ID (or a fresh ID
    /// when the caller skipped booking) and persist the name mapping.
    pub fn add_file(&self, name: &str, file_id: FileId) -> Result<()> {
        {
            let mut reg = self.registry.lock();
            if reg.id_of(name).is_some() {
                return Err(StorageError::FileAlreadyExists(name.to_string()));
            }
            reg.booked.remove(&file_id);
            if file_id >= reg.next_id {
                reg.next_id = file_id + 1;
            }
            reg.names.push((name.to_string(), file_id));
            self.persist_registry(&reg)?;
        }
        self.open_entry(name, file_id)?;
        debug!(file = name, id = file_id, "file added");
        Ok(())
    }

    /// Convenience: book an ID and create the file in one step.
    pub fn add_new_file(&self, name: &str) -> Result<FileId> {
        let id = self.book_file_id(name)?;
        self.add_file(name, id)?;
        Ok(id)
    }

    /// Look up an existing file by name.
    pub fn open_file(&self, name: &str) -> Result<FileId> {
        self.registry
            .lock()
            .id_of(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.registry.lock().id_of(name).is_some()
    }

    pub fn file_name(&self, file_id: FileId) -> Result<String> {
        self.files
            .get(&file_id)
            .map(|e| e.name.clone())
            .ok_or_else(|| StorageError::FileNotFound(format!("file id {file_id}")))
    }

    /// Current length of the file, in pages. Includes pages allocated in
    /// memory that have not yet been written back.
    pub fn filled_up_to(&self, file_id: FileId) -> Result<u64> {
        self.files
            .get(&file_id)
            .map(|e| e.pages.load(Ordering::Acquire))
            .ok_or_else(|| StorageError::FileNotFound(format!("file id {file_id}")))
    }

    /// Extend the file by one page and return the index of the new page.
    /// The page contents are materialized on the next write-back.
    pub fn extend_file(&self, file_id: FileId) -> Result<PageIndex> {
        let entry = self
            .files
            .get(&file_id)
            .ok_or_else(|| StorageError::FileNotFound(format!("file id {file_id}")))?;
        Ok(entry.pages.fetch_add(1, Ordering::AcqRel))
    }

    /// Grow the file so that `pages` pages are addressable. Used by
    /// recovery when a redo record references a page past the current end.
    pub fn extend_file_to(&self, file_id: FileId, pages: u64) -> Result<()> {
        let entry = self
            .files
            .get(&file_id)
            .ok_or_else(|| StorageError::FileNotFound(format!("file id {file_id}")))?;
        entry.pages.fetch_max(pages, Ordering::AcqRel);
        Ok(())
    }

    /// Read one page into `buf` (which must be exactly one page long),
    /// verifying the stored content CRC. Pages past the materialized end of
    /// the file but within the allocated length read back as zeroes.
    pub fn read_page(&self, file_id: FileId, page_index: PageIndex, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        let entry = self
            .files
            .get(&file_id)
            .ok_or_else(|| StorageError::FileNotFound(format!("file id {file_id}")))?;

        if page_index >= entry.pages.load(Ordering::Acquire) {
            return Err(StorageError::ContractViolation(format!(
                "read of page {page_index} beyond end of file '{}'",
                entry.name
            )));
        }

        let mut file = entry.file.lock();
        let offset = page_index * self.page_size as u64;
        let disk_len = file.metadata()?.len();
        if offset >= disk_len {
            buf.fill(0);
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        drop(file);

        let stored = u32::from_be_bytes(
            buf[PAGE_CRC_OFFSET..PAGE_CRC_OFFSET + 4]
                .try_into()
                .expect("4-byte slice"),
        );
        // A never-written page region inside a sparse file is all zeroes
        // and carries no checksum.
        if stored != 0 || buf.iter().any(|&b| b != 0) {
            let actual = crc32fast::hash(&buf[PAGE_CRC_DATA_START..]);
            if stored != actual {
                return Err(StorageError::Corruption(format!(
                    "CRC mismatch on page {} of file '{}' (stored {stored:#x}, computed {actual:#x})",
                    page_index, entry.name
                )));
            }
        }
        Ok(())
    }

    /// Write one page, stamping the content CRC into the header first.
    pub fn write_page(&self, file_id: FileId, page_index: PageIndex, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        let entry = self
            .files
            .get(&file_id)
            .ok_or_else(|| StorageError::FileNotFound(format!("file id {file_id}")))?;

        let crc = crc32fast::hash(&buf[PAGE_CRC_DATA_START..]);
        buf[PAGE_CRC_OFFSET..PAGE_CRC_OFFSET + 4].copy_from_slice(&crc.to_be_bytes());

        let mut file = entry.file.lock();
        file.seek(SeekFrom::Start(page_index * self.page_size as u64))?;
        file.write_all(buf)?;
        entry.pages.fetch_max(page_index + 1, Ordering::AcqRel);
        Ok(())
    }

    /// Truncate the file to zero pages. Cached copies must be dropped by
    /// the caller first.
    pub fn truncate_file(&self, file_id: FileId) -> Result<()> {
        let entry = self
            .files
            .get(&file_id)
            .ok_or_else(|| StorageError::FileNotFound(format!("file id {file_id}")))?;
        let file = entry.file.lock();
        file.set_len(0)?;
        entry.pages.store(0, Ordering::Release);
        Ok(())
    }

    /// Remove the file from disk and from the registry.
    pub fn delete_file(&self, file_id: FileId) -> Result<()> {
        let (_, entry) = self
            .files
            .remove(&file_id)
            .ok_or_else(|| StorageError::FileNotFound(format!("file id {file_id}")))?;

        let mut reg = self.registry.lock();
        reg.names.retain(|(_, id)| *id != file_id);
        self.persist_registry(&reg)?;
        drop(reg);

        let path = self.root.join(&entry.name);
        drop(entry);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        debug!(id = file_id, "file deleted");
        Ok(())
    }

    pub fn fsync_file(&self, file_id: FileId) -> Result<()> {
        let entry = self
            .files
            .get(&file_id)
            .ok_or_else(|| StorageError::FileNotFound(format!("file id {file_id}")))?;
        entry.file.lock().sync_all()?;
        Ok(())
    }

    pub fn fsync_all(&self) -> Result<()> {
        for entry in self.files.iter() {
            entry.file.lock().sync_all()?;
        }
        Ok(())
    }

    pub fn file_ids(&self) -> Vec<FileId> {
        self.files.iter().map(|e| *e.key()).collect()
    }

    fn open_entry(&self, name: &str, id: FileId) -> Result<()> {
        let path = self.root.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();
        if len % self.page_size as u64 != 0 {
            warn!(
                file = name,
                len,
                "file length is not page aligned; trailing partial page ignored"
            );
        }
        self.files.insert(
            id,
            FileEntry {
                name: name.to_string(),
                file: Mutex::new(file),
                pages: AtomicU64::new(len / self.page_size as u64),
            },
        );
        Ok(())
    }

    fn registry_path(root: &Path) -> PathBuf {
        root.join(REGISTRY_FILE)
    }

    fn load_registry(root: &Path) -> Result<NameRegistry> {
        let path = Self::registry_path(root);
        let empty = NameRegistry {
            names: Vec::new(),
            booked: HashSet::new(),
            next_id: 1,
        };
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(empty),
            Err(e) => return Err(e.into()),
        };
        if data.len() < 12 {
            return Err(StorageError::Corruption("file registry truncated".into()));
        }
        let (body, tail) = data.split_at(data.len() - 4);
        let stored_crc = u32::from_be_bytes(tail.try_into().expect("4-byte slice"));
        if crc32fast::hash(body) != stored_crc {
            return Err(StorageError::Corruption(
                "file registry checksum mismatch".into(),
            ));
        }

        let mut buf = body;
        if buf.get_u32() != REGISTRY_MAGIC {
            return Err(StorageError::Corruption("file registry bad magic".into()));
        }
        let next_id = buf.get_u32();
        let count = buf.get_u32() as usize;
        let mut names = Vec::with_capacity(count);
        for _ in 0..count {
            let id = buf.get_u32();
            let name_len = buf.get_u16() as usize;
            if buf.remaining() < name_len {
                return Err(StorageError::Corruption("file registry truncated".into()));
            }
            let name = String::from_utf8(buf[..name_len].to_vec())
                .map_err(|_| StorageError::Corruption("file registry bad name".into()))?;
            buf.advance(name_len);
            names.push((name, id));
        }

        Ok(NameRegistry {
            names,
            booked: HashSet::new(),
            next_id,
        })
    }

    fn persist_registry(&self, reg: &NameRegistry) -> Result<()> {
        let mut body = Vec::new();
        body.put_u32(REGISTRY_MAGIC);
        body.put_u32(reg.next_id);
        body.put_u32(reg.names.len() as u32);
        for (name, id) in &reg.names {
            body.put_u32(*id);
            body.put_u16(name.len() as u16);
            body.put_slice(name.as_bytes());
        }
        let crc = crc32fast::hash(&body);
        body.put_u32(crc);

        let path = Self::registry_path(&self.root);
        let tmp = path.with_extension("map.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&body)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PAGE: usize = 4096;

    #[test]
    fn test_book_and_add_file() {
        let dir = TempDir::new().unwrap();
        let fm = FileManager::open(dir.path(), PAGE).unwrap();

        let id = fm.book_file_id("users.idx").unwrap();
        assert!(!fm.exists("users.idx"));
        fm.add_file("users.idx", id).unwrap();
        assert!(fm.exists("users.idx"));
        assert_eq!(fm.open_file("users.idx").unwrap(), id);
        assert_eq!(fm.filled_up_to(id).unwrap(), 0);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let dir = TempDir::new().unwrap();
        let fm = FileManager::open(dir.path(), PAGE).unwrap();
        fm.add_new_file("a.idx").unwrap();
        assert!(matches!(
            fm.add_new_file("a.idx"),
            Err(StorageError::FileAlreadyExists(_))
        ));
    }

    #[test]
    fn test_page_roundtrip_with_crc() {
        let dir = TempDir::new().unwrap();
        let fm = FileManager::open(dir.path(), PAGE).unwrap();
        let id = fm.add_new_file("data.idx").unwrap();

        let index = fm.extend_file(id).unwrap();
        let mut page = vec![0u8; PAGE];
        page[100] = 0xAB;
        fm.write_page(id, index, &mut page).unwrap();

        let mut read = vec![0u8; PAGE];
        fm.read_page(id, index, &mut read).unwrap();
        assert_eq!(read[100], 0xAB);
    }

    #[test]
    fn test_corrupt_page_detected() {
        let dir = TempDir::new().unwrap();
        let fm = FileManager::open(dir.path(), PAGE).unwrap();
        let id = fm.add_new_file("data.idx").unwrap();
        let index = fm.extend_file(id).unwrap();
        let mut page = vec![0u8; PAGE];
        page[500] = 7;
        fm.write_page(id, index, &mut page).unwrap();

        // Flip a byte behind the manager's back.
        let path = dir.path().join("data.idx");
        let mut raw = fs::read(&path).unwrap();
        raw[500] ^= 0xFF;
        fs::write(&path, &raw).unwrap();

        // Reopen so the entry picks up the on-disk state.
        drop(fm);
        let fm = FileManager::open(dir.path(), PAGE).unwrap();
        let id = fm.open_file("data.idx").unwrap();
        let mut read = vec![0u8; PAGE];
        assert!(matches!(
            fm.read_page(id, 0, &mut read),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_read_past_end_is_contract_violation() {
        let dir = TempDir::new().unwrap();
        let fm = FileManager::open(dir.path(), PAGE).unwrap();
        let id = fm.add_new_file("data.idx").unwrap();
        let mut buf = vec![0u8; PAGE];
        assert!(matches!(
            fm.read_page(id, 0, &mut buf),
            Err(StorageError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_registry_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let fm = FileManager::open(dir.path(), PAGE).unwrap();
            fm.add_new_file("one.idx").unwrap();
            fm.add_new_file("two.idx").unwrap();
        }
        let fm = FileManager::open(dir.path(), PAGE).unwrap();
        assert!(fm.exists("one.idx"));
        assert!(fm.exists("two.idx"));
        let one = fm.open_file("one.idx").unwrap();
        let two = fm.open_file("two.idx").unwrap();
        assert_ne!(one, two);
    }

    #[test]
    fn test_delete_file_removes_backing_storage() {
        let dir = TempDir::new().unwrap();
        let fm = FileManager::open(dir.path(), PAGE).unwrap();
        let id = fm.add_new_file("gone.idx").unwrap();
        let index = fm.extend_file(id).unwrap();
        let mut page = vec![0u8; PAGE];
        fm.write_page(id, index, &mut page).unwrap();

        fm.delete_file(id).unwrap();
        assert!(!fm.exists("gone.idx"));
        assert!(!dir.path().join("gone.idx").exists());
    }
}
