// WAL record types.
//
// Every record is framed as: varint length (of kind + body), kind byte,
// body, CRC32 of kind + body. Page-operation bodies start with
// (operation id, file id, page index) and carry both the new state (redo)
// and the previous state (undo). The byte layout is part of the durable
// contract; fields are written big-endian.

use bytes::{Buf, BufMut};

use crate::buffer::CacheEntry;
use crate::common::{FileId, Lsn, OperationId, PageIndex};
use crate::error::{Result, StorageError};

// Record kind tags. Gaps leave room for future control records.
const KIND_ATOMIC_BEGIN: u8 = 1;
const KIND_ATOMIC_COMMIT: u8 = 2;
const KIND_ATOMIC_ROLLBACK: u8 = 3;
const KIND_FILE_CREATED: u8 = 4;
const KIND_FILE_DELETED: u8 = 5;
const KIND_CHECKPOINT: u8 = 6;
const KIND_SET_BYTE: u8 = 16;
const KIND_SET_SHORT: u8 = 17;
const KIND_SET_INT: u8 = 18;
const KIND_SET_LONG: u8 = 19;
const KIND_SET_BINARY: u8 = 20;
const KIND_COPY_BYTES: u8 = 21;

/// One write-ahead log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    AtomicBegin { op: OperationId },
    AtomicCommit { op: OperationId },
    AtomicRollback { op: OperationId },
    FileCreated { name: String, file_id: FileId },
    FileDeleted { file_id: FileId },
    Checkpoint,
    PageOp(PageOpRecord),
}

/// A page mutation: where it happened plus the kind-specific body. Every
/// page-op body starts with (operation id, file id, page index, previous
/// page LSN); the previous LSN lets recovery restore the exact pre-op
/// header when it undoes an uncommitted operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOpRecord {
    pub op: OperationId,
    pub file_id: FileId,
    pub page_index: PageIndex,
    pub prev_lsn: Lsn,
    pub kind: PageOpKind,
}

/// The mutation itself. Each variant carries enough state to redo the
/// change given the pre-state, and to undo it given the post-state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOpKind {
    SetByte { offset: u32, value: u8, prev: u8 },
    SetShort { offset: u32, value: u16, prev: u16 },
    SetInt { offset: u32, value: u32, prev: u32 },
    SetLong { offset: u32, value: u64, prev: u64 },
    SetBinary { offset: u32, value: Vec<u8>, prev: Vec<u8> },
    /// Intra-page move of `len` bytes from `src` to `dst`; `prev` holds the
    /// bytes overwritten at `dst`.
    CopyBytes { src: u32, dst: u32, len: u32, prev: Vec<u8> },
}

impl PageOpRecord {
    /// Apply the forward mutation. The page must be in exactly the state it
    /// had when the record was emitted.
    pub fn redo(&self, page: &CacheEntry) {
        match &self.kind {
            PageOpKind::SetByte { offset, value, .. } => {
                page.write_bytes(*offset as usize, &[*value]);
            }
            PageOpKind::SetShort { offset, value, .. } => {
                page.write_bytes(*offset as usize, &value.to_be_bytes());
            }
            PageOpKind::SetInt { offset, value, .. } => {
                page.write_bytes(*offset as usize, &value.to_be_bytes());
            }
            PageOpKind::SetLong { offset, value, .. } => {
                page.write_bytes(*offset as usize, &value.to_be_bytes());
            }
            PageOpKind::SetBinary { offset, value, .. } => {
                page.write_bytes(*offset as usize, value);
            }
            PageOpKind::CopyBytes { src, dst, len, .. } => {
                page.copy_within(*src as usize, *dst as usize, *len as usize);
            }
        }
    }

    /// Reverse the mutation, restoring the previous bytes.
    pub fn undo(&self, page: &CacheEntry) {
        match &self.kind {
            PageOpKind::SetByte { offset, prev, .. } => {
                page.write_bytes(*offset as usize, &[*prev]);
            }
            PageOpKind::SetShort { offset, prev, .. } => {
                page.write_bytes(*offset as usize, &prev.to_be_bytes());
            }
            PageOpKind::SetInt { offset, prev, .. } => {
                page.write_bytes(*offset as usize, &prev.to_be_bytes());
            }
            PageOpKind::SetLong { offset, prev, .. } => {
                page.write_bytes(*offset as usize, &prev.to_be_bytes());
            }
            PageOpKind::SetBinary { offset, prev, .. } => {
                page.write_bytes(*offset as usize, prev);
            }
            PageOpKind::CopyBytes { dst, prev, .. } => {
                page.write_bytes(*dst as usize, prev);
            }
        }
    }
}

impl WalRecord {
    pub fn kind(&self) -> u8 {
        match self {
            WalRecord::AtomicBegin { .. } => KIND_ATOMIC_BEGIN,
            WalRecord::AtomicCommit { .. } => KIND_ATOMIC_COMMIT,
            WalRecord::AtomicRollback { .. } => KIND_ATOMIC_ROLLBACK,
            WalRecord::FileCreated { .. } => KIND_FILE_CREATED,
            WalRecord::FileDeleted { .. } => KIND_FILE_DELETED,
            WalRecord::Checkpoint => KIND_CHECKPOINT,
            WalRecord::PageOp(rec) => match rec.kind {
                PageOpKind::SetByte { .. } => KIND_SET_BYTE,
                PageOpKind::SetShort { .. } => KIND_SET_SHORT,
                PageOpKind::SetInt { .. } => KIND_SET_INT,
                PageOpKind::SetLong { .. } => KIND_SET_LONG,
                PageOpKind::SetBinary { .. } => KIND_SET_BINARY,
                PageOpKind::CopyBytes { .. } => KIND_COPY_BYTES,
            },
        }
    }

    /// Size of the body (kind byte excluded).
    pub fn serialized_size(&self) -> usize {
        match self {
            WalRecord::AtomicBegin { .. }
            | WalRecord::AtomicCommit { .. }
            | WalRecord::AtomicRollback { .. } => 8,
            WalRecord::FileCreated { name, .. } => 2 + name.len() + 4,
            WalRecord::FileDeleted { .. } => 4,
            WalRecord::Checkpoint => 0,
            WalRecord::PageOp(rec) => {
                let head = 8 + 4 + 8 + 8;
                head + match &rec.kind {
                    PageOpKind::SetByte { .. } => 4 + 1 + 1,
                    PageOpKind::SetShort { .. } => 4 + 2 + 2,
                    PageOpKind::SetInt { .. } => 4 + 4 + 4,
                    PageOpKind::SetLong { .. } => 4 + 8 + 8,
                    PageOpKind::SetBinary { value, prev, .. } => 4 + 4 + value.len() + 4 + prev.len(),
                    PageOpKind::CopyBytes { prev, .. } => 4 + 4 + 4 + prev.len(),
                }
            }
        }
    }

    /// Serialize the body (kind byte excluded) into `buf`.
    pub fn to_stream(&self, buf: &mut impl BufMut) {
        match self {
            WalRecord::AtomicBegin { op }
            | WalRecord::AtomicCommit { op }
            | WalRecord::AtomicRollback { op } => {
                buf.put_u64(*op);
            }
            WalRecord::FileCreated { name, file_id } => {
                buf.put_u16(name.len() as u16);
                buf.put_slice(name.as_bytes());
                buf.put_u32(*file_id);
            }
            WalRecord::FileDeleted { file_id } => {
                buf.put_u32(*file_id);
            }
            WalRecord::Checkpoint => {}
            WalRecord::PageOp(rec) => {
                buf.put_u64(rec.op);
                buf.put_u32(rec.file_id);
                buf.put_u64(rec.page_index);
                buf.put_u64(rec.prev_lsn.0);
                match &rec.kind {
                    PageOpKind::SetByte {
                        offset,
                        value,
                        prev,
                    } => {
                        buf.put_u32(*offset);
                        buf.put_u8(*value);
                        buf.put_u8(*prev);
                    }
                    PageOpKind::SetShort {
                        offset,
                        value,
                        prev,
                    } => {
                        buf.put_u32(*offset);
                        buf.put_u16(*value);
                        buf.put_u16(*prev);
                    }
                    PageOpKind::SetInt {
                        offset,
                        value,
                        prev,
                    } => {
                        buf.put_u32(*offset);
                        buf.put_u32(*value);
                        buf.put_u32(*prev);
                    }
                    PageOpKind::SetLong {
                        offset,
                        value,
                        prev,
                    } => {
                        buf.put_u32(*offset);
                        buf.put_u64(*value);
                        buf.put_u64(*prev);
                    }
                    PageOpKind::SetBinary {
                        offset,
                        value,
                        prev,
                    } => {
                        buf.put_u32(*offset);
                        buf.put_u32(value.len() as u32);
                        buf.put_slice(value);
                        buf.put_u32(prev.len() as u32);
                        buf.put_slice(prev);
                    }
                    PageOpKind::CopyBytes {
                        src,
                        dst,
                        len,
                        prev,
                    } => {
                        buf.put_u32(*src);
                        buf.put_u32(*dst);
                        buf.put_u32(*len);
                        buf.put_slice(prev);
                    }
                }
            }
        }
    }

    /// Decode a record body given its kind byte.
    pub fn from_stream(kind: u8, buf: &mut impl Buf) -> Result<WalRecord> {
        let record = match kind {
            KIND_ATOMIC_BEGIN => WalRecord::AtomicBegin {
                op: get_u64(buf, "atomic-begin op")?,
            },
            KIND_ATOMIC_COMMIT => WalRecord::AtomicCommit {
                op: get_u64(buf, "atomic-commit op")?,
            },
            KIND_ATOMIC_ROLLBACK => WalRecord::AtomicRollback {
                op: get_u64(buf, "atomic-rollback op")?,
            },
            KIND_FILE_CREATED => {
                let name_len = get_u16(buf, "file name length")? as usize;
                if buf.remaining() < name_len {
                    return Err(truncated("file name"));
                }
                let mut name_bytes = vec![0u8; name_len];
                buf.copy_to_slice(&mut name_bytes);
                let name = String::from_utf8(name_bytes)
                    .map_err(|_| StorageError::Corruption("file name is not UTF-8".into()))?;
                WalRecord::FileCreated {
                    name,
                    file_id: get_u32(buf, "file id")?,
                }
            }
            KIND_FILE_DELETED => WalRecord::FileDeleted {
                file_id: get_u32(buf, "file id")?,
            },
            KIND_CHECKPOINT => WalRecord::Checkpoint,
            KIND_SET_BYTE | KIND_SET_SHORT | KIND_SET_INT | KIND_SET_LONG | KIND_SET_BINARY
            | KIND_COPY_BYTES => {
                let op = get_u64(buf, "page-op operation id")?;
                let file_id = get_u32(buf, "page-op file id")?;
                let page_index = get_u64(buf, "page-op page index")?;
                let prev_lsn = Lsn(get_u64(buf, "page-op previous LSN")?);
                let op_kind = match kind {
                    KIND_SET_BYTE => PageOpKind::SetByte {
                        offset: get_u32(buf, "offset")?,
                        value: get_u8(buf, "value")?,
                        prev: get_u8(buf, "prev")?,
                    },
                    KIND_SET_SHORT => PageOpKind::SetShort {
                        offset: get_u32(buf, "offset")?,
                        value: get_u16(buf, "value")?,
                        prev: get_u16(buf, "prev")?,
                    },
                    KIND_SET_INT => PageOpKind::SetInt {
                        offset: get_u32(buf, "offset")?,
                        value: get_u32(buf, "value")?,
                        prev: get_u32(buf, "prev")?,
                    },
                    KIND_SET_LONG => PageOpKind::SetLong {
                        offset: get_u32(buf, "offset")?,
                        value: get_u64(buf, "value")?,
                        prev: get_u64(buf, "prev")?,
                    },
                    KIND_SET_BINARY => {
                        let offset = get_u32(buf, "offset")?;
                        let value = get_blob(buf, "value")?;
                        let prev = get_blob(buf, "prev")?;
                        PageOpKind::SetBinary {
                            offset,
                            value,
                            prev,
                        }
                    }
                    KIND_COPY_BYTES => {
                        let src = get_u32(buf, "src")?;
                        let dst = get_u32(buf, "dst")?;
                        let len = get_u32(buf, "len")?;
                        if buf.remaining() < len as usize {
                            return Err(truncated("copy prev bytes"));
                        }
                        let mut prev = vec![0u8; len as usize];
                        buf.copy_to_slice(&mut prev);
                        PageOpKind::CopyBytes {
                            src,
                            dst,
                            len,
                            prev,
                        }
                    }
                    _ => unreachable!(),
                };
                WalRecord::PageOp(PageOpRecord {
                    op,
                    file_id,
                    page_index,
                    prev_lsn,
                    kind: op_kind,
                })
            }
            other => {
                return Err(StorageError::Corruption(format!(
                    "unknown WAL record kind {other}"
                )))
            }
        };
        Ok(record)
    }

    pub fn operation_id(&self) -> Option<OperationId> {
        match self {
            WalRecord::AtomicBegin { op }
            | WalRecord::AtomicCommit { op }
            | WalRecord::AtomicRollback { op } => Some(*op),
            WalRecord::PageOp(rec) => Some(rec.op),
            _ => None,
        }
    }
}

fn truncated(what: &str) -> StorageError {
    StorageError::Corruption(format!("truncated WAL record: {what}"))
}

fn get_u8(buf: &mut impl Buf, what: &str) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(truncated(what));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut impl Buf, what: &str) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(truncated(what));
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut impl Buf, what: &str) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(truncated(what));
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut impl Buf, what: &str) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(truncated(what));
    }
    Ok(buf.get_u64())
}

fn get_blob(buf: &mut impl Buf, what: &str) -> Result<Vec<u8>> {
    let len = get_u32(buf, what)? as usize;
    if buf.remaining() < len {
        return Err(truncated(what));
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// LEB128 unsigned varint.
pub fn write_varint(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

pub fn read_varint(buf: &mut impl Buf) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if buf.remaining() == 0 {
            return Err(truncated("varint"));
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(StorageError::Corruption("varint overflow".into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record: WalRecord) {
        let mut buf = Vec::new();
        record.to_stream(&mut buf);
        assert_eq!(buf.len(), record.serialized_size());
        let decoded = WalRecord::from_stream(record.kind(), &mut buf.as_slice()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_control_record_roundtrip() {
        roundtrip(WalRecord::AtomicBegin { op: 7 });
        roundtrip(WalRecord::AtomicCommit { op: 7 });
        roundtrip(WalRecord::AtomicRollback { op: 9 });
        roundtrip(WalRecord::FileCreated {
            name: "users.idx".into(),
            file_id: 3,
        });
        roundtrip(WalRecord::FileDeleted { file_id: 3 });
        roundtrip(WalRecord::Checkpoint);
    }

    #[test]
    fn test_page_op_roundtrip() {
        roundtrip(WalRecord::PageOp(PageOpRecord {
            op: 11,
            file_id: 2,
            page_index: 40,
            prev_lsn: Lsn::new(1, 16),
            kind: PageOpKind::SetLong {
                offset: 16,
                value: 0xDEAD,
                prev: 0xBEEF,
            },
        }));
        roundtrip(WalRecord::PageOp(PageOpRecord {
            op: 11,
            file_id: 2,
            page_index: 40,
            prev_lsn: Lsn::new(1, 48),
            kind: PageOpKind::SetBinary {
                offset: 128,
                value: vec![1, 2, 3, 4],
                prev: vec![9, 9, 9, 9],
            },
        }));
        roundtrip(WalRecord::PageOp(PageOpRecord {
            op: 12,
            file_id: 1,
            page_index: 0,
            prev_lsn: Lsn::ZERO,
            kind: PageOpKind::CopyBytes {
                src: 100,
                dst: 200,
                len: 3,
                prev: vec![5, 6, 7],
            },
        }));
    }

    #[test]
    fn test_unknown_kind_is_corruption() {
        let err = WalRecord::from_stream(200, &mut [0u8; 8].as_slice()).unwrap_err();
        assert!(matches!(err, StorageError::Corruption(_)));
    }

    #[test]
    fn test_varint_roundtrip() {
        for v in [0u64, 1, 127, 128, 300, 65_535, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            assert_eq!(read_varint(&mut buf.as_slice()).unwrap(), v);
        }
    }
}
