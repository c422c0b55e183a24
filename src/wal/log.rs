// # Write-Ahead Log
//
// Append-only segmented log. Segments are numbered from 1
// (`<base>.<n>.seg`); a record is never split across segments. The LSN of
// a record is (segment, offset of its first byte). `flush` makes the log
// durable through the last assigned LSN. A small side file
// (`<base>.cpm`) remembers the LSN of the last checkpoint record so
// recovery can skip the log prefix.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BufMut;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::common::Lsn;
use crate::error::{Result, StorageError};
use crate::wal::record::{write_varint, WalRecord};

const CPM_MAGIC: u32 = 0x5056_4350; // "PVCP"

struct WalInner {
    segment_index: u32,
    segment_file: File,
    /// Next write offset within the active segment.
    position: u32,
    last_lsn: Lsn,
}

pub struct WriteAheadLog {
    dir: PathBuf,
    base: String,
    segment_size: u64,
    inner: Mutex<WalInner>,
    flushed: AtomicU64,
}

impl WriteAheadLog {
    /// Open (or create) the log under `dir`. Existing segments are scanned
    /// so appends continue after the last intact record; a torn tail is
    /// discarded.
    pub fn open(dir: impl Into<PathBuf>, base: &str, segment_size: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let segments = Self::list_segments(&dir, base)?;
        let (segment_index, position, last_lsn) = match segments.last() {
            None => (1u32, 0u32, Lsn::ZERO),
            Some(&last) => {
                let (end, last_lsn) = Self::scan_segment_end(&dir, base, last)?;
                (last, end, last_lsn)
            }
        };

        let segment_file = Self::open_segment(&dir, base, segment_index)?;
        // Anything past the last intact record is a torn tail from a crash.
        segment_file.set_len(position as u64)?;

        let log = Self {
            dir,
            base: base.to_string(),
            segment_size,
            inner: Mutex::new(WalInner {
                segment_index,
                segment_file,
                position,
                last_lsn,
            }),
            flushed: AtomicU64::new(last_lsn.0),
        };
        Ok(log)
    }

    /// Append a record and return its LSN. The bytes reach the OS
    /// immediately but are only durable after `flush`.
    pub fn log(&self, record: &WalRecord) -> Result<Lsn> {
        let body_len = 1 + record.serialized_size();
        let mut frame = Vec::with_capacity(body_len + 9);
        write_varint(&mut frame, body_len as u64);
        let body_start = frame.len();
        frame.put_u8(record.kind());
        record.to_stream(&mut frame);
        let crc = crc32fast::hash(&frame[body_start..]);
        frame.put_u32(crc);

        let mut inner = self.inner.lock();
        if inner.position as u64 + frame.len() as u64 > self.segment_size && inner.position > 0 {
            self.roll_segment(&mut inner)?;
        }
        let lsn = Lsn::new(inner.segment_index, inner.position);
        let seek_pos = inner.position as u64;
        inner
            .segment_file
            .seek(SeekFrom::Start(seek_pos))?;
        inner.segment_file.write_all(&frame)?;
        inner.position += frame.len() as u32;
        inner.last_lsn = lsn;
        Ok(lsn)
    }

    /// Make the log durable through the latest assigned LSN.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.segment_file.sync_data()?;
        self.flushed.store(inner.last_lsn.0, Ordering::Release);
        Ok(())
    }

    pub fn flushed_lsn(&self) -> Lsn {
        Lsn(self.flushed.load(Ordering::Acquire))
    }

    pub fn end_lsn(&self) -> Lsn {
        self.inner.lock().last_lsn
    }

    /// Iterate records in LSN order starting at `from` (`Lsn::ZERO` means
    /// the whole log). Iteration ends cleanly at a torn tail.
    pub fn read_forward(&self, from: Lsn) -> Result<WalIterator> {
        // Flush pending appends so the reader sees them.
        self.inner.lock().segment_file.flush()?;
        let segments = Self::list_segments(&self.dir, &self.base)?;
        let start_segment = if from == Lsn::ZERO { 1 } else { from.segment() };
        WalIterator::new(
            self.dir.clone(),
            self.base.clone(),
            segments,
            start_segment,
            if from == Lsn::ZERO { 0 } else { from.offset() },
        )
    }

    /// Record a checkpoint: append the record, flush, and persist its LSN
    /// in the checkpoint master file (write-temp + rename).
    pub fn write_checkpoint(&self) -> Result<Lsn> {
        let lsn = self.log(&WalRecord::Checkpoint)?;
        self.flush()?;

        let mut body = Vec::with_capacity(16);
        body.put_u32(CPM_MAGIC);
        body.put_u64(lsn.0);
        let crc = crc32fast::hash(&body);
        body.put_u32(crc);

        let path = self.checkpoint_path();
        let tmp = path.with_extension("cpm.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&body)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        debug!(%lsn, "checkpoint written");
        Ok(lsn)
    }

    /// LSN of the last durable checkpoint, if the master file is intact.
    pub fn last_checkpoint(&self) -> Option<Lsn> {
        let data = fs::read(self.checkpoint_path()).ok()?;
        if data.len() != 16 {
            return None;
        }
        let stored_crc = u32::from_be_bytes(data[12..16].try_into().ok()?);
        if crc32fast::hash(&data[..12]) != stored_crc {
            warn!("checkpoint master file corrupt; scanning full log");
            return None;
        }
        if u32::from_be_bytes(data[0..4].try_into().ok()?) != CPM_MAGIC {
            return None;
        }
        Some(Lsn(u64::from_be_bytes(data[4..12].try_into().ok()?)))
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.dir.join(format!("{}.cpm", self.base))
    }

    fn roll_segment(&self, inner: &mut WalInner) -> Result<()> {
        inner.segment_file.sync_data()?;
        inner.segment_index += 1;
        inner.segment_file = Self::open_segment(&self.dir, &self.base, inner.segment_index)?;
        inner.position = 0;
        debug!(segment = inner.segment_index, "WAL segment rolled");
        Ok(())
    }

    fn segment_path(dir: &Path, base: &str, index: u32) -> PathBuf {
        dir.join(format!("{base}.{index}.seg"))
    }

    fn open_segment(dir: &Path, base: &str, index: u32) -> Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(Self::segment_path(dir, base, index))?)
    }

    fn list_segments(dir: &Path, base: &str) -> Result<Vec<u32>> {
        let prefix = format!("{base}.");
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(rest) = name.strip_prefix(&prefix) {
                if let Some(idx) = rest.strip_suffix(".seg") {
                    if let Ok(idx) = idx.parse::<u32>() {
                        out.push(idx);
                    }
                }
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Find the end of the last intact record in a segment.
    fn scan_segment_end(dir: &Path, base: &str, index: u32) -> Result<(u32, Lsn)> {
        let file = File::open(Self::segment_path(dir, base, index))?;
        let mut reader = SegmentReader::new(file, index, 0);
        let mut end = 0u32;
        let mut last_lsn = if index > 1 {
            // Records exist in earlier segments; their exact LSN does not
            // matter for append positioning.
            Lsn::new(index, 0)
        } else {
            Lsn::ZERO
        };
        loop {
            match reader.next_record()? {
                SegmentRead::Record(lsn, _) => {
                    last_lsn = lsn;
                    end = reader.position;
                }
                SegmentRead::End | SegmentRead::TornTail => break,
            }
        }
        Ok((end, last_lsn))
    }
}

/// What a segment reader found at its current position.
enum SegmentRead {
    Record(Lsn, WalRecord),
    /// Clean end of the segment.
    End,
    /// An incomplete frame, or a checksum-failing record with nothing
    /// readable after it: the torn tail of a crashed append. A checksum
    /// failure with further bytes behind it is real corruption and comes
    /// back as an error instead.
    TornTail,
}

/// Sequential reader over one segment with torn-tail detection.
struct SegmentReader {
    reader: BufReader<File>,
    segment: u32,
    position: u32,
}

impl SegmentReader {
    fn new(file: File, segment: u32, position: u32) -> Self {
        let mut reader = BufReader::new(file);
        let _ = reader.seek(SeekFrom::Start(position as u64));
        Self {
            reader,
            segment,
            position,
        }
    }

    fn next_record(&mut self) -> Result<SegmentRead> {
        let start = self.position;

        // Varint length, byte by byte.
        let mut len = 0u64;
        let mut shift = 0u32;
        let mut len_bytes = 0u32;
        loop {
            let mut byte = [0u8; 1];
            match self.reader.read_exact(&mut byte) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(if len_bytes == 0 {
                        SegmentRead::End
                    } else {
                        SegmentRead::TornTail
                    });
                }
                Err(e) => return Err(e.into()),
            }
            len_bytes += 1;
            len |= ((byte[0] & 0x7F) as u64) << shift;
            if byte[0] & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 64 || len_bytes > 10 {
                warn!(segment = self.segment, offset = start, "invalid WAL frame length");
                return Ok(SegmentRead::TornTail);
            }
        }

        if len == 0 || len > u32::MAX as u64 {
            warn!(segment = self.segment, offset = start, "invalid WAL frame length");
            return Ok(SegmentRead::TornTail);
        }

        let mut body = vec![0u8; len as usize];
        if self.reader.read_exact(&mut body).is_err() {
            return Ok(SegmentRead::TornTail);
        }
        let mut crc_buf = [0u8; 4];
        if self.reader.read_exact(&mut crc_buf).is_err() {
            return Ok(SegmentRead::TornTail);
        }
        let stored_crc = u32::from_be_bytes(crc_buf);
        if crc32fast::hash(&body) != stored_crc {
            // A torn append is only ever the last thing in the stream. A
            // bad checksum with intact bytes behind it means the middle of
            // the log rotted, and truncating there would drop real history.
            if !self.reader.fill_buf()?.is_empty() {
                return Err(StorageError::Corruption(format!(
                    "WAL record checksum mismatch at segment {} offset {start} \
                     with further records behind it",
                    self.segment
                )));
            }
            warn!(
                segment = self.segment,
                offset = start,
                "checksum mismatch on the final WAL record; treating as torn tail"
            );
            return Ok(SegmentRead::TornTail);
        }

        let kind = body[0];
        let mut cursor = &body[1..];
        let record = WalRecord::from_stream(kind, &mut cursor)?;

        self.position = start + len_bytes + len as u32 + 4;
        Ok(SegmentRead::Record(Lsn::new(self.segment, start), record))
    }
}

/// Forward iterator over the whole log.
pub struct WalIterator {
    dir: PathBuf,
    base: String,
    segments: Vec<u32>,
    next_segment_pos: usize,
    current: Option<SegmentReader>,
}

impl WalIterator {
    fn new(
        dir: PathBuf,
        base: String,
        segments: Vec<u32>,
        start_segment: u32,
        start_offset: u32,
    ) -> Result<Self> {
        let mut it = Self {
            dir,
            base,
            segments,
            next_segment_pos: 0,
            current: None,
        };
        // Skip segments before the starting LSN.
        while it.next_segment_pos < it.segments.len()
            && it.segments[it.next_segment_pos] < start_segment
        {
            it.next_segment_pos += 1;
        }
        if it.next_segment_pos < it.segments.len() {
            let seg = it.segments[it.next_segment_pos];
            it.next_segment_pos += 1;
            let offset = if seg == start_segment { start_offset } else { 0 };
            it.current = Some(it.open_reader(seg, offset)?);
        }
        Ok(it)
    }

    fn open_reader(&self, segment: u32, offset: u32) -> Result<SegmentReader> {
        let file = File::open(WriteAheadLog::segment_path(&self.dir, &self.base, segment))?;
        Ok(SegmentReader::new(file, segment, offset))
    }

    /// Next record in LSN order, or `None` at end of log. A broken record
    /// anywhere but the very tail of the log surfaces as corruption.
    pub fn next_record(&mut self) -> Result<Option<(Lsn, WalRecord)>> {
        loop {
            let Some(reader) = self.current.as_mut() else {
                return Ok(None);
            };
            match reader.next_record()? {
                SegmentRead::Record(lsn, record) => return Ok(Some((lsn, record))),
                SegmentRead::End => {
                    // Segment exhausted; move to the next one.
                    if self.next_segment_pos < self.segments.len() {
                        let seg = self.segments[self.next_segment_pos];
                        self.next_segment_pos += 1;
                        self.current = Some(self.open_reader(seg, 0)?);
                    } else {
                        self.current = None;
                    }
                }
                SegmentRead::TornTail => {
                    let segment = reader.segment;
                    self.current = None;
                    // Only the last segment may end in a torn append.
                    if self.next_segment_pos < self.segments.len() {
                        return Err(StorageError::Corruption(format!(
                            "WAL segment {segment} breaks off before the end of the log"
                        )));
                    }
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::record::{PageOpKind, PageOpRecord};
    use tempfile::TempDir;

    fn page_op(op: u64, page_index: u64) -> WalRecord {
        WalRecord::PageOp(PageOpRecord {
            op,
            file_id: 1,
            page_index,
            prev_lsn: Lsn::ZERO,
            kind: PageOpKind::SetLong {
                offset: 16,
                value: op,
                prev: 0,
            },
        })
    }

    #[test]
    fn test_log_and_read_forward() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path(), "test", 1 << 20).unwrap();

        let l1 = wal.log(&WalRecord::AtomicBegin { op: 1 }).unwrap();
        let l2 = wal.log(&page_op(1, 0)).unwrap();
        let l3 = wal.log(&WalRecord::AtomicCommit { op: 1 }).unwrap();
        assert!(l1 < l2 && l2 < l3);
        wal.flush().unwrap();
        assert_eq!(wal.flushed_lsn(), l3);

        let mut it = wal.read_forward(Lsn::ZERO).unwrap();
        let (lsn, rec) = it.next_record().unwrap().unwrap();
        assert_eq!(lsn, l1);
        assert_eq!(rec, WalRecord::AtomicBegin { op: 1 });
        let (lsn, _) = it.next_record().unwrap().unwrap();
        assert_eq!(lsn, l2);
        let (lsn, rec) = it.next_record().unwrap().unwrap();
        assert_eq!(lsn, l3);
        assert_eq!(rec, WalRecord::AtomicCommit { op: 1 });
        assert!(it.next_record().unwrap().is_none());
    }

    #[test]
    fn test_read_forward_from_middle() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path(), "test", 1 << 20).unwrap();
        wal.log(&page_op(1, 0)).unwrap();
        let from = wal.log(&page_op(2, 1)).unwrap();
        wal.log(&page_op(3, 2)).unwrap();

        let mut it = wal.read_forward(from).unwrap();
        let (lsn, _) = it.next_record().unwrap().unwrap();
        assert_eq!(lsn, from);
        let (_, rec) = it.next_record().unwrap().unwrap();
        assert_eq!(rec, page_op(3, 2));
        assert!(it.next_record().unwrap().is_none());
    }

    #[test]
    fn test_segment_roll() {
        let dir = TempDir::new().unwrap();
        // Tiny segments force a roll every couple of records.
        let wal = WriteAheadLog::open(dir.path(), "test", 128).unwrap();
        let mut lsns = Vec::new();
        for i in 0..20 {
            lsns.push(wal.log(&page_op(i, i)).unwrap());
        }
        assert!(lsns.last().unwrap().segment() > 1);
        for pair in lsns.windows(2) {
            assert!(pair[0] < pair[1]);
        }

        let mut it = wal.read_forward(Lsn::ZERO).unwrap();
        let mut count = 0;
        while let Some((lsn, _)) = it.next_record().unwrap() {
            assert_eq!(lsn, lsns[count]);
            count += 1;
        }
        assert_eq!(count, 20);
    }

    #[test]
    fn test_reopen_appends_after_last_record() {
        let dir = TempDir::new().unwrap();
        let l2;
        {
            let wal = WriteAheadLog::open(dir.path(), "test", 1 << 20).unwrap();
            wal.log(&page_op(1, 0)).unwrap();
            l2 = wal.log(&page_op(2, 1)).unwrap();
            wal.flush().unwrap();
        }
        let wal = WriteAheadLog::open(dir.path(), "test", 1 << 20).unwrap();
        let l3 = wal.log(&page_op(3, 2)).unwrap();
        assert!(l3 > l2);

        let mut it = wal.read_forward(Lsn::ZERO).unwrap();
        let mut count = 0;
        while it.next_record().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_torn_tail_discarded_on_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let wal = WriteAheadLog::open(dir.path(), "test", 1 << 20).unwrap();
            wal.log(&page_op(1, 0)).unwrap();
            wal.flush().unwrap();
        }
        // Append garbage simulating a torn write.
        let seg = dir.path().join("test.1.seg");
        let mut raw = fs::read(&seg).unwrap();
        raw.extend_from_slice(&[0x55, 0x20, 0x01]);
        fs::write(&seg, &raw).unwrap();

        let wal = WriteAheadLog::open(dir.path(), "test", 1 << 20).unwrap();
        let mut it = wal.read_forward(Lsn::ZERO).unwrap();
        assert!(it.next_record().unwrap().is_some());
        assert!(it.next_record().unwrap().is_none());

        // New appends land where the intact log ended.
        let lsn = wal.log(&page_op(2, 1)).unwrap();
        let mut it = wal.read_forward(lsn).unwrap();
        let (got, rec) = it.next_record().unwrap().unwrap();
        assert_eq!(got, lsn);
        assert_eq!(rec, page_op(2, 1));
    }

    #[test]
    fn test_mid_segment_corruption_is_an_error() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path(), "test", 1 << 20).unwrap();
        wal.log(&page_op(1, 0)).unwrap();
        let second = wal.log(&page_op(2, 1)).unwrap();
        wal.log(&page_op(3, 2)).unwrap();
        wal.flush().unwrap();

        // Flip the first record's trailing checksum byte. Intact records
        // follow it, so this must not read as a clean end of log.
        let seg = dir.path().join("test.1.seg");
        let mut raw = fs::read(&seg).unwrap();
        raw[second.offset() as usize - 1] ^= 0xFF;
        fs::write(&seg, &raw).unwrap();

        let mut it = wal.read_forward(Lsn::ZERO).unwrap();
        assert!(matches!(
            it.next_record(),
            Err(crate::error::StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_broken_tail_of_earlier_segment_is_corruption() {
        let dir = TempDir::new().unwrap();
        // 54-byte frames, 128-byte segments: two records per segment.
        let wal = WriteAheadLog::open(dir.path(), "test", 128).unwrap();
        wal.log(&page_op(1, 0)).unwrap();
        wal.log(&page_op(2, 1)).unwrap();
        let third = wal.log(&page_op(3, 2)).unwrap();
        assert_eq!(third.segment(), 2);
        wal.flush().unwrap();

        // Corrupt the last record of segment 1. Nothing follows it inside
        // that segment, but segment 2 does, so this is not a torn tail.
        let seg = dir.path().join("test.1.seg");
        let mut raw = fs::read(&seg).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&seg, &raw).unwrap();

        let mut it = wal.read_forward(Lsn::ZERO).unwrap();
        assert!(it.next_record().unwrap().is_some());
        assert!(matches!(
            it.next_record(),
            Err(crate::error::StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_checkpoint_marker_roundtrip() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path(), "test", 1 << 20).unwrap();
        assert!(wal.last_checkpoint().is_none());
        wal.log(&page_op(1, 0)).unwrap();
        let cp = wal.write_checkpoint().unwrap();
        assert_eq!(wal.last_checkpoint(), Some(cp));
    }
}
