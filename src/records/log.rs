//! Append-only data file.

use super::fio;
use crate::error::{Result, StoreError};
use crate::types::{BlobType, IndexEntry, Key, RecordFlags, KEY_SIZE};
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Magic bytes for data records.
const RECORD_MAGIC: &[u8; 4] = b"EBL\0";

/// Current record format version.
const RECORD_VERSION: u8 = 1;

/// Fixed record header size.
pub const RECORD_HEADER_SIZE: u64 = 8 + KEY_SIZE as u64 + 8 + 8 + 8 + 8; // magic/version + key + type + flags + generation + size

/// Trailing CRC32 of the payload.
pub const RECORD_FOOTER_SIZE: u64 = 4;

/// Header written in front of every payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: Key,
    pub blob_type: BlobType,
    pub flags: RecordFlags,
    pub generation: u64,
    pub size: u64,
}

impl RecordHeader {
    /// Bytes this record occupies on disk, header and footer included.
    pub fn disk_size(&self) -> u64 {
        RECORD_HEADER_SIZE + self.size + RECORD_FOOTER_SIZE
    }

    pub fn is_removed(&self) -> bool {
        self.flags.contains(RecordFlags::REMOVED)
    }

    pub fn entry_at(&self, offset: u64) -> IndexEntry {
        IndexEntry {
            key: self.key,
            blob_type: self.blob_type,
            flags: self.flags,
            offset,
            size: self.size,
            generation: self.generation,
        }
    }

    fn encode(&self) -> [u8; RECORD_HEADER_SIZE as usize] {
        let mut buf = [0u8; RECORD_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(RECORD_MAGIC);
        buf[4] = RECORD_VERSION;
        buf[8..72].copy_from_slice(&self.key.0);
        buf[72..76].copy_from_slice(&self.blob_type.0.to_le_bytes());
        buf[80..88].copy_from_slice(&self.flags.0.to_le_bytes());
        buf[88..96].copy_from_slice(&self.generation.to_le_bytes());
        buf[96..104].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; RECORD_HEADER_SIZE as usize]) -> Result<Self> {
        if &buf[0..4] != RECORD_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid record magic".into()));
        }
        if buf[4] != RECORD_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported record version: {}",
                buf[4]
            )));
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&buf[8..72]);

        Ok(Self {
            key: Key(key),
            blob_type: BlobType(u32::from_le_bytes(le_array(&buf[72..76]))),
            flags: RecordFlags(u64::from_le_bytes(le_array(&buf[80..88]))),
            generation: u64::from_le_bytes(le_array(&buf[88..96])),
            size: u64::from_le_bytes(le_array(&buf[96..104])),
        })
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut arr = [0u8; N];
    arr.copy_from_slice(bytes);
    arr
}

/// Outcome of scanning a range of the data file.
pub struct ScanResult {
    /// Every record found, in append order, with its header offset.
    pub records: Vec<(u64, RecordHeader)>,
    /// End of the last complete record.
    pub valid_end: u64,
}

/// Append-only data file.
pub struct DataLog {
    /// Path to the data file.
    path: PathBuf,

    /// Current file handle. Replaced wholesale by `rewrite`.
    file: RwLock<Arc<File>>,

    /// Append cursor. Held for the duration of an append.
    file_size: Mutex<u64>,

    /// Whether appends happened since the last sync.
    dirty: AtomicBool,

    /// fsync after every append.
    sync_every_write: bool,
}

impl DataLog {
    /// Open or create the data file.
    pub fn open(path: impl AsRef<Path>, sync_every_write: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();

        Ok(Self {
            path,
            file: RwLock::new(Arc::new(file)),
            file_size: Mutex::new(file_size),
            dirty: AtomicBool::new(false),
            sync_every_write,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file handle.
    pub fn file(&self) -> Arc<File> {
        Arc::clone(&self.file.read())
    }

    /// Logical size of the data file.
    pub fn size(&self) -> u64 {
        *self.file_size.lock()
    }

    /// Append a record, returning the offset of its header.
    pub fn append(&self, header: &RecordHeader, data: &[u8]) -> Result<u64> {
        debug_assert_eq!(header.size, data.len() as u64);

        let mut buf = Vec::with_capacity(header.disk_size() as usize);
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(data);
        buf.extend_from_slice(&crc32fast::hash(data).to_le_bytes());

        let mut file_size = self.file_size.lock();
        let offset = *file_size;
        let file = self.file();

        fio::write_all_at(&file, &buf, offset)?;
        if self.sync_every_write {
            file.sync_data()?;
        } else {
            self.dirty.store(true, Ordering::Release);
        }

        *file_size = offset + buf.len() as u64;
        Ok(offset)
    }

    /// Read the record header at `offset`.
    pub fn read_header(&self, offset: u64) -> Result<RecordHeader> {
        let mut buf = [0u8; RECORD_HEADER_SIZE as usize];
        fio::read_exact_at(&self.file(), &mut buf, offset)?;
        RecordHeader::decode(&buf)
    }

    /// Read `len` payload bytes starting `pos` bytes into the record at `entry`.
    pub fn read_data(&self, entry: &IndexEntry, pos: u64, len: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        fio::read_exact_at(&self.file(), &mut buf, entry.offset + RECORD_HEADER_SIZE + pos)?;
        Ok(buf)
    }

    /// Read the full payload of `entry` and check it against the stored CRC.
    pub fn read_verified(&self, entry: &IndexEntry) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; (entry.size + RECORD_FOOTER_SIZE) as usize];
        fio::read_exact_at(&self.file(), &mut buf, entry.offset + RECORD_HEADER_SIZE)?;

        let footer = buf.split_off(entry.size as usize);
        let expected = u32::from_le_bytes(le_array(&footer));
        let got = crc32fast::hash(&buf);
        if expected != got {
            return Err(StoreError::ChecksumMismatch { expected, got });
        }
        Ok(buf)
    }

    /// Scan records in `[start, end)`.
    ///
    /// A record cut short by the end of the range, or a zero-filled tail, is
    /// torn: the scan stops there and reports everything before it as valid.
    /// An unreadable header followed by anything else is `Corruption`.
    pub fn scan(&self, start: u64, end: u64) -> Result<ScanResult> {
        let mut records = Vec::new();
        let mut offset = start;

        while offset < end {
            if end - offset < RECORD_HEADER_SIZE + RECORD_FOOTER_SIZE {
                warn!(offset, end, "short record header at data file tail");
                break;
            }
            let header = match self.read_header(offset) {
                Ok(h) => h,
                Err(StoreError::InvalidFormat(msg)) => {
                    if self.is_zeroed(offset, end)? {
                        warn!(offset, end, "zero-filled tail in data file");
                        break;
                    }
                    return Err(StoreError::Corruption(format!(
                        "{} at offset {} with {} bytes following",
                        msg,
                        offset,
                        end - offset
                    )));
                }
                Err(e) => return Err(e),
            };
            if header.size > end - offset - RECORD_HEADER_SIZE - RECORD_FOOTER_SIZE {
                warn!(offset, size = header.size, "record runs past data file end");
                break;
            }
            let next = offset + header.disk_size();
            records.push((offset, header));
            offset = next;
        }

        Ok(ScanResult {
            records,
            valid_end: offset,
        })
    }

    /// Whether `[start, end)` holds nothing but zero bytes.
    fn is_zeroed(&self, start: u64, end: u64) -> Result<bool> {
        let file = self.file();
        let mut buf = vec![0u8; 64 * 1024];
        let mut pos = start;
        while pos < end {
            let len = (end - pos).min(buf.len() as u64) as usize;
            fio::read_exact_at(&file, &mut buf[..len], pos)?;
            if buf[..len].iter().any(|b| *b != 0) {
                return Ok(false);
            }
            pos += len as u64;
        }
        Ok(true)
    }

    /// Drop everything past `len`.
    pub fn truncate(&self, len: u64) -> Result<()> {
        let mut file_size = self.file_size.lock();
        let file = self.file();
        file.set_len(len)?;
        file.sync_all()?;
        *file_size = len;
        Ok(())
    }

    /// Flush appended data to disk if anything changed.
    pub fn sync(&self) -> Result<()> {
        if self.dirty.swap(false, Ordering::AcqRel) {
            self.file().sync_data()?;
        }
        Ok(())
    }

    /// Scratch file a defragmentation writes before swapping it in.
    fn defrag_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".defrag");
        PathBuf::from(name)
    }

    /// Copy `entries` into a fresh data file and swap it in.
    ///
    /// Returns the entries with their new offsets, in the same order. The
    /// caller must keep every other append and index update out while this runs.
    pub fn rewrite(&self, entries: &[IndexEntry]) -> Result<Vec<IndexEntry>> {
        let mut file_size = self.file_size.lock();
        let old = self.file();
        let tmp_path = self.defrag_path();

        let tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(tmp);

        let mut moved = Vec::with_capacity(entries.len());
        let mut offset = 0u64;
        for entry in entries {
            let disk_size = RECORD_HEADER_SIZE + entry.size + RECORD_FOOTER_SIZE;
            let mut buf = vec![0u8; disk_size as usize];
            fio::read_exact_at(&old, &mut buf, entry.offset)?;
            writer.write_all(&buf)?;

            moved.push(IndexEntry { offset, ..*entry });
            offset += disk_size;
        }

        let tmp = writer.into_inner().map_err(|e| StoreError::Io(e.into_error()))?;
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;

        debug!(path = %self.path.display(), old_size = *file_size, new_size = offset, "data file rewritten");

        *self.file.write() = Arc::new(file);
        *file_size = offset;
        self.dirty.store(false, Ordering::Release);

        Ok(moved)
    }
}
