//! In-memory record index and its memory-mapped on-disk snapshot.

use super::log::{RecordHeader, RECORD_FOOTER_SIZE, RECORD_HEADER_SIZE};
use crate::error::{Result, StoreError};
use crate::types::{BlobType, IndexEntry, Key, RecordFlags, KEY_SIZE};
use memmap2::Mmap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Magic bytes for index files.
const INDEX_MAGIC: &[u8; 4] = b"EBX\0";

/// Current index format version.
const INDEX_VERSION: u8 = 1;

/// Index file header size (magic/version + entry count + data size + next generation + dead count).
const INDEX_HEADER_SIZE: usize = 8 + 8 + 8 + 8 + 8;

/// Index entry size (key + type + flags + offset + size + generation).
const INDEX_ENTRY_SIZE: usize = KEY_SIZE + 8 + 8 + 8 + 8 + 8;

/// Number of independently locked index shards.
pub const INDEX_SHARDS: usize = 64;

/// Live records of one key, by type.
type KeyEntries = BTreeMap<BlobType, IndexEntry>;

type Shard = HashMap<Key, KeyEntries>;

/// Everything needed to write an index file.
pub struct IndexSnapshot {
    pub entries: Vec<IndexEntry>,
    pub data_size: u64,
    pub next_generation: u64,
    pub dead_records: u64,
}

/// Contents of an index file as loaded from disk.
pub struct LoadedIndex {
    pub data_size: u64,
    pub next_generation: u64,
    pub dead_records: u64,
}

/// Sharded index mapping (key, type) to the live record's location.
pub struct BlobIndex {
    shards: Vec<RwLock<Shard>>,

    /// Live entries across all shards.
    live: AtomicU64,

    /// Superseded records and tombstones still in the data file.
    dead: AtomicU64,
}

impl BlobIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            shards: (0..INDEX_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            live: AtomicU64::new(0),
            dead: AtomicU64::new(0),
        }
    }

    /// Lock the shard owning `key` for mutation.
    pub fn lock(&self, key: &Key) -> ShardGuard<'_> {
        ShardGuard {
            shard: self.shards[key.shard(INDEX_SHARDS)].write(),
            index: self,
        }
    }

    fn read_shard(&self, key: &Key) -> RwLockReadGuard<'_, Shard> {
        self.shards[key.shard(INDEX_SHARDS)].read()
    }

    /// Look up the live record for (key, type).
    pub fn get(&self, key: &Key, blob_type: BlobType) -> Option<IndexEntry> {
        self.read_shard(key)
            .get(key)
            .and_then(|types| types.get(&blob_type))
            .copied()
    }

    /// Types holding a live record for `key`.
    pub fn types_of(&self, key: &Key) -> Vec<BlobType> {
        self.read_shard(key)
            .get(key)
            .map(|types| types.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Number of live records.
    pub fn count(&self) -> u64 {
        self.live.load(Ordering::Acquire)
    }

    /// Number of dead records in the data file.
    pub fn dead_count(&self) -> u64 {
        self.dead.load(Ordering::Acquire)
    }

    /// Copy out every live entry.
    pub fn entries(&self) -> Vec<IndexEntry> {
        let mut entries = Vec::with_capacity(self.count() as usize);
        for shard in &self.shards {
            let shard = shard.read();
            entries.extend(shard.values().flat_map(|types| types.values().copied()));
        }
        entries
    }

    /// Replace the whole index with `entries`, which must all be live and distinct.
    pub fn reset(&self, entries: Vec<IndexEntry>, dead: u64) {
        let mut guards: Vec<_> = self.shards.iter().map(|s| s.write()).collect();
        for guard in guards.iter_mut() {
            guard.clear();
        }
        let live = entries.len() as u64;
        for entry in entries {
            guards[entry.key.shard(INDEX_SHARDS)]
                .entry(entry.key)
                .or_default()
                .insert(entry.blob_type, entry);
        }
        self.live.store(live, Ordering::Release);
        self.dead.store(dead, Ordering::Release);
    }

    /// Fold one data file record into the index, as found while replaying the log.
    pub fn replay(&self, offset: u64, header: &RecordHeader) {
        let mut guard = self.lock(&header.key);
        if header.is_removed() {
            self.dead.fetch_add(1, Ordering::AcqRel);
            guard.remove(&header.key, header.blob_type);
        } else {
            guard.insert(header.entry_at(offset));
        }
    }

    /// Write an index file to `path` atomically.
    pub fn save(path: &Path, snapshot: &IndexSnapshot) -> Result<()> {
        let tmp_path = tmp_path(path);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);

        // Header
        writer.write_all(INDEX_MAGIC)?;
        writer.write_all(&[INDEX_VERSION, 0, 0, 0])?;
        writer.write_all(&(snapshot.entries.len() as u64).to_le_bytes())?;
        writer.write_all(&snapshot.data_size.to_le_bytes())?;
        writer.write_all(&snapshot.next_generation.to_le_bytes())?;
        writer.write_all(&snapshot.dead_records.to_le_bytes())?;

        // Entries
        for entry in &snapshot.entries {
            writer.write_all(&entry.key.0)?;
            writer.write_all(&entry.blob_type.0.to_le_bytes())?;
            writer.write_all(&[0u8; 4])?;
            writer.write_all(&entry.flags.0.to_le_bytes())?;
            writer.write_all(&entry.offset.to_le_bytes())?;
            writer.write_all(&entry.size.to_le_bytes())?;
            writer.write_all(&entry.generation.to_le_bytes())?;
        }

        let file = writer.into_inner().map_err(|e| StoreError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Load an index file into this (empty) index.
    ///
    /// Every entry must lie inside the first `data_len` bytes of the data file.
    pub fn load(&self, path: &Path, data_len: u64) -> Result<LoadedIndex> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < INDEX_HEADER_SIZE {
            return Err(StoreError::InvalidFormat("Index file too short".into()));
        }

        // SAFETY: the index file is owned by this store (guarded by its lock
        // file) and only ever replaced by rename, never modified in place.
        let mmap = unsafe { Mmap::map(&file)? };

        if &mmap[0..4] != INDEX_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid index magic".into()));
        }
        if mmap[4] != INDEX_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported index version: {}",
                mmap[4]
            )));
        }

        let count = read_u64(&mmap, 8) as usize;
        let data_size = read_u64(&mmap, 16);
        let next_generation = read_u64(&mmap, 24);
        let dead_records = read_u64(&mmap, 32);

        let expected_len = count
            .checked_mul(INDEX_ENTRY_SIZE)
            .and_then(|n| n.checked_add(INDEX_HEADER_SIZE));
        if expected_len != Some(len) {
            return Err(StoreError::InvalidFormat(format!(
                "Index file length {} does not match {} entries",
                len, count
            )));
        }

        if data_size > data_len {
            return Err(StoreError::Corruption(format!(
                "index covers {} bytes but data file has {}",
                data_size, data_len
            )));
        }

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let base = INDEX_HEADER_SIZE + i * INDEX_ENTRY_SIZE;
            let mut key = [0u8; KEY_SIZE];
            key.copy_from_slice(&mmap[base..base + KEY_SIZE]);
            let at = base + KEY_SIZE;

            let entry = IndexEntry {
                key: Key(key),
                blob_type: BlobType(read_u32(&mmap, at)),
                flags: RecordFlags(read_u64(&mmap, at + 8)),
                offset: read_u64(&mmap, at + 16),
                size: read_u64(&mmap, at + 24),
                generation: read_u64(&mmap, at + 32),
            };

            let end = entry
                .offset
                .checked_add(RECORD_HEADER_SIZE + RECORD_FOOTER_SIZE)
                .and_then(|n| n.checked_add(entry.size));
            if end.map_or(true, |end| end > data_size) {
                return Err(StoreError::Corruption(format!(
                    "index entry {} points past indexed data ({} bytes)",
                    entry.key, data_size
                )));
            }
            entries.push(entry);
        }

        self.reset(entries, dead_records);

        Ok(LoadedIndex {
            data_size,
            next_generation,
            dead_records,
        })
    }
}

impl Default for BlobIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to the shard owning a key.
///
/// Holding the guard serializes every mutation of keys in that shard.
pub struct ShardGuard<'a> {
    shard: RwLockWriteGuard<'a, Shard>,
    index: &'a BlobIndex,
}

impl ShardGuard<'_> {
    pub fn get(&self, key: &Key, blob_type: BlobType) -> Option<IndexEntry> {
        self.shard
            .get(key)
            .and_then(|types| types.get(&blob_type))
            .copied()
    }

    /// Point (key, type) at a new record, returning the one it supersedes.
    pub fn insert(&mut self, entry: IndexEntry) -> Option<IndexEntry> {
        let old = self
            .shard
            .entry(entry.key)
            .or_default()
            .insert(entry.blob_type, entry);
        if old.is_some() {
            self.index.dead.fetch_add(1, Ordering::AcqRel);
        } else {
            self.index.live.fetch_add(1, Ordering::AcqRel);
        }
        old
    }

    /// Forget the live record for (key, type).
    pub fn remove(&mut self, key: &Key, blob_type: BlobType) -> Option<IndexEntry> {
        let types = self.shard.get_mut(key)?;
        let old = types.remove(&blob_type);
        if types.is_empty() {
            self.shard.remove(key);
        }
        // The forgotten record keeps its bytes in the data file until defrag.
        if old.is_some() {
            self.index.live.fetch_sub(1, Ordering::AcqRel);
            self.index.dead.fetch_add(1, Ordering::AcqRel);
        }
        old
    }

    /// Account for a tombstone appended to the data file.
    pub fn note_tombstone(&mut self) {
        self.index.dead.fetch_add(1, Ordering::AcqRel);
    }

    /// Types currently live for `key`.
    pub fn types_of(&self, key: &Key) -> Vec<BlobType> {
        self.shard
            .get(key)
            .map(|types| types.keys().copied().collect())
            .unwrap_or_default()
    }
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(arr)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(arr)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
