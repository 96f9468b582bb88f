//! Main BlobStore struct tying all components together.

use crate::cache::ReadCache;
use crate::error::{Result, StoreError};
use crate::logging::{init_logging, LogConfig, LogMask};
use crate::records::{BlobIndex, DataLog, IndexSnapshot, RecordHeader, RECORD_HEADER_SIZE};
use crate::types::{
    BlobHandle, BlobType, IndexEntry, IterateControl, Key, RecordFlags, StoreStats,
};
use crate::workers::{SyncWorker, WorkerPool};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Iteration threads used by [`StoreConfig::new`].
pub const DEFAULT_ITERATE_THREADS: usize = 16;

/// Seconds between background syncs used by [`StoreConfig::new`].
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;

/// Store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Primary data file.
    pub file: PathBuf,

    /// Index file. Defaults to `<file>.mmap`.
    pub index_file: Option<PathBuf>,

    /// Log sink to install on open, if any.
    pub log: Option<LogConfig>,

    /// Threads in the iteration pool.
    pub iterate_threads: usize,

    /// Seconds between background syncs. 0 syncs on every write and
    /// disables the background worker.
    pub sync_interval_secs: u64,

    /// Read cache size (number of records). 0 disables the cache.
    pub cache_size: usize,

    /// Records larger than this are never cached.
    pub cache_max_record_size: u64,

    /// Defragment in the background once this percentage of records in the
    /// data file is dead. 0 disables automatic defragmentation.
    pub defrag_percentage: u8,

    /// Opaque engine flags, carried but not interpreted.
    pub flags: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("./data.eblob"),
            index_file: None,
            log: None,
            iterate_threads: DEFAULT_ITERATE_THREADS,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            cache_size: 1000,
            cache_max_record_size: 64 * 1024,
            defrag_percentage: 25,
            flags: 0,
        }
    }
}

impl StoreConfig {
    /// Default configuration for a data file at `file`.
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            ..Default::default()
        }
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Index file path, explicit or derived from the data file.
    pub fn index_path(&self) -> PathBuf {
        match &self.index_file {
            Some(path) => path.clone(),
            None => suffixed(&self.file, ".mmap"),
        }
    }

    fn lock_path(&self) -> PathBuf {
        suffixed(&self.file, ".lock")
    }

    /// Reject configurations the store cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.file.as_os_str().is_empty() {
            return Err(StoreError::InvalidConfig("data file path is empty".into()));
        }
        if self.iterate_threads == 0 {
            return Err(StoreError::InvalidConfig(
                "iterate_threads must be at least 1".into(),
            ));
        }
        if self.defrag_percentage > 100 {
            return Err(StoreError::InvalidConfig(format!(
                "defrag_percentage {} is over 100",
                self.defrag_percentage
            )));
        }
        if self.index_path() == self.file {
            return Err(StoreError::InvalidConfig(
                "index file must differ from the data file".into(),
            ));
        }
        Ok(())
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// State shared between the store handle and its background threads.
struct StoreInner {
    config: StoreConfig,

    index_path: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    log: DataLog,

    index: BlobIndex,

    cache: ReadCache,

    next_generation: AtomicU64,

    /// Shared by every operation; taken exclusively to snapshot the index
    /// and to swap data files.
    maintenance: RwLock<()>,

    /// Serializes index file writes and defragmentation.
    persist_lock: Mutex<()>,
}

/// Append-only, key-addressed blob store.
///
/// Records are addressed by (key, type). Writing a pair again supersedes
/// the previous record; removing it appends a tombstone. Dead records stay
/// in the data file until [`defrag`](Self::defrag) reclaims them.
pub struct BlobStore {
    inner: Arc<StoreInner>,

    /// Iteration threads.
    pool: Option<WorkerPool>,

    /// Periodic sync / defrag ticker.
    sync_worker: Option<SyncWorker>,

    closed: bool,
}

impl BlobStore {
    /// Open (or create) a store at `path` with default settings.
    ///
    /// Installs a log sink first if `log_file` is given or `log_mask` is not empty.
    pub fn open_simple(
        path: impl Into<PathBuf>,
        log_file: Option<PathBuf>,
        log_mask: LogMask,
    ) -> Result<Self> {
        let mut config = StoreConfig::new(path);
        if log_file.is_some() || log_mask != LogMask::NONE {
            config.log = Some(LogConfig::new(log_file, log_mask));
        }
        Self::open(config)
    }

    /// Open (or create) a store with exactly the given configuration.
    ///
    /// Any failure is reported as [`StoreError::Initialization`] and leaves
    /// nothing open.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let path = config.file.clone();
        Self::open_inner(config).map_err(|e| {
            error!(path = %path.display(), error = %e, "failed to open blob store");
            StoreError::init(path, e)
        })
    }

    fn open_inner(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        if let Some(log_config) = &config.log {
            init_logging(log_config)?;
        }

        if let Some(parent) = config.file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_file = Self::acquire_lock(&config.lock_path())?;
        let log = DataLog::open(&config.file, config.sync_interval_secs == 0)?;
        let index = BlobIndex::new();
        let index_path = config.index_path();
        let data_len = log.size();

        // Load the index snapshot, then replay whatever was appended after it.
        let (start, mut next_generation, index_missing) = if index_path.exists() {
            let loaded = index.load(&index_path, data_len)?;
            (loaded.data_size, loaded.next_generation, false)
        } else {
            if data_len > 0 {
                warn!(path = %index_path.display(), "index file missing, rebuilding from data file");
            }
            (0, 1, true)
        };

        let scan = log.scan(start, data_len)?;
        for (offset, header) in &scan.records {
            index.replay(*offset, header);
            next_generation = next_generation.max(header.generation + 1);
        }
        if scan.valid_end < data_len {
            warn!(
                valid_end = scan.valid_end,
                data_len,
                "truncating torn records at data file tail"
            );
            log.truncate(scan.valid_end)?;
        }

        let replayed = scan.records.len();
        let cache = ReadCache::new(config.cache_size, config.cache_max_record_size);

        let inner = Arc::new(StoreInner {
            index_path,
            _lock_file: lock_file,
            log,
            index,
            cache,
            next_generation: AtomicU64::new(next_generation),
            maintenance: RwLock::new(()),
            persist_lock: Mutex::new(()),
            config,
        });

        if index_missing || replayed > 0 {
            inner.persist_index()?;
        }

        let pool = WorkerPool::new("eblob-iter", inner.config.iterate_threads)?;

        let sync_worker = if inner.config.sync_interval_secs > 0 {
            let ticking = Arc::clone(&inner);
            Some(SyncWorker::spawn(
                "eblob-sync",
                Duration::from_secs(inner.config.sync_interval_secs),
                move || ticking.background_tick(),
            )?)
        } else {
            None
        };

        info!(
            path = %inner.config.file.display(),
            records = inner.index.count(),
            replayed,
            "blob store opened"
        );

        Ok(Self {
            inner,
            pool: Some(pool),
            sync_worker,
            closed: false,
        })
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }

    // --- Writes ---

    /// Store `data` under (key, type), superseding any live record there.
    pub fn write(
        &self,
        key: &Key,
        data: impl AsRef<[u8]>,
        flags: RecordFlags,
        blob_type: BlobType,
    ) -> Result<()> {
        let data = data.as_ref();
        self.inner
            .write(key, data, flags, blob_type)
            .map_err(|e| StoreError::write(data.len() as u64, e))
    }

    /// Write under the key derived from `key` by [`hash`](Self::hash).
    pub fn write_hashed(
        &self,
        key: &str,
        data: impl AsRef<[u8]>,
        flags: RecordFlags,
        blob_type: BlobType,
    ) -> Result<()> {
        self.write(&self.hash(key), data, flags, blob_type)
    }

    // --- Reads ---

    /// Locate the payload of (key, type) without copying it.
    pub fn read(&self, key: &Key, blob_type: BlobType) -> Result<BlobHandle> {
        self.inner.locate(key, blob_type).map_err(StoreError::read)
    }

    /// Copy up to `size` bytes of the payload of (key, type), starting at `offset`.
    ///
    /// `size == 0` reads to the end of the record. Reads running past the
    /// end are cut short, so the result may be shorter than `size`.
    pub fn read_data(
        &self,
        key: &Key,
        offset: u64,
        size: u64,
        blob_type: BlobType,
    ) -> Result<Vec<u8>> {
        self.inner
            .read_data(key, offset, size, blob_type)
            .map_err(StoreError::read)
    }

    /// [`read`](Self::read) under a hashed string key.
    pub fn read_hashed(&self, key: &str, blob_type: BlobType) -> Result<BlobHandle> {
        self.read(&self.hash(key), blob_type)
    }

    /// [`read_data`](Self::read_data) under a hashed string key.
    pub fn read_data_hashed(
        &self,
        key: &str,
        offset: u64,
        size: u64,
        blob_type: BlobType,
    ) -> Result<Vec<u8>> {
        self.read_data(&self.hash(key), offset, size, blob_type)
    }

    /// Whether (key, type) has a live record.
    pub fn contains(&self, key: &Key, blob_type: BlobType) -> bool {
        let _m = self.inner.maintenance.read();
        self.inner.index.get(key, blob_type).is_some()
    }

    /// Types holding a live record for `key`.
    pub fn types(&self, key: &Key) -> Vec<BlobType> {
        let _m = self.inner.maintenance.read();
        self.inner.index.types_of(key)
    }

    // --- Removal ---

    /// Remove (key, type). Removing an absent record is not an error.
    pub fn remove(&self, key: &Key, blob_type: BlobType) {
        let _m = self.inner.maintenance.read();
        let mut shard = self.inner.index.lock(key);
        self.inner.remove_locked(&mut shard, key, blob_type);
    }

    /// Remove `key` under every type it is stored in.
    pub fn remove_all(&self, key: &Key) {
        let _m = self.inner.maintenance.read();
        let mut shard = self.inner.index.lock(key);
        for blob_type in shard.types_of(key) {
            self.inner.remove_locked(&mut shard, key, blob_type);
        }
    }

    /// [`remove`](Self::remove) under a hashed string key.
    pub fn remove_hashed(&self, key: &str, blob_type: BlobType) {
        self.remove(&self.hash(key), blob_type)
    }

    // --- Introspection ---

    /// Derive a key from a string. Stable across reopens.
    pub fn hash(&self, key: &str) -> Key {
        Key::hashed(key)
    }

    /// Number of live records across all types.
    pub fn elements(&self) -> u64 {
        self.inner.index.count()
    }

    pub fn stats(&self) -> StoreStats {
        let index_size_bytes = fs::metadata(&self.inner.index_path)
            .map(|m| m.len())
            .unwrap_or(0);

        StoreStats {
            live_records: self.inner.index.count(),
            dead_records: self.inner.index.dead_count(),
            data_size_bytes: self.inner.log.size(),
            index_size_bytes,
            cache_hits: self.inner.cache.hits(),
            cache_misses: self.inner.cache.misses(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn path(&self) -> &Path {
        self.inner.log.path()
    }

    pub fn index_path(&self) -> &Path {
        &self.inner.index_path
    }

    // --- Maintenance ---

    /// Visit every live record on the iteration pool.
    ///
    /// The callback runs concurrently on up to `iterate_threads` threads and
    /// sees records in no particular order. Returning
    /// [`IterateControl::Stop`] ends the walk early. Records written while
    /// the walk runs may or may not be seen. Returns how many records the
    /// callback was called for.
    pub fn iterate<F>(&self, callback: F) -> Result<u64>
    where
        F: Fn(&IndexEntry, &[u8]) -> IterateControl + Send + Sync + 'static,
    {
        let pool = self.pool.as_ref().ok_or(StoreError::Closed)?;

        let entries = {
            let _m = self.inner.maintenance.read();
            self.inner.index.entries()
        };
        if entries.is_empty() {
            return Ok(0);
        }

        let callback = Arc::new(callback);
        let stop = Arc::new(AtomicBool::new(false));
        let chunk_size = entries.len().div_ceil(pool.size() * 4).max(1);
        let (results_tx, results_rx) = crossbeam_channel::unbounded();
        let mut jobs = 0;

        for chunk in entries.chunks(chunk_size) {
            let chunk = chunk.to_vec();
            let inner = Arc::clone(&self.inner);
            let callback = Arc::clone(&callback);
            let job_stop = Arc::clone(&stop);
            let results_tx = results_tx.clone();

            let queued = pool.execute(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    inner.iterate_chunk(&chunk, &*callback, &job_stop)
                }))
                .unwrap_or_else(|_| {
                    Err(StoreError::IterationAborted("callback panicked".into()))
                });
                let _ = results_tx.send(result);
            });
            if !queued {
                stop.store(true, Ordering::Release);
                return Err(StoreError::Closed);
            }
            jobs += 1;
        }
        drop(results_tx);

        let mut visited = 0;
        let mut received = 0;
        let mut first_error = None;
        while received < jobs {
            match results_rx.recv() {
                Ok(result) => {
                    received += 1;
                    match result {
                        Ok(n) => visited += n,
                        Err(e) => {
                            stop.store(true, Ordering::Release);
                            if first_error.is_none() {
                                first_error = Some(e);
                            }
                        }
                    }
                }
                Err(_) => break,
            }
        }

        if let Some(e) = first_error {
            warn!(error = %e, "iteration failed");
            return Err(e);
        }
        if received < jobs {
            return Err(StoreError::IterationAborted(format!(
                "{} of {} chunks never reported back",
                jobs - received,
                jobs
            )));
        }
        Ok(visited)
    }

    /// Flush the data file and write out the index.
    pub fn sync(&self) -> Result<()> {
        self.inner.persist_index()
    }

    /// Rewrite the data file without dead records. Returns bytes reclaimed.
    pub fn defrag(&self) -> Result<u64> {
        self.inner.defrag()
    }

    /// Stop background threads, sync, and release the store.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Some(mut worker) = self.sync_worker.take() {
            worker.stop();
        }
        drop(self.pool.take());

        self.inner.persist_index()?;
        info!(path = %self.inner.config.file.display(), "blob store closed");
        Ok(())
    }
}

impl Drop for BlobStore {
    fn drop(&mut self) {
        // Best-effort close on drop
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "failed to close blob store cleanly");
        }
    }
}

impl StoreInner {
    fn write(&self, key: &Key, data: &[u8], flags: RecordFlags, blob_type: BlobType) -> Result<()> {
        let _m = self.maintenance.read();
        let mut shard = self.index.lock(key);
        let existing = shard.get(key, blob_type);

        if flags.contains(RecordFlags::NO_OVERWRITE) && existing.is_some() {
            return Err(StoreError::AlreadyExists {
                key: *key,
                blob_type,
            });
        }

        let payload: Cow<'_, [u8]> = match existing {
            Some(old) if flags.contains(RecordFlags::APPEND) => {
                let mut buf = self.read_record(&old)?;
                buf.extend_from_slice(data);
                Cow::Owned(buf)
            }
            _ => Cow::Borrowed(data),
        };

        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel);
        let header = RecordHeader {
            key: *key,
            blob_type,
            flags: flags.without(RecordFlags::REMOVED).without(RecordFlags::APPEND),
            generation,
            size: payload.len() as u64,
        };

        let offset = self.log.append(&header, &payload)?;
        shard.insert(header.entry_at(offset));
        self.cache.invalidate(key, blob_type);

        debug!(
            key = %key,
            blob_type = %blob_type,
            size = header.size,
            generation,
            offset,
            "record written"
        );
        Ok(())
    }

    fn locate(&self, key: &Key, blob_type: BlobType) -> Result<BlobHandle> {
        let _m = self.maintenance.read();
        let entry = self
            .index
            .get(key, blob_type)
            .ok_or(StoreError::NotFound { key: *key, blob_type })?;

        Ok(BlobHandle {
            file: self.log.file(),
            offset: entry.offset + RECORD_HEADER_SIZE,
            size: entry.size,
            flags: entry.flags,
        })
    }

    fn read_data(&self, key: &Key, offset: u64, size: u64, blob_type: BlobType) -> Result<Vec<u8>> {
        let _m = self.maintenance.read();
        let entry = self
            .index
            .get(key, blob_type)
            .ok_or(StoreError::NotFound { key: *key, blob_type })?;

        if offset > entry.size {
            return Err(StoreError::InvalidRange {
                offset,
                size: entry.size,
            });
        }
        let available = entry.size - offset;
        let len = if size == 0 { available } else { size.min(available) };

        if self.cache.admits(entry.size) {
            let cached = match self.cache.get(key, blob_type, entry.generation) {
                Some(data) => data,
                None => {
                    let data = Arc::new(self.read_record(&entry)?);
                    self.cache
                        .put(*key, blob_type, entry.generation, Arc::clone(&data));
                    data
                }
            };
            let start = offset as usize;
            return Ok(cached[start..start + len as usize].to_vec());
        }

        trace!(key = %key, offset, len, "uncached read");
        if offset == 0 && len == entry.size {
            self.read_record(&entry)
        } else {
            self.log.read_data(&entry, offset, len)
        }
    }

    /// Whole payload of `entry`, checksum verified unless the record opted out.
    fn read_record(&self, entry: &IndexEntry) -> Result<Vec<u8>> {
        if entry.flags.contains(RecordFlags::NO_CSUM) {
            self.log.read_data(entry, 0, entry.size)
        } else {
            self.log.read_verified(entry)
        }
    }

    /// Tombstone (key, type) while holding its shard.
    fn remove_locked(
        &self,
        shard: &mut crate::records::ShardGuard<'_>,
        key: &Key,
        blob_type: BlobType,
    ) {
        if shard.get(key, blob_type).is_none() {
            trace!(key = %key, blob_type = %blob_type, "remove of absent record");
            return;
        }

        let tombstone = RecordHeader {
            key: *key,
            blob_type,
            flags: RecordFlags::REMOVED,
            generation: self.next_generation.fetch_add(1, Ordering::AcqRel),
            size: 0,
        };
        match self.log.append(&tombstone, &[]) {
            Ok(_) => shard.note_tombstone(),
            Err(e) => warn!(
                key = %key,
                blob_type = %blob_type,
                error = %e,
                "failed to append tombstone, removal will not survive a reopen"
            ),
        }

        shard.remove(key, blob_type);
        self.cache.invalidate(key, blob_type);
        debug!(key = %key, blob_type = %blob_type, "record removed");
    }

    fn iterate_chunk(
        &self,
        chunk: &[IndexEntry],
        callback: &dyn Fn(&IndexEntry, &[u8]) -> IterateControl,
        stop: &AtomicBool,
    ) -> Result<u64> {
        let mut visited = 0;
        for seen in chunk {
            if stop.load(Ordering::Acquire) {
                break;
            }

            // Re-resolve: the record may have been superseded, removed or moved.
            let current = {
                let _m = self.maintenance.read();
                match self.index.get(&seen.key, seen.blob_type) {
                    Some(entry) if entry.generation == seen.generation => {
                        Some((entry, self.read_record(&entry)?))
                    }
                    _ => None,
                }
            };

            if let Some((entry, data)) = current {
                visited += 1;
                if callback(&entry, &data) == IterateControl::Stop {
                    stop.store(true, Ordering::Release);
                    break;
                }
            }
        }
        Ok(visited)
    }

    /// Write the index file covering everything appended so far.
    fn persist_index(&self) -> Result<()> {
        let _p = self.persist_lock.lock();
        self.persist_index_locked()
    }

    fn persist_index_locked(&self) -> Result<()> {
        let snapshot = {
            let _m = self.maintenance.write();
            IndexSnapshot {
                entries: self.index.entries(),
                data_size: self.log.size(),
                next_generation: self.next_generation.load(Ordering::Acquire),
                dead_records: self.index.dead_count(),
            }
        };

        // Everything up to data_size must be durable before the index claims it.
        self.log.sync()?;
        BlobIndex::save(&self.index_path, &snapshot)?;

        trace!(entries = snapshot.entries.len(), data_size = snapshot.data_size, "index persisted");
        Ok(())
    }

    fn defrag(&self) -> Result<u64> {
        let _p = self.persist_lock.lock();

        let (before, after) = {
            let _m = self.maintenance.write();
            let before = self.log.size();

            let mut entries = self.index.entries();
            entries.sort_by_key(|e| e.offset);

            // A missing index forces a rebuild on reopen, which stays correct
            // even if we die between the data swap and the new index.
            match fs::remove_file(&self.index_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            let moved = self.log.rewrite(&entries)?;
            self.index.reset(moved, 0);
            (before, self.log.size())
        };

        self.persist_index_locked()?;

        let reclaimed = before.saturating_sub(after);
        info!(before, after, reclaimed, "defragmentation finished");
        Ok(reclaimed)
    }

    fn needs_defrag(&self) -> bool {
        let percentage = self.config.defrag_percentage as u64;
        if percentage == 0 {
            return false;
        }
        let dead = self.index.dead_count();
        let total = dead + self.index.count();
        dead > 0 && dead * 100 >= percentage * total
    }

    /// One tick of the sync worker.
    fn background_tick(&self) {
        if let Err(e) = self.persist_index() {
            warn!(error = %e, "background sync failed");
            return;
        }
        if self.needs_defrag() {
            if let Err(e) = self.defrag() {
                warn!(error = %e, "background defragmentation failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            iterate_threads: 4,
            sync_interval_secs: 0,
            ..StoreConfig::new(dir.path().join("data.eblob"))
        }
    }

    fn key(s: &str) -> Key {
        Key::from_slice(s.as_bytes()).unwrap()
    }

    #[test]
    fn test_create_store() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(test_config(&dir)).unwrap();

        assert!(store.path().exists());
        assert!(store.index_path().exists());
        assert_eq!(store.index_path(), dir.path().join("data.eblob.mmap"));
        assert_eq!(store.elements(), 0);
    }

    #[test]
    fn test_write_and_read() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(test_config(&dir)).unwrap();

        store
            .write(&key("K1"), b"hello", RecordFlags::NONE, BlobType(0))
            .unwrap();

        assert_eq!(store.read_data(&key("K1"), 0, 5, BlobType(0)).unwrap(), b"hello");
        assert_eq!(store.read_data(&key("K1"), 1, 3, BlobType(0)).unwrap(), b"ell");
        assert_eq!(store.read_data(&key("K1"), 3, 100, BlobType(0)).unwrap(), b"lo");
        assert_eq!(store.read_data(&key("K1"), 0, 0, BlobType(0)).unwrap(), b"hello");
        assert!(store.read_data(&key("K1"), 5, 0, BlobType(0)).unwrap().is_empty());
    }

    #[test]
    fn test_read_offset_past_end() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(test_config(&dir)).unwrap();

        store
            .write(&key("K1"), b"hello", RecordFlags::NONE, BlobType(0))
            .unwrap();
        let err = store.read_data(&key("K1"), 6, 1, BlobType(0)).unwrap_err();
        assert!(matches!(err.root(), StoreError::InvalidRange { offset: 6, size: 5 }));
    }

    #[test]
    fn test_handle_read() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(test_config(&dir)).unwrap();

        let flags = RecordFlags(1 << 20);
        store.write(&key("K1"), b"payload", flags, BlobType(2)).unwrap();

        let handle = store.read(&key("K1"), BlobType(2)).unwrap();
        assert_eq!(handle.size(), 7);
        assert_eq!(handle.flags(), flags);
        assert_eq!(handle.offset(), RECORD_HEADER_SIZE);
        assert_eq!(handle.read_all().unwrap(), b"payload");
    }

    #[test]
    fn test_uncached_reads() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            cache_size: 0,
            ..test_config(&dir)
        };
        let store = BlobStore::open(config).unwrap();

        store
            .write(&key("K1"), b"hello world", RecordFlags::NONE, BlobType(0))
            .unwrap();
        assert_eq!(store.read_data(&key("K1"), 6, 5, BlobType(0)).unwrap(), b"world");
        assert_eq!(store.read_data(&key("K1"), 0, 0, BlobType(0)).unwrap(), b"hello world");
        assert_eq!(store.stats().cache_hits, 0);
    }

    #[test]
    fn test_cache_serves_repeat_reads() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(test_config(&dir)).unwrap();

        store
            .write(&key("K1"), b"hello", RecordFlags::NONE, BlobType(0))
            .unwrap();
        store.read_data(&key("K1"), 0, 0, BlobType(0)).unwrap();
        store.read_data(&key("K1"), 0, 0, BlobType(0)).unwrap();

        let stats = store.stats();
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_hits, 1);

        // A rewrite must not be answered from the cache.
        store
            .write(&key("K1"), b"world!", RecordFlags::NONE, BlobType(0))
            .unwrap();
        assert_eq!(store.read_data(&key("K1"), 0, 0, BlobType(0)).unwrap(), b"world!");
    }

    #[test]
    fn test_no_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(test_config(&dir)).unwrap();

        store
            .write(&key("K1"), b"first", RecordFlags::NO_OVERWRITE, BlobType(0))
            .unwrap();
        let err = store
            .write(&key("K1"), b"second", RecordFlags::NO_OVERWRITE, BlobType(0))
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Write);
        assert!(matches!(err.root(), StoreError::AlreadyExists { .. }));
        assert_eq!(store.read_data(&key("K1"), 0, 0, BlobType(0)).unwrap(), b"first");
    }

    #[test]
    fn test_append_flag() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(test_config(&dir)).unwrap();

        store
            .write(&key("K1"), b"hello", RecordFlags::APPEND, BlobType(0))
            .unwrap();
        store
            .write(&key("K1"), b" world", RecordFlags::APPEND, BlobType(0))
            .unwrap();

        assert_eq!(store.read_data(&key("K1"), 0, 0, BlobType(0)).unwrap(), b"hello world");
        assert_eq!(store.elements(), 1);
        assert!(!store
            .read(&key("K1"), BlobType(0))
            .unwrap()
            .flags()
            .contains(RecordFlags::APPEND));
    }

    #[test]
    fn test_removed_flag_is_not_accepted_from_callers() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(test_config(&dir)).unwrap();

        store
            .write(&key("K1"), b"data", RecordFlags::REMOVED, BlobType(0))
            .unwrap();
        assert!(store.contains(&key("K1"), BlobType(0)));
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();

        {
            let store = BlobStore::open(test_config(&dir)).unwrap();
            store.write(&key("a"), b"one", RecordFlags::NONE, BlobType(0)).unwrap();
            store.write(&key("b"), b"two", RecordFlags::NONE, BlobType(1)).unwrap();
            store.write(&key("a"), b"uno", RecordFlags::NONE, BlobType(0)).unwrap();
            store.remove(&key("b"), BlobType(1));
            store.close().unwrap();
        }

        {
            let store = BlobStore::open(test_config(&dir)).unwrap();
            assert_eq!(store.elements(), 1);
            assert_eq!(store.read_data(&key("a"), 0, 0, BlobType(0)).unwrap(), b"uno");
            assert!(store
                .read_data(&key("b"), 0, 0, BlobType(1))
                .unwrap_err()
                .is_not_found());
        }
    }

    #[test]
    fn test_replay_after_index_snapshot() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        {
            let store = BlobStore::open(config.clone()).unwrap();
            store.write(&key("a"), b"one", RecordFlags::NONE, BlobType(0)).unwrap();
            store.sync().unwrap();

            // Written after the last index snapshot; leaked so no close runs.
            store.write(&key("b"), b"two", RecordFlags::NONE, BlobType(0)).unwrap();
            store.remove(&key("a"), BlobType(0));
            store.inner.log.sync().unwrap();
            std::mem::forget(store);
        }

        // The lock file handle was leaked along with the store.
        fs::remove_file(config.lock_path()).unwrap();

        let store = BlobStore::open(config).unwrap();
        assert_eq!(store.elements(), 1);
        assert!(!store.contains(&key("a"), BlobType(0)));
        assert_eq!(store.read_data(&key("b"), 0, 0, BlobType(0)).unwrap(), b"two");
    }

    #[test]
    fn test_rebuild_without_index() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        {
            let store = BlobStore::open(config.clone()).unwrap();
            for i in 0..20 {
                store
                    .write(&key(&format!("k{}", i)), format!("v{}", i), RecordFlags::NONE, BlobType(0))
                    .unwrap();
            }
            store.remove(&key("k3"), BlobType(0));
        }
        fs::remove_file(config.index_path()).unwrap();

        let store = BlobStore::open(config).unwrap();
        assert_eq!(store.elements(), 19);
        assert_eq!(store.read_data(&key("k7"), 0, 0, BlobType(0)).unwrap(), b"v7");
        assert!(store.index_path().exists());
    }

    #[test]
    fn test_store_lock() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let _store1 = BlobStore::open(config.clone()).unwrap();

        // Second store should fail to acquire lock
        let err = BlobStore::open(config).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Initialization);
        assert!(matches!(err.root(), StoreError::Locked));
    }

    #[test]
    fn test_invalid_config() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            iterate_threads: 0,
            ..test_config(&dir)
        };

        let err = BlobStore::open(config).err().unwrap();
        assert!(matches!(err.root(), StoreError::InvalidConfig(_)));
        assert!(!dir.path().join("data.eblob").exists());
    }

    #[test]
    fn test_defrag_reclaims_dead_records() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(test_config(&dir)).unwrap();

        for i in 0..10 {
            store
                .write(&key("hot"), format!("version {}", i), RecordFlags::NONE, BlobType(0))
                .unwrap();
        }
        store.write(&key("gone"), b"bye", RecordFlags::NONE, BlobType(0)).unwrap();
        store.remove(&key("gone"), BlobType(0));

        let handle = store.read(&key("hot"), BlobType(0)).unwrap();
        let before = store.stats();
        assert_eq!(before.dead_records, 11);

        let reclaimed = store.defrag().unwrap();
        let after = store.stats();
        assert!(reclaimed > 0);
        assert_eq!(after.dead_records, 0);
        assert_eq!(after.live_records, 1);
        assert_eq!(after.data_size_bytes, before.data_size_bytes - reclaimed);
        assert_eq!(store.read_data(&key("hot"), 0, 0, BlobType(0)).unwrap(), b"version 9");

        // Handles taken before the swap keep reading the old file.
        assert_eq!(handle.read_all().unwrap(), b"version 9");
    }

    #[test]
    fn test_defrag_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        {
            let store = BlobStore::open(config.clone()).unwrap();
            store.write(&key("a"), b"1", RecordFlags::NONE, BlobType(0)).unwrap();
            store.write(&key("a"), b"2", RecordFlags::NONE, BlobType(0)).unwrap();
            store.write(&key("b"), b"3", RecordFlags::NONE, BlobType(5)).unwrap();
            store.defrag().unwrap();
            store.write(&key("c"), b"4", RecordFlags::NONE, BlobType(0)).unwrap();
        }

        let store = BlobStore::open(config).unwrap();
        assert_eq!(store.elements(), 3);
        assert_eq!(store.read_data(&key("a"), 0, 0, BlobType(0)).unwrap(), b"2");
        assert_eq!(store.read_data(&key("b"), 0, 0, BlobType(5)).unwrap(), b"3");
        assert_eq!(store.read_data(&key("c"), 0, 0, BlobType(0)).unwrap(), b"4");
    }

    #[test]
    fn test_needs_defrag_threshold() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            defrag_percentage: 50,
            ..test_config(&dir)
        };
        let store = BlobStore::open(config).unwrap();

        store.write(&key("a"), b"1", RecordFlags::NONE, BlobType(0)).unwrap();
        assert!(!store.inner.needs_defrag());

        store.write(&key("a"), b"2", RecordFlags::NONE, BlobType(0)).unwrap();
        assert!(store.inner.needs_defrag());

        store.inner.background_tick();
        assert_eq!(store.stats().dead_records, 0);
    }

    #[test]
    fn test_config_from_json() {
        let config = StoreConfig::from_json(
            r#"{"file": "/tmp/blob.data", "iterate_threads": 2, "sync_interval_secs": 5}"#,
        )
        .unwrap();

        assert_eq!(config.file, PathBuf::from("/tmp/blob.data"));
        assert_eq!(config.iterate_threads, 2);
        assert_eq!(config.sync_interval_secs, 5);
        assert_eq!(config.cache_size, 1000);
        assert_eq!(config.index_path(), PathBuf::from("/tmp/blob.data.mmap"));
    }

    #[test]
    fn test_simple_mode_defaults() {
        let config = StoreConfig::new("/tmp/t1");
        assert_eq!(config.iterate_threads, DEFAULT_ITERATE_THREADS);
        assert_eq!(config.sync_interval_secs, DEFAULT_SYNC_INTERVAL_SECS);
        assert_eq!(config.index_path(), PathBuf::from("/tmp/t1.mmap"));
    }
}
