//! Core types for the blob store.

use crate::error::Result;
use crate::records::fio;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::fmt;
use std::fs::File;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

/// Width of a record key in bytes.
pub const KEY_SIZE: usize = 64;

/// Fixed-width binary record address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(pub [u8; KEY_SIZE]);

impl Key {
    /// Wrap raw key bytes.
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Key(bytes)
    }

    /// Build a key from a shorter (or equal) byte string, zero-padded on the right.
    ///
    /// Returns `None` if `bytes` is longer than [`KEY_SIZE`].
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > KEY_SIZE {
            return None;
        }
        let mut id = [0u8; KEY_SIZE];
        id[..bytes.len()].copy_from_slice(bytes);
        Some(Key(id))
    }

    /// Derive a key from an arbitrary string (SHA-512 of its bytes).
    pub fn hashed(s: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(s.as_ref());
        let mut id = [0u8; KEY_SIZE];
        id.copy_from_slice(&hasher.finalize());
        Key(id)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Key(arr))
    }

    /// Index shard this key belongs to.
    pub(crate) fn shard(&self, shards: usize) -> usize {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        (u64::from_le_bytes(prefix) % shards as u64) as usize
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({}...)", &self.to_hex()[..16])
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// Logical partition of the key space.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct BlobType(pub u32);

impl fmt::Debug for BlobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobType({})", self.0)
    }
}

impl fmt::Display for BlobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for BlobType {
    fn from(t: u32) -> Self {
        BlobType(t)
    }
}

/// Per-record flag bits.
///
/// Bits without a named constant are carried through untouched.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RecordFlags(pub u64);

impl RecordFlags {
    pub const NONE: RecordFlags = RecordFlags(0);

    /// Tombstone. Set by the store on removal, never accepted from callers.
    pub const REMOVED: RecordFlags = RecordFlags(1 << 0);

    /// Skip checksum verification when reading this record.
    pub const NO_CSUM: RecordFlags = RecordFlags(1 << 1);

    /// Append the payload to the current live record instead of replacing it.
    pub const APPEND: RecordFlags = RecordFlags(1 << 4);

    /// Refuse to supersede a live record.
    pub const NO_OVERWRITE: RecordFlags = RecordFlags(1 << 6);

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, other: RecordFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn without(self, other: RecordFlags) -> RecordFlags {
        RecordFlags(self.0 & !other.0)
    }
}

impl BitOr for RecordFlags {
    type Output = RecordFlags;

    fn bitor(self, rhs: RecordFlags) -> RecordFlags {
        RecordFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for RecordFlags {
    fn bitor_assign(&mut self, rhs: RecordFlags) {
        self.0 |= rhs.0;
    }
}

impl From<u64> for RecordFlags {
    fn from(bits: u64) -> Self {
        RecordFlags(bits)
    }
}

impl fmt::Debug for RecordFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordFlags({:#x})", self.0)
    }
}

/// Where a live record sits in the data file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Key,
    pub blob_type: BlobType,
    pub flags: RecordFlags,
    /// Offset of the record header in the data file.
    pub offset: u64,
    /// Payload length in bytes.
    pub size: u64,
    /// Write generation (append order).
    pub generation: u64,
}

/// Location of a record's payload, for callers that read the data file themselves.
///
/// The handle keeps the underlying file open, so it stays valid across a
/// defragmentation that swaps the data file out.
#[derive(Clone, Debug)]
pub struct BlobHandle {
    pub(crate) file: Arc<File>,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) flags: RecordFlags,
}

impl BlobHandle {
    /// The data file holding the payload.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Absolute offset of the first payload byte in [`file`](Self::file).
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Payload length in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Flags the record was written with.
    pub fn flags(&self) -> RecordFlags {
        self.flags
    }

    /// Read `buf.len()` payload bytes starting `pos` bytes into the record.
    pub fn read_at(&self, buf: &mut [u8], pos: u64) -> Result<()> {
        let end = pos.saturating_add(buf.len() as u64);
        if end > self.size {
            return Err(crate::error::StoreError::InvalidRange {
                offset: end,
                size: self.size,
            });
        }
        fio::read_exact_at(&self.file, buf, self.offset + pos)?;
        Ok(())
    }

    /// Copy the whole payload out.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.size as usize];
        self.read_at(&mut buf, 0)?;
        Ok(buf)
    }
}

#[cfg(unix)]
impl std::os::unix::io::AsRawFd for BlobHandle {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        std::os::unix::io::AsRawFd::as_raw_fd(&*self.file)
    }
}

/// Returned by an [`iterate`](crate::BlobStore::iterate) callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterateControl {
    Continue,
    Stop,
}

/// Store statistics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreStats {
    /// Live records across every type.
    pub live_records: u64,
    /// Superseded records and tombstones still occupying the data file.
    pub dead_records: u64,
    pub data_size_bytes: u64,
    pub index_size_bytes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}
