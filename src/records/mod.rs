//! Record storage.
//!
//! Payloads live in an append-only data file; a sharded in-memory index
//! maps (key, type) to the live record and is periodically written out to
//! a memory-mapped index file next to the data file.

pub(crate) mod fio;
mod index;
mod log;

pub use index::{BlobIndex, IndexSnapshot, LoadedIndex, ShardGuard, INDEX_SHARDS};
pub use log::{DataLog, RecordHeader, ScanResult, RECORD_FOOTER_SIZE, RECORD_HEADER_SIZE};
