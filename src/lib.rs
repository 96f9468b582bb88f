//! # Blob Store
//!
//! An append-only, key-addressed binary object store.
//!
//! ## Core Concepts
//!
//! - **Keys**: fixed 64-byte addresses, either raw or derived from a string
//! - **Types**: integer namespaces; the same key in two types is two records
//! - **Records**: payload plus flags, appended to a single data file and
//!   never modified in place
//! - **Index**: (key, type) to record location, snapshotted to `<file>.mmap`
//!
//! ## Example
//!
//! ```no_run
//! use eblob_store::{BlobStore, BlobType, LogMask, RecordFlags};
//!
//! let store = BlobStore::open_simple("/tmp/t1", None, LogMask::NONE)?;
//!
//! store.write_hashed("user:42", "profile-data", RecordFlags::NONE, BlobType(1))?;
//! let data = store.read_data_hashed("user:42", 0, 12, BlobType(1))?;
//! assert_eq!(data, b"profile-data");
//!
//! store.remove_hashed("user:42", BlobType(1));
//! store.close()?;
//! # Ok::<(), eblob_store::StoreError>(())
//! ```

pub mod cache;
pub mod error;
pub mod logging;
pub mod records;
pub mod store;
pub mod types;
pub mod workers;

// Re-exports
pub use error::{ErrorKind, Result, StoreError};
pub use logging::{init_logging, LogConfig, LogMask};
pub use store::{BlobStore, StoreConfig, DEFAULT_ITERATE_THREADS, DEFAULT_SYNC_INTERVAL_SECS};
pub use types::*;
