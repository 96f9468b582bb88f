//! Error types for the blob store.

use crate::types::{BlobType, Key};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record not found: {key} (type {blob_type})")]
    NotFound { key: Key, blob_type: BlobType },

    #[error("Record already exists: {key} (type {blob_type})")]
    AlreadyExists { key: Key, blob_type: BlobType },

    #[error("Invalid range: offset {offset} past record size {size}")]
    InvalidRange { offset: u64, size: u64 },

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Store is locked by another handle")]
    Locked,

    #[error("Store is closed")]
    Closed,

    #[error("Iteration aborted: {0}")]
    IterationAborted(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Failed to initialize blob store at {}: {source}", path.display())]
    Initialization {
        path: PathBuf,
        #[source]
        source: Box<StoreError>,
    },

    #[error("blob write failed: dsize: {size}: {source}")]
    Write {
        size: u64,
        #[source]
        source: Box<StoreError>,
    },

    #[error("blob read failed: {source}")]
    Read {
        #[source]
        source: Box<StoreError>,
    },
}

/// Coarse classification of a [`StoreError`], matching the operation that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The store could not be opened or created.
    Initialization,
    /// An append failed.
    Write,
    /// A lookup or data read failed, including not-found.
    Read,
    /// Anything raised outside the three operation wrappers.
    Other,
}

impl StoreError {
    pub(crate) fn init(path: impl Into<PathBuf>, source: StoreError) -> Self {
        StoreError::Initialization {
            path: path.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn write(size: u64, source: StoreError) -> Self {
        StoreError::Write {
            size,
            source: Box::new(source),
        }
    }

    pub(crate) fn read(source: StoreError) -> Self {
        StoreError::Read {
            source: Box::new(source),
        }
    }

    /// Which operation this error came out of.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Initialization { .. } => ErrorKind::Initialization,
            StoreError::Write { .. } => ErrorKind::Write,
            StoreError::Read { .. } => ErrorKind::Read,
            _ => ErrorKind::Other,
        }
    }

    /// True if this error (or the error it wraps) is a missing record.
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound { .. } => true,
            StoreError::Initialization { source, .. }
            | StoreError::Write { source, .. }
            | StoreError::Read { source } => source.is_not_found(),
            _ => false,
        }
    }

    /// The innermost error, with operation wrappers stripped.
    pub fn root(&self) -> &StoreError {
        match self {
            StoreError::Initialization { source, .. }
            | StoreError::Write { source, .. }
            | StoreError::Read { source } => source.root(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
