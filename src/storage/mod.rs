//! Single-document transactional storage.
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │              TransactionalFile                 │
//! │                                                │
//! │  /revision_number            ──► FrozenBuffer  │
//! │  /revision/${n}/change       ──► FrozenBuffer  │
//! │  /caret/${sessionId}         ──► FrozenBuffer  │
//! │  blobs: hash ──► FrozenBuffer                  │
//! │                                                │
//! │  transact(spec):                               │
//! │    environment → prerequisite → list → read    │
//! │    → delete → write → wait                     │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! Every durable mutation is expressed as a compare-and-swap prerequisite
//! plus a write, so higher layers get optimistic concurrency without a
//! separate lock manager.

pub mod buffer;
pub mod file;
pub mod path;
pub mod spec;

pub use buffer::{BufferHash, FrozenBuffer};
pub use file::TransactionalFile;
pub use path::StoragePath;
pub use spec::{FileOp, OpCategory, TransactionResult, TransactionSpec};

use std::fmt;

/// Errors from the transactional file.
#[derive(Debug, Clone, PartialEq)]
pub enum FileError {
    /// Malformed spec, path, or hash; caller misuse.
    BadSpec(String),
    /// Stored bytes failed shape validation.
    BadData(String),
    /// A prerequisite check did not hold.
    PrerequisiteFailed(String),
    /// A wait op outlived the transaction's timeout.
    TimedOut,
    /// The addressed file does not exist.
    FileNotFound(String),
    /// The storage backend misbehaved.
    Backend(String),
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileError::BadSpec(detail) => write!(f, "Bad transaction spec: {detail}"),
            FileError::BadData(detail) => write!(f, "Bad stored data: {detail}"),
            FileError::PrerequisiteFailed(detail) => {
                write!(f, "Prerequisite failed: {detail}")
            }
            FileError::TimedOut => write!(f, "Transaction timed out"),
            FileError::FileNotFound(id) => write!(f, "File not found: {id}"),
            FileError::Backend(detail) => write!(f, "Storage backend error: {detail}"),
        }
    }
}

impl std::error::Error for FileError {}
