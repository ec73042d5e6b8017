//! Transaction specs: the operation vocabulary of the transactional file.
//!
//! A spec is an unordered bag of typed operations, evaluated in fixed
//! category order: environment → prerequisite → list → read → delete →
//! write → wait. The three groups {wait} / {list, read} / {delete, write}
//! are mutually exclusive within one spec, and at most one timeout op is
//! allowed.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use super::buffer::{BufferHash, FrozenBuffer};
use super::path::StoragePath;
use super::FileError;

/// One transactional-file operation.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOp {
    // environment
    Timeout(Duration),
    // prerequisite
    CheckBlobAbsent(BufferHash),
    CheckBlobPresent(BufferHash),
    CheckPathAbsent(StoragePath),
    CheckPathPresent(StoragePath),
    CheckPathIs(StoragePath, BufferHash),
    CheckPathNot(StoragePath, BufferHash),
    // list
    ListPathPrefix(StoragePath),
    ListPathRange(StoragePath, u64, u64),
    // read
    ReadBlob(BufferHash),
    ReadPath(StoragePath),
    ReadPathRange(StoragePath, u64, u64),
    // delete
    DeletePath(StoragePath),
    DeletePathPrefix(StoragePath),
    DeletePathRange(StoragePath, u64, u64),
    DeleteBlob(BufferHash),
    DeleteAll,
    // write
    WritePath(StoragePath, FrozenBuffer),
    WriteBlob(FrozenBuffer),
    // wait
    WhenPathNot(StoragePath, BufferHash),
}

/// Evaluation category of an op; also its execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OpCategory {
    Environment,
    Prerequisite,
    List,
    Read,
    Delete,
    Write,
    Wait,
}

impl FileOp {
    pub fn category(&self) -> OpCategory {
        match self {
            FileOp::Timeout(_) => OpCategory::Environment,
            FileOp::CheckBlobAbsent(_)
            | FileOp::CheckBlobPresent(_)
            | FileOp::CheckPathAbsent(_)
            | FileOp::CheckPathPresent(_)
            | FileOp::CheckPathIs(..)
            | FileOp::CheckPathNot(..) => OpCategory::Prerequisite,
            FileOp::ListPathPrefix(_) | FileOp::ListPathRange(..) => OpCategory::List,
            FileOp::ReadBlob(_) | FileOp::ReadPath(_) | FileOp::ReadPathRange(..) => {
                OpCategory::Read
            }
            FileOp::DeletePath(_)
            | FileOp::DeletePathPrefix(_)
            | FileOp::DeletePathRange(..)
            | FileOp::DeleteBlob(_)
            | FileOp::DeleteAll => OpCategory::Delete,
            FileOp::WritePath(..) | FileOp::WriteBlob(_) => OpCategory::Write,
            FileOp::WhenPathNot(..) => OpCategory::Wait,
        }
    }
}

/// A validated transaction spec.
#[derive(Debug, Clone)]
pub struct TransactionSpec {
    ops: Vec<FileOp>,
    timeout: Option<Duration>,
}

impl TransactionSpec {
    /// Validate and build a spec from an op bag.
    pub fn new(mut ops: Vec<FileOp>) -> Result<Self, FileError> {
        let mut timeout = None;
        let mut has_wait = false;
        let mut has_pull = false; // list or read
        let mut has_push = false; // delete or write
        for op in &ops {
            match op.category() {
                OpCategory::Environment => {
                    let FileOp::Timeout(d) = op else { unreachable!() };
                    if timeout.replace(*d).is_some() {
                        return Err(FileError::BadSpec("multiple timeout ops".into()));
                    }
                }
                OpCategory::Prerequisite => {}
                OpCategory::List | OpCategory::Read => has_pull = true,
                OpCategory::Delete | OpCategory::Write => has_push = true,
                OpCategory::Wait => has_wait = true,
            }
        }
        if (has_wait as u8) + (has_pull as u8) + (has_push as u8) > 1 {
            return Err(FileError::BadSpec(
                "spec mixes wait, list/read, and delete/write categories".into(),
            ));
        }
        // Fixed evaluation order; sort is stable so same-category ops keep
        // their relative order.
        ops.sort_by_key(FileOp::category);
        Ok(Self { ops, timeout })
    }

    pub fn ops(&self) -> &[FileOp] {
        &self.ops
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn has_waits(&self) -> bool {
        self.ops.iter().any(|op| op.category() == OpCategory::Wait)
    }

    pub fn ops_in(&self, category: OpCategory) -> impl Iterator<Item = &FileOp> {
        self.ops.iter().filter(move |op| op.category() == category)
    }
}

/// What a successful transaction hands back.
#[derive(Debug, Clone, Default)]
pub struct TransactionResult {
    /// Paths found by list ops.
    pub paths: BTreeSet<StoragePath>,
    /// Path bindings found by read ops; missing paths are simply absent.
    pub data: BTreeMap<StoragePath, FrozenBuffer>,
    /// Blobs found by `readBlob`.
    pub blobs: BTreeMap<BufferHash, FrozenBuffer>,
    /// Storage IDs whose change satisfied a wait op.
    pub triggered: Vec<StoragePath>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> StoragePath {
        StoragePath::parse(s).unwrap()
    }

    #[test]
    fn test_valid_cas_spec() {
        let buf = FrozenBuffer::from_utf8("5");
        let spec = TransactionSpec::new(vec![
            FileOp::WritePath(path("/revision_number"), buf.clone()),
            FileOp::CheckPathIs(path("/revision_number"), buf.hash().clone()),
            FileOp::Timeout(Duration::from_secs(5)),
        ])
        .unwrap();
        // Sorted into category order: timeout, prerequisite, write.
        assert_eq!(spec.ops()[0].category(), OpCategory::Environment);
        assert_eq!(spec.ops()[1].category(), OpCategory::Prerequisite);
        assert_eq!(spec.ops()[2].category(), OpCategory::Write);
        assert_eq!(spec.timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_rejects_mixed_groups() {
        let err = TransactionSpec::new(vec![
            FileOp::ReadPath(path("/a")),
            FileOp::WritePath(path("/b"), FrozenBuffer::from_utf8("x")),
        ])
        .unwrap_err();
        assert!(matches!(err, FileError::BadSpec(_)));

        assert!(TransactionSpec::new(vec![
            FileOp::WhenPathNot(path("/a"), BufferHash::of(b"x")),
            FileOp::ReadPath(path("/a")),
        ])
        .is_err());
    }

    #[test]
    fn test_list_and_read_may_mix() {
        assert!(TransactionSpec::new(vec![
            FileOp::ListPathPrefix(path("/caret")),
            FileOp::ReadPath(path("/revision_number")),
        ])
        .is_ok());
    }

    #[test]
    fn test_rejects_double_timeout() {
        assert!(TransactionSpec::new(vec![
            FileOp::Timeout(Duration::from_secs(1)),
            FileOp::Timeout(Duration::from_secs(2)),
        ])
        .is_err());
    }

    #[test]
    fn test_prerequisites_allowed_with_any_group() {
        for extra in [
            FileOp::ReadPath(path("/a")),
            FileOp::WritePath(path("/a"), FrozenBuffer::from_utf8("v")),
            FileOp::WhenPathNot(path("/a"), BufferHash::of(b"v")),
        ] {
            assert!(TransactionSpec::new(vec![
                FileOp::CheckPathPresent(path("/a")),
                extra,
            ])
            .is_ok());
        }
    }
}
