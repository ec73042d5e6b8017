//! Per-document control: append-only revision logs with OT rebase.
//!
//! ```text
//!                 ┌────────────────────────────────┐
//!                 │           DocComplex           │
//!                 │                                │
//!  Session ─────► │  BodyControl     (durable)     │
//!  Session ─────► │  PropertyControl (durable)     │──► TransactionalFile
//!                 │  CaretControl    (ephemeral)   │
//!                 └────────────────────────────────┘
//! ```
//!
//! One `DocControl` exclusively owns mutation of one payload's revision
//! log within the process; readers share it freely. Durable payloads
//! append through a compare-and-swap on `revision_number`; the ephemeral
//! caret log keeps a bounded in-memory ring.

pub mod caret;
pub mod colors;
pub mod complex;
pub mod control;
pub mod durable;

pub use caret::CaretControl;
pub use colors::ColorPicker;
pub use complex::{DocComplex, DocRegistry};
pub use control::{DocControl, EphemeralLog, RevisionLog};
pub use durable::{BodyControl, DurableLog, FileCondition, PropertyControl};

use std::fmt;

use crate::api::message::ErrorInfo;
use crate::delta::DeltaError;
use crate::storage::FileError;

/// Errors from the revision/OT layer.
#[derive(Debug, Clone, PartialEq)]
pub enum DocError {
    /// Caller misuse: bad revision number, malformed update.
    BadValue(String),
    /// Data crossed a boundary malformed.
    BadData(String),
    /// The revision fell below the retention floor (ephemeral payloads).
    RevisionNotAvailable(u64),
    /// The revision is beyond the current head.
    RevisionTooHigh { requested: u64, current: u64 },
    /// The update retry limit was exhausted under write contention.
    TooMuchContention,
    /// A long poll's deadline elapsed.
    TimedOut,
    /// Storage error passed through from the transactional file.
    File(FileError),
    /// Invariant violation; an implementation defect.
    Wtf(String),
}

impl DocError {
    /// Stable wire name, used when the error crosses the RPC boundary.
    pub fn wire_name(&self) -> &'static str {
        match self {
            DocError::BadValue(_) => "badValue",
            DocError::BadData(_) => "badData",
            DocError::RevisionNotAvailable(_) => "revisionNotAvailable",
            DocError::RevisionTooHigh { .. } => "revisionTooHigh",
            DocError::TooMuchContention => "tooMuchContention",
            DocError::TimedOut => "timedOut",
            DocError::File(FileError::PrerequisiteFailed(_)) => "prerequisiteFailed",
            DocError::File(FileError::TimedOut) => "timedOut",
            DocError::File(FileError::FileNotFound(_)) => "fileNotFound",
            DocError::File(FileError::Backend(_)) => "backendError",
            DocError::File(FileError::BadSpec(_)) => "badValue",
            DocError::File(FileError::BadData(_)) => "badData",
            DocError::Wtf(_) => "wtf",
        }
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo { name: self.wire_name().to_string(), detail: self.to_string() }
    }
}

impl fmt::Display for DocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocError::BadValue(detail) => write!(f, "Bad value: {detail}"),
            DocError::BadData(detail) => write!(f, "Bad data: {detail}"),
            DocError::RevisionNotAvailable(rev) => {
                write!(f, "Revision not available: {rev}")
            }
            DocError::RevisionTooHigh { requested, current } => {
                write!(f, "Revision too high: {requested} (current {current})")
            }
            DocError::TooMuchContention => write!(f, "Too much write contention"),
            DocError::TimedOut => write!(f, "Timed out"),
            DocError::File(e) => write!(f, "{e}"),
            DocError::Wtf(detail) => write!(f, "Invariant violation: {detail}"),
        }
    }
}

impl std::error::Error for DocError {}

impl From<FileError> for DocError {
    fn from(e: FileError) -> Self {
        DocError::File(e)
    }
}

/// Delta-algebra failures on already-validated inputs indicate a defect
/// (corrupt log or broken transform), not caller misuse.
impl From<DeltaError> for DocError {
    fn from(e: DeltaError) -> Self {
        DocError::Wtf(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        assert_eq!(DocError::TooMuchContention.wire_name(), "tooMuchContention");
        assert_eq!(
            DocError::File(FileError::PrerequisiteFailed("x".into())).wire_name(),
            "prerequisiteFailed"
        );
        assert_eq!(DocError::File(FileError::TimedOut).wire_name(), "timedOut");
        assert_eq!(DocError::RevisionNotAvailable(3).wire_name(), "revisionNotAvailable");
    }
}
