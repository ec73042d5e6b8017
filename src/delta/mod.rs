//! Delta algebra: the operational-transformation core.
//!
//! Three payload families share one algebra:
//!
//! ```text
//! ┌───────────────┐   ┌───────────────┐   ┌────────────────┐
//! │ BodyDelta     │   │ CaretDelta    │   │ PropertyDelta  │
//! │ retain/insert │   │ begin/end/    │   │ set/delete     │
//! │ /delete+attrs │   │ set_field     │   │ key-value      │
//! └───────┬───────┘   └───────┬───────┘   └────────┬───────┘
//!         └───────────────────┼────────────────────┘
//!                             ▼
//!                   trait OtDelta
//!                   compose / transform / is_document
//! ```
//!
//! `compose` is sequential combination (associative, identity = empty).
//! `transform` is the concurrent-merge operation; together they satisfy
//! TP1: `a.compose(a.transform(b, true)) == b.compose(b.transform(a, false))`
//! over resulting document state.

pub mod body;
pub mod caret;
pub mod change;
pub mod property;

pub use body::{Attrs, BodyDelta, BodyOp};
pub use caret::{Caret, CaretDelta, CaretField, CaretOp, CaretSnapshot};
pub use change::{Change, Snapshot, Timestamp};
pub use property::{PropertyDelta, PropertyOp};

use std::fmt;

/// Errors from the delta algebra.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaError {
    /// A result was required to be in document form but is not.
    NotDocument(&'static str),
    /// A delta or op crossed a boundary malformed.
    BadDelta(String),
}

impl fmt::Display for DeltaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeltaError::NotDocument(what) => write!(f, "Not a document delta: {what}"),
            DeltaError::BadDelta(detail) => write!(f, "Bad delta: {detail}"),
        }
    }
}

impl std::error::Error for DeltaError {}

/// The operational-transformation algebra over one payload kind.
///
/// Implementations must satisfy:
/// - `compose` associative with `empty()` as identity;
/// - `transform` satisfying TP1 (see module docs);
/// - `is_document` a structural predicate, `true` for `empty()`.
///
/// The `self_first` flag on [`transform`](OtDelta::transform) means the
/// receiver (`self`) was committed first and wins ties (e.g. insert races
/// at the same position). The server always transforms client deltas with
/// its own committed changes as the receiver and `self_first = true`.
pub trait OtDelta:
    Clone + fmt::Debug + PartialEq + Send + Sync + Sized + 'static
{
    /// The identity delta.
    fn empty() -> Self;

    /// `true` when the delta contains no operations.
    fn is_empty(&self) -> bool;

    /// `true` when the delta fully describes a state from empty.
    fn is_document(&self) -> bool;

    /// Sequential combination: the delta equivalent to applying `self`
    /// then `other`. With `want_document`, the result is additionally
    /// required to be in document form.
    fn compose(&self, other: &Self, want_document: bool) -> Result<Self, DeltaError>;

    /// OT transform: returns `other` rewritten to apply *after* `self`,
    /// given that both were produced concurrently against the same base.
    /// `self_first` breaks ties in favor of the receiver.
    fn transform(&self, other: &Self, self_first: bool) -> Result<Self, DeltaError>;
}
