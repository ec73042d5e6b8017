//! Changes, snapshots, and timestamps — the revision-log vocabulary.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DeltaError, OtDelta};

/// Wall-clock timestamp: seconds plus microseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: i64,
    pub usecs: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self { secs: d.as_secs() as i64, usecs: d.subsec_micros() }
    }

    /// Plain-JSON form used inside caret field updates.
    pub fn to_value(self) -> Value {
        Value::Array(vec![Value::from(self.secs), Value::from(self.usecs)])
    }

    pub fn from_value(v: &Value) -> Result<Self, DeltaError> {
        let arr = v
            .as_array()
            .filter(|a| a.len() == 2)
            .ok_or_else(|| DeltaError::BadDelta("timestamp must be [secs, usecs]".into()))?;
        let secs = arr[0]
            .as_i64()
            .ok_or_else(|| DeltaError::BadDelta("timestamp secs".into()))?;
        let usecs = arr[1]
            .as_u64()
            .filter(|u| *u < 1_000_000)
            .ok_or_else(|| DeltaError::BadDelta("timestamp usecs".into()))?;
        Ok(Self { secs, usecs: usecs as u32 })
    }
}

/// A delta tagged with the revision it produces and its authorship.
///
/// A change at revision `n` transforms the snapshot at `n - 1` into the
/// snapshot at `n`. Revision 0 must carry a document-form delta; later
/// changes must be non-empty and non-document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change<D> {
    pub rev_num: u64,
    pub delta: D,
    pub timestamp: Option<Timestamp>,
    pub author_id: Option<String>,
}

impl<D: OtDelta> Change<D> {
    pub fn new(
        rev_num: u64,
        delta: D,
        timestamp: Option<Timestamp>,
        author_id: Option<String>,
    ) -> Self {
        Self { rev_num, delta, timestamp, author_id }
    }

    /// The authorless, timeless change returned from `update` to steer a
    /// client onto the server's state.
    pub fn correction(rev_num: u64, delta: D) -> Self {
        Self { rev_num, delta, timestamp: None, author_id: None }
    }

    /// The revision-0 bootstrap change: an empty document.
    pub fn first() -> Self {
        Self { rev_num: 0, delta: D::empty(), timestamp: None, author_id: None }
    }

    /// Validate a change arriving at the log boundary.
    pub fn validate(&self) -> Result<(), DeltaError> {
        if self.rev_num == 0 {
            if !self.delta.is_document() {
                return Err(DeltaError::NotDocument("change at revision 0"));
            }
        } else if self.delta.is_empty() {
            return Err(DeltaError::BadDelta("empty change delta".into()));
        }
        Ok(())
    }
}

/// A document-form delta at a specific revision. Contents are only ever
/// cloned out, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<D> {
    pub rev_num: u64,
    pub contents: D,
}

impl<D: OtDelta> Snapshot<D> {
    pub fn new(rev_num: u64, contents: D) -> Result<Self, DeltaError> {
        if !contents.is_document() {
            return Err(DeltaError::NotDocument("snapshot contents"));
        }
        Ok(Self { rev_num, contents })
    }

    /// The empty document at revision 0.
    pub fn genesis() -> Self {
        Self { rev_num: 0, contents: D::empty() }
    }

    /// The snapshot one revision later.
    pub fn compose_change(&self, change: &Change<D>) -> Result<Self, DeltaError> {
        let contents = self.contents.compose(&change.delta, true)?;
        Ok(Self { rev_num: change.rev_num, contents })
    }
}
