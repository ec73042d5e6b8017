//! Rich-text body deltas: retain / insert / delete with attribute maps.
//!
//! Op lengths count Unicode scalar values. A body delta is in document
//! form when every op is an insert; canonical deltas never end in a
//! plain retain and never hold adjacent mergeable ops.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DeltaError, OtDelta};

/// Attribute map attached to retain and insert ops.
///
/// A `null` value on a retain clears the attribute from the underlying
/// text; `null` never survives into document form.
pub type Attrs = BTreeMap<String, Value>;

/// One body operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyOp {
    /// Keep `n` units of the underlying text, optionally restyling them.
    Retain {
        n: u64,
        #[serde(default, skip_serializing_if = "Attrs::is_empty")]
        attrs: Attrs,
    },
    /// Insert text, optionally styled.
    Insert {
        text: String,
        #[serde(default, skip_serializing_if = "Attrs::is_empty")]
        attrs: Attrs,
    },
    /// Remove `n` units of the underlying text.
    Delete { n: u64 },
}

impl BodyOp {
    /// Length of the op in Unicode scalar values.
    pub fn len(&self) -> u64 {
        match self {
            BodyOp::Retain { n, .. } | BodyOp::Delete { n } => *n,
            BodyOp::Insert { text, .. } => text.chars().count() as u64,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, BodyOp::Insert { .. })
    }

    pub fn is_retain(&self) -> bool {
        matches!(self, BodyOp::Retain { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, BodyOp::Delete { .. })
    }
}

/// A sequence of body operations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BodyDelta {
    ops: Vec<BodyOp>,
}

impl BodyDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// A document-form delta consisting of a single unstyled insert.
    pub fn text_document(text: &str) -> Self {
        let mut d = Self::new();
        d.push_insert(text, Attrs::new());
        d
    }

    pub fn ops(&self) -> &[BodyOp] {
        &self.ops
    }

    /// Length of the text this delta applies to.
    pub fn base_len(&self) -> u64 {
        self.ops
            .iter()
            .map(|op| match op {
                BodyOp::Retain { n, .. } | BodyOp::Delete { n } => *n,
                BodyOp::Insert { .. } => 0,
            })
            .sum()
    }

    /// Length of the text this delta produces.
    pub fn target_len(&self) -> u64 {
        self.ops
            .iter()
            .map(|op| match op {
                BodyOp::Retain { n, .. } => *n,
                BodyOp::Insert { .. } => op.len(),
                BodyOp::Delete { .. } => 0,
            })
            .sum()
    }

    /// Plain-text rendering of a document-form delta.
    pub fn to_text(&self) -> String {
        self.ops
            .iter()
            .filter_map(|op| match op {
                BodyOp::Insert { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Append an op, merging with the tail when mergeable. Zero-length
    /// ops are dropped.
    pub fn push(&mut self, op: BodyOp) {
        if op.len() == 0 {
            return;
        }
        if let Some(last) = self.ops.last_mut() {
            match (last, &op) {
                (BodyOp::Retain { n, attrs }, BodyOp::Retain { n: m, attrs: a })
                    if attrs == a =>
                {
                    *n += m;
                    return;
                }
                (BodyOp::Insert { text, attrs }, BodyOp::Insert { text: t, attrs: a })
                    if attrs == a =>
                {
                    text.push_str(t);
                    return;
                }
                (BodyOp::Delete { n }, BodyOp::Delete { n: m }) => {
                    *n += m;
                    return;
                }
                _ => {}
            }
        }
        self.ops.push(op);
    }

    pub fn push_retain(&mut self, n: u64, attrs: Attrs) {
        self.push(BodyOp::Retain { n, attrs });
    }

    pub fn push_insert(&mut self, text: &str, attrs: Attrs) {
        self.push(BodyOp::Insert { text: text.to_string(), attrs });
    }

    pub fn push_delete(&mut self, n: u64) {
        self.push(BodyOp::Delete { n });
    }

    /// Drop a trailing attribute-free retain; such a tail is a no-op.
    fn chop(&mut self) {
        if let Some(BodyOp::Retain { attrs, .. }) = self.ops.last() {
            if attrs.is_empty() {
                self.ops.pop();
            }
        }
    }

    /// Structural sanity check for deltas arriving from a boundary.
    pub fn validate(&self) -> Result<(), DeltaError> {
        for op in &self.ops {
            if op.len() == 0 {
                return Err(DeltaError::BadDelta("zero-length body op".into()));
            }
        }
        Ok(())
    }
}

/// Merge `b`'s attributes over `a`'s. With `keep_null`, explicit nulls
/// survive (they still have work to do on the underlying text); without
/// it, nulls are resolved away (document form).
fn compose_attrs(a: &Attrs, b: &Attrs, keep_null: bool) -> Attrs {
    let mut out = a.clone();
    for (k, v) in b {
        out.insert(k.clone(), v.clone());
    }
    if !keep_null {
        out.retain(|_, v| !v.is_null());
    }
    out
}

/// Transform `b`'s attributes against `a`'s. When the receiver came
/// first, its attribute writes win: keys it touched are dropped from `b`.
fn transform_attrs(a: &Attrs, b: &Attrs, a_first: bool) -> Attrs {
    if !a_first {
        return b.clone();
    }
    b.iter()
        .filter(|(k, _)| !a.contains_key(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Cursor over an op list that can split ops at arbitrary offsets.
struct OpCursor<'a> {
    ops: &'a [BodyOp],
    idx: usize,
    /// Units already consumed from `ops[idx]`.
    offset: u64,
}

impl<'a> OpCursor<'a> {
    fn new(ops: &'a [BodyOp]) -> Self {
        Self { ops, idx: 0, offset: 0 }
    }

    fn has_next(&self) -> bool {
        self.idx < self.ops.len()
    }

    fn peek(&self) -> Option<&'a BodyOp> {
        self.ops.get(self.idx)
    }

    /// Remaining length of the current op; `u64::MAX` when exhausted, so
    /// an exhausted side behaves as an infinite implicit retain.
    fn peek_len(&self) -> u64 {
        match self.peek() {
            Some(op) => op.len() - self.offset,
            None => u64::MAX,
        }
    }

    /// Take up to `n` units from the current op. Past the end this
    /// yields the implicit plain retain.
    fn take(&mut self, n: u64) -> BodyOp {
        let Some(op) = self.peek() else {
            return BodyOp::Retain { n, attrs: Attrs::new() };
        };
        let available = op.len() - self.offset;
        let taken = n.min(available);
        let out = match op {
            BodyOp::Retain { attrs, .. } => BodyOp::Retain { n: taken, attrs: attrs.clone() },
            BodyOp::Delete { .. } => BodyOp::Delete { n: taken },
            BodyOp::Insert { text, attrs } => {
                let piece: String = text
                    .chars()
                    .skip(self.offset as usize)
                    .take(taken as usize)
                    .collect();
                BodyOp::Insert { text: piece, attrs: attrs.clone() }
            }
        };
        self.offset += taken;
        if self.offset == op.len() {
            self.idx += 1;
            self.offset = 0;
        }
        out
    }

    /// Take the whole remainder of the current op.
    fn take_current(&mut self) -> BodyOp {
        self.take(self.peek_len())
    }
}

impl OtDelta for BodyDelta {
    fn empty() -> Self {
        Self::new()
    }

    fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn is_document(&self) -> bool {
        self.ops.iter().all(BodyOp::is_insert)
    }

    fn compose(&self, other: &Self, want_document: bool) -> Result<Self, DeltaError> {
        let mut a = OpCursor::new(&self.ops);
        let mut b = OpCursor::new(&other.ops);
        let mut out = BodyDelta::new();

        while a.has_next() || b.has_next() {
            if b.peek().is_some_and(BodyOp::is_insert) {
                // New text is independent of what `a` produced.
                out.push(b.take_current());
            } else if a.peek().is_some_and(BodyOp::is_delete) {
                // `a`'s deletes act on text `b` never saw.
                out.push(a.take_current());
            } else {
                let n = a.peek_len().min(b.peek_len());
                let a_op = a.take(n);
                let b_op = b.take(n);
                match (&a_op, &b_op) {
                    (BodyOp::Insert { .. }, BodyOp::Delete { .. }) => {
                        // `b` deleted text `a` inserted: both vanish.
                    }
                    (BodyOp::Retain { .. }, BodyOp::Delete { .. }) => {
                        out.push_delete(n);
                    }
                    (BodyOp::Insert { text, attrs }, BodyOp::Retain { attrs: ba, .. }) => {
                        out.push_insert(text, compose_attrs(attrs, ba, false));
                    }
                    (BodyOp::Retain { attrs, .. }, BodyOp::Retain { attrs: ba, .. }) => {
                        out.push_retain(n, compose_attrs(attrs, ba, true));
                    }
                    // b-insert and a-delete are consumed above.
                    _ => return Err(DeltaError::BadDelta("unreachable compose pairing".into())),
                }
            }
        }
        out.chop();
        if want_document && !out.is_document() {
            return Err(DeltaError::NotDocument("body compose result"));
        }
        Ok(out)
    }

    fn transform(&self, other: &Self, self_first: bool) -> Result<Self, DeltaError> {
        let mut a = OpCursor::new(&self.ops);
        let mut b = OpCursor::new(&other.ops);
        let mut out = BodyDelta::new();

        while a.has_next() || b.has_next() {
            if a.peek().is_some_and(BodyOp::is_insert)
                && (self_first || !b.peek().is_some_and(BodyOp::is_insert))
            {
                // Receiver's insert lands first: step over it.
                out.push_retain(a.take_current().len(), Attrs::new());
            } else if b.peek().is_some_and(BodyOp::is_insert) {
                out.push(b.take_current());
            } else {
                let n = a.peek_len().min(b.peek_len());
                let a_op = a.take(n);
                let b_op = b.take(n);
                match (&a_op, &b_op) {
                    (BodyOp::Delete { .. }, _) => {
                        // Text gone; `b`'s intent for it evaporates.
                    }
                    (_, BodyOp::Delete { .. }) => {
                        out.push_delete(n);
                    }
                    (BodyOp::Retain { attrs, .. }, BodyOp::Retain { attrs: ba, .. }) => {
                        out.push_retain(n, transform_attrs(attrs, ba, self_first));
                    }
                    _ => return Err(DeltaError::BadDelta("unreachable transform pairing".into())),
                }
            }
        }
        out.chop();
        Ok(out)
    }
}
