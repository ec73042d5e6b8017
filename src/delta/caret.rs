//! Caret deltas: per-session selection state as an OT payload.
//!
//! A caret delta edits a set of carets keyed by session ID. Because each
//! session normally only writes its own caret, concurrent conflicts are
//! rare; the transform rules below still make every pairing converge:
//!
//! - begin vs begin, field vs field (same key): the winner's write stands
//! - begin vs field, begin vs end: the begin stands
//! - end vs field: the end stands

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::change::{Snapshot, Timestamp};
use super::{DeltaError, OtDelta};

/// One user's caret/selection inside one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Caret {
    /// Opaque non-empty session identifier; the caret's identity.
    pub session_id: String,
    pub author_id: String,
    /// Body revision the `index`/`length` were computed against.
    pub doc_rev_num: u64,
    pub index: u64,
    pub length: u64,
    /// Lowercase `#rrggbb`.
    pub color: String,
    pub last_active: Timestamp,
}

impl Caret {
    pub fn validate(&self) -> Result<(), DeltaError> {
        if self.session_id.is_empty() {
            return Err(DeltaError::BadDelta("empty caret session id".into()));
        }
        validate_color(&self.color)?;
        Ok(())
    }
}

fn validate_color(color: &str) -> Result<(), DeltaError> {
    let ok = color.len() == 7
        && color.starts_with('#')
        && color[1..].bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase());
    if ok {
        Ok(())
    } else {
        Err(DeltaError::BadDelta(format!("bad caret color {color:?}")))
    }
}

/// Field selector for `SetField` ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaretField {
    DocRevNum,
    Index,
    Length,
    Color,
    LastActive,
}

/// One caret operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaretOp {
    /// Introduce (or wholesale replace) a session's caret.
    BeginSession { caret: Caret },
    /// Remove a session's caret.
    EndSession { session_id: String },
    /// Update one field of an existing caret.
    SetField { session_id: String, field: CaretField, value: Value },
}

impl CaretOp {
    pub fn session_id(&self) -> &str {
        match self {
            CaretOp::BeginSession { caret } => &caret.session_id,
            CaretOp::EndSession { session_id } | CaretOp::SetField { session_id, .. } => session_id,
        }
    }
}

/// A sequence of caret operations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaretDelta {
    ops: Vec<CaretOp>,
}

/// Net effect of a delta on one session.
#[derive(Debug, Clone, PartialEq)]
enum SessionNet {
    Begun(Caret),
    Fields(BTreeMap<CaretField, Value>),
    Ended,
}

impl CaretDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ops(ops: Vec<CaretOp>) -> Self {
        Self { ops }
    }

    pub fn ops(&self) -> &[CaretOp] {
        &self.ops
    }

    pub fn push(&mut self, op: CaretOp) {
        self.ops.push(op);
    }

    /// The carets described by a document-form delta.
    pub fn carets(&self) -> Vec<Caret> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                CaretOp::BeginSession { caret } => Some(caret.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), DeltaError> {
        for op in &self.ops {
            if op.session_id().is_empty() {
                return Err(DeltaError::BadDelta("empty session id in caret op".into()));
            }
            if let CaretOp::BeginSession { caret } = op {
                caret.validate()?;
            }
        }
        Ok(())
    }

    /// Fold the op list into per-session net effects.
    fn net(&self) -> Result<BTreeMap<String, SessionNet>, DeltaError> {
        let mut map: BTreeMap<String, SessionNet> = BTreeMap::new();
        for op in &self.ops {
            match op {
                CaretOp::BeginSession { caret } => {
                    map.insert(caret.session_id.clone(), SessionNet::Begun(caret.clone()));
                }
                CaretOp::EndSession { session_id } => {
                    map.insert(session_id.clone(), SessionNet::Ended);
                }
                CaretOp::SetField { session_id, field, value } => {
                    match map.get_mut(session_id) {
                        Some(SessionNet::Begun(caret)) => apply_field(caret, *field, value)?,
                        Some(SessionNet::Fields(fields)) => {
                            fields.insert(*field, value.clone());
                        }
                        // A field write on an ended session has nothing
                        // left to land on.
                        Some(SessionNet::Ended) => {}
                        None => {
                            let mut fields = BTreeMap::new();
                            fields.insert(*field, value.clone());
                            map.insert(session_id.clone(), SessionNet::Fields(fields));
                        }
                    }
                }
            }
        }
        Ok(map)
    }

    /// Emit a canonical op list (sessions in ID order) from net effects.
    fn emit(
        map: BTreeMap<String, SessionNet>,
        want_document: bool,
    ) -> Result<Self, DeltaError> {
        let mut out = CaretDelta::new();
        for (session_id, net) in map {
            match net {
                SessionNet::Begun(caret) => {
                    out.push(CaretOp::BeginSession { caret });
                }
                SessionNet::Fields(fields) => {
                    if want_document {
                        return Err(DeltaError::NotDocument(
                            "field update without a session",
                        ));
                    }
                    for (field, value) in fields {
                        out.push(CaretOp::SetField {
                            session_id: session_id.clone(),
                            field,
                            value,
                        });
                    }
                }
                SessionNet::Ended => {
                    if !want_document {
                        out.push(CaretOp::EndSession { session_id });
                    }
                }
            }
        }
        Ok(out)
    }
}

fn apply_field(caret: &mut Caret, field: CaretField, value: &Value) -> Result<(), DeltaError> {
    let want_u64 = |v: &Value| {
        v.as_u64()
            .ok_or_else(|| DeltaError::BadDelta(format!("caret field {field:?} wants u64")))
    };
    match field {
        CaretField::DocRevNum => caret.doc_rev_num = want_u64(value)?,
        CaretField::Index => caret.index = want_u64(value)?,
        CaretField::Length => caret.length = want_u64(value)?,
        CaretField::Color => {
            let s = value
                .as_str()
                .ok_or_else(|| DeltaError::BadDelta("caret color wants string".into()))?;
            validate_color(s)?;
            caret.color = s.to_string();
        }
        CaretField::LastActive => caret.last_active = Timestamp::from_value(value)?,
    }
    Ok(())
}

impl OtDelta for CaretDelta {
    fn empty() -> Self {
        Self::new()
    }

    fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn is_document(&self) -> bool {
        let mut seen = std::collections::BTreeSet::new();
        self.ops.iter().all(|op| match op {
            CaretOp::BeginSession { caret } => seen.insert(caret.session_id.clone()),
            _ => false,
        })
    }

    fn compose(&self, other: &Self, want_document: bool) -> Result<Self, DeltaError> {
        let mut map = self.net()?;
        for op in &other.ops {
            match op {
                CaretOp::BeginSession { caret } => {
                    map.insert(caret.session_id.clone(), SessionNet::Begun(caret.clone()));
                }
                CaretOp::EndSession { session_id } => {
                    map.insert(session_id.clone(), SessionNet::Ended);
                }
                CaretOp::SetField { session_id, field, value } => match map.get_mut(session_id) {
                    Some(SessionNet::Begun(caret)) => apply_field(caret, *field, value)?,
                    Some(SessionNet::Fields(fields)) => {
                        fields.insert(*field, value.clone());
                    }
                    Some(SessionNet::Ended) => {}
                    None => {
                        let mut fields = BTreeMap::new();
                        fields.insert(*field, value.clone());
                        map.insert(session_id.clone(), SessionNet::Fields(fields));
                    }
                },
            }
        }
        Self::emit(map, want_document)
    }

    fn transform(&self, other: &Self, self_first: bool) -> Result<Self, DeltaError> {
        let ours = self.net()?;
        let theirs = other.net()?;
        let mut out = BTreeMap::new();
        for (session_id, b) in theirs {
            let transformed = match (ours.get(&session_id), b) {
                (None, b) => Some(b),
                // Our wholesale begin absorbs their field writes and end;
                // a competing begin falls to the tie-break.
                (Some(SessionNet::Begun(_)), SessionNet::Begun(cb)) => {
                    if self_first {
                        None
                    } else {
                        Some(SessionNet::Begun(cb))
                    }
                }
                (Some(SessionNet::Begun(_)), _) => None,
                // Our field writes only contend with their field writes.
                (Some(SessionNet::Fields(_)), SessionNet::Begun(cb)) => {
                    Some(SessionNet::Begun(cb))
                }
                (Some(SessionNet::Fields(ours)), SessionNet::Fields(mut theirs)) => {
                    if self_first {
                        theirs.retain(|k, _| !ours.contains_key(k));
                    }
                    if theirs.is_empty() {
                        None
                    } else {
                        Some(SessionNet::Fields(theirs))
                    }
                }
                (Some(SessionNet::Fields(_)), SessionNet::Ended) => Some(SessionNet::Ended),
                // After our end, only a begin has anything to say.
                (Some(SessionNet::Ended), SessionNet::Begun(cb)) => {
                    Some(SessionNet::Begun(cb))
                }
                (Some(SessionNet::Ended), _) => None,
            };
            if let Some(net) = transformed {
                out.insert(session_id, net);
            }
        }
        Self::emit(out, false)
    }
}

/// The caret set at a specific caret revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaretSnapshot {
    pub rev_num: u64,
    /// Sorted by session ID; IDs unique.
    pub carets: Vec<Caret>,
}

impl CaretSnapshot {
    pub fn from_snapshot(snapshot: &Snapshot<CaretDelta>) -> Self {
        let mut carets = snapshot.contents.carets();
        carets.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Self { rev_num: snapshot.rev_num, carets }
    }

    pub fn caret(&self, session_id: &str) -> Option<&Caret> {
        self.carets.iter().find(|c| c.session_id == session_id)
    }

    pub fn validate(&self) -> Result<(), DeltaError> {
        let mut seen = std::collections::BTreeSet::new();
        for caret in &self.carets {
            caret.validate()?;
            if !seen.insert(&caret.session_id) {
                return Err(DeltaError::BadDelta(format!(
                    "duplicate caret session {:?}",
                    caret.session_id
                )));
            }
        }
        Ok(())
    }
}
