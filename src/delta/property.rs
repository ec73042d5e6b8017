//! Property deltas: document-level key/value metadata as an OT payload.
//!
//! Per-key last-write-wins; the transform tie-break decides concurrent
//! writes (including set-vs-delete) on the same key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DeltaError, OtDelta};

/// One property operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyOp {
    SetProperty { key: String, value: Value },
    DeleteProperty { key: String },
}

impl PropertyOp {
    pub fn key(&self) -> &str {
        match self {
            PropertyOp::SetProperty { key, .. } | PropertyOp::DeleteProperty { key } => key,
        }
    }
}

/// A sequence of property operations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyDelta {
    ops: Vec<PropertyOp>,
}

impl PropertyDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ops(ops: Vec<PropertyOp>) -> Self {
        Self { ops }
    }

    pub fn ops(&self) -> &[PropertyOp] {
        &self.ops
    }

    pub fn push_set(&mut self, key: &str, value: Value) {
        self.ops.push(PropertyOp::SetProperty { key: key.to_string(), value });
    }

    pub fn push_delete(&mut self, key: &str) {
        self.ops.push(PropertyOp::DeleteProperty { key: key.to_string() });
    }

    /// The key/value map described by a document-form delta.
    pub fn properties(&self) -> BTreeMap<String, Value> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                PropertyOp::SetProperty { key, value } => Some((key.clone(), value.clone())),
                PropertyOp::DeleteProperty { .. } => None,
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), DeltaError> {
        for op in &self.ops {
            if op.key().is_empty() {
                return Err(DeltaError::BadDelta("empty property key".into()));
            }
        }
        Ok(())
    }

    /// Net effect per key: `Some` = set, `None` = delete.
    fn net(&self) -> BTreeMap<String, Option<Value>> {
        let mut map = BTreeMap::new();
        for op in &self.ops {
            match op {
                PropertyOp::SetProperty { key, value } => {
                    map.insert(key.clone(), Some(value.clone()));
                }
                PropertyOp::DeleteProperty { key } => {
                    map.insert(key.clone(), None);
                }
            }
        }
        map
    }

    fn emit(
        map: BTreeMap<String, Option<Value>>,
        want_document: bool,
    ) -> Result<Self, DeltaError> {
        let mut out = PropertyDelta::new();
        for (key, value) in map {
            match value {
                Some(value) => out.push_set(&key, value),
                None => {
                    if !want_document {
                        out.push_delete(&key);
                    }
                }
            }
        }
        Ok(out)
    }
}

impl OtDelta for PropertyDelta {
    fn empty() -> Self {
        Self::new()
    }

    fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn is_document(&self) -> bool {
        let mut seen = std::collections::BTreeSet::new();
        self.ops.iter().all(|op| match op {
            PropertyOp::SetProperty { key, .. } => seen.insert(key.clone()),
            PropertyOp::DeleteProperty { .. } => false,
        })
    }

    fn compose(&self, other: &Self, want_document: bool) -> Result<Self, DeltaError> {
        let mut map = self.net();
        map.extend(other.net());
        Self::emit(map, want_document)
    }

    fn transform(&self, other: &Self, self_first: bool) -> Result<Self, DeltaError> {
        let ours = self.net();
        let mut theirs = other.net();
        if self_first {
            theirs.retain(|key, _| !ours.contains_key(key));
        }
        Self::emit(theirs, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str, value: &str) -> PropertyDelta {
        let mut d = PropertyDelta::new();
        d.push_set(key, Value::String(value.into()));
        d
    }

    fn del(key: &str) -> PropertyDelta {
        let mut d = PropertyDelta::new();
        d.push_delete(key);
        d
    }

    fn tp1(base: &PropertyDelta, a: &PropertyDelta, b: &PropertyDelta) -> PropertyDelta {
        let left = base
            .compose(a, true)
            .unwrap()
            .compose(&a.transform(b, true).unwrap(), true)
            .unwrap();
        let right = base
            .compose(b, true)
            .unwrap()
            .compose(&b.transform(a, false).unwrap(), true)
            .unwrap();
        assert_eq!(left, right);
        left
    }

    #[test]
    fn test_document_form() {
        assert!(PropertyDelta::empty().is_document());
        assert!(set("title", "x").is_document());
        assert!(!del("title").is_document());

        let dup = PropertyDelta::from_ops(vec![
            PropertyOp::SetProperty { key: "k".into(), value: Value::Null },
            PropertyOp::SetProperty { key: "k".into(), value: Value::Bool(true) },
        ]);
        assert!(!dup.is_document());
    }

    #[test]
    fn test_compose_overwrites() {
        let composed = set("title", "a").compose(&set("title", "b"), true).unwrap();
        assert_eq!(composed.properties().get("title"), Some(&Value::String("b".into())));
    }

    #[test]
    fn test_compose_delete_drops_from_document() {
        let composed = set("title", "a").compose(&del("title"), true).unwrap();
        assert!(composed.properties().is_empty());
        assert!(composed.is_empty());
    }

    #[test]
    fn test_compose_keeps_delete_as_diff() {
        let composed = set("other", "x").compose(&del("title"), false).unwrap();
        assert_eq!(composed.ops().len(), 2);
    }

    #[test]
    fn test_transform_set_set_tiebreak() {
        let base = PropertyDelta::empty();
        let final_doc = tp1(&base, &set("title", "ours"), &set("title", "theirs"));
        assert_eq!(
            final_doc.properties().get("title"),
            Some(&Value::String("ours".into()))
        );
    }

    #[test]
    fn test_transform_set_vs_delete() {
        let base = set("title", "orig");
        let final_doc = tp1(&base, &set("title", "new"), &del("title"));
        assert_eq!(
            final_doc.properties().get("title"),
            Some(&Value::String("new".into()))
        );
    }

    #[test]
    fn test_transform_disjoint_keys_untouched() {
        let a = set("alpha", "1");
        let b = set("beta", "2");
        assert_eq!(a.transform(&b, true).unwrap(), b);
        tp1(&PropertyDelta::empty(), &a, &b);
    }

    #[test]
    fn test_validate_rejects_empty_key() {
        let d = PropertyDelta::from_ops(vec![PropertyOp::DeleteProperty { key: "".into() }]);
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut d = set("title", "doc");
        d.push_delete("stale");
        let json = serde_json::to_string(&d).unwrap();
        let back: PropertyDelta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
