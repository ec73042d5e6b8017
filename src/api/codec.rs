//! Codec: named encodings for everything that crosses the wire.
//!
//! Registered classes encode as `{"<Name>": [...ctorArgs]}` and decode by
//! constructor dispatch. The registry is a constructor-injected value
//! (no process-wide singletons); boundary layers use it to revalidate
//! any delta-shaped value arriving from the other side.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::delta::{
    BodyDelta, Caret, CaretDelta, CaretSnapshot, Change, PropertyDelta, Snapshot, Timestamp,
};

use super::message::ErrorInfo;

/// Errors from encoding or decoding registered values.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    /// The value is not a well-formed `{"<Name>": [...]}` envelope, or
    /// its payload fails shape validation.
    BadData(String),
    /// The envelope names a class this codec does not register.
    UnknownTag(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::BadData(detail) => write!(f, "Undecodable value: {detail}"),
            CodecError::UnknownTag(tag) => write!(f, "Unregistered encoding: {tag}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// A type with a registered wire encoding.
pub trait Codable: Sized {
    const TAG: &'static str;

    /// The `[...ctorArgs]` payload.
    fn encode_args(&self) -> Vec<Value>;

    fn decode_args(args: &[Value]) -> Result<Self, CodecError>;
}

/// Encode a registered value into its `{"<Name>": [...]}` envelope.
pub fn encode<T: Codable>(value: &T) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert(T::TAG.to_string(), Value::Array(value.encode_args()));
    Value::Object(obj)
}

/// Decode a value known to be of type `T`. The envelope tag must match.
pub fn decode<T: Codable>(value: &Value) -> Result<T, CodecError> {
    let (tag, args) = split_envelope(value)?;
    if tag != T::TAG {
        return Err(CodecError::BadData(format!(
            "expected {:?}, found {tag:?}",
            T::TAG
        )));
    }
    T::decode_args(args)
}

fn split_envelope(value: &Value) -> Result<(&str, &[Value]), CodecError> {
    let obj = value
        .as_object()
        .filter(|o| o.len() == 1)
        .ok_or_else(|| CodecError::BadData("not a single-key envelope".into()))?;
    let (tag, payload) = obj.iter().next().expect("len checked above");
    let args = payload
        .as_array()
        .ok_or_else(|| CodecError::BadData(format!("{tag}: payload is not an array")))?;
    Ok((tag, args))
}

/// Any value this codec knows how to decode.
#[derive(Debug, Clone, PartialEq)]
pub enum CodedValue {
    BodyDelta(BodyDelta),
    CaretDelta(CaretDelta),
    PropertyDelta(PropertyDelta),
    BodyChange(Change<BodyDelta>),
    CaretChange(Change<CaretDelta>),
    PropertyChange(Change<PropertyDelta>),
    BodySnapshot(Snapshot<BodyDelta>),
    PropertySnapshot(Snapshot<PropertyDelta>),
    CaretSnapshot(CaretSnapshot),
    Caret(Caret),
    Timestamp(Timestamp),
    ErrorInfo(ErrorInfo),
}

type DecodeFn = fn(&[Value]) -> Result<CodedValue, CodecError>;

/// The codec registry: tag → constructor dispatch.
pub struct Codec {
    decoders: BTreeMap<&'static str, DecodeFn>,
}

impl Codec {
    /// The standard registry covering every wire class of this protocol.
    pub fn standard() -> Self {
        let mut decoders: BTreeMap<&'static str, DecodeFn> = BTreeMap::new();
        macro_rules! register {
            ($ty:ty, $variant:ident) => {
                decoders.insert(<$ty as Codable>::TAG, |args| {
                    <$ty as Codable>::decode_args(args).map(CodedValue::$variant)
                });
            };
        }
        register!(BodyDelta, BodyDelta);
        register!(CaretDelta, CaretDelta);
        register!(PropertyDelta, PropertyDelta);
        register!(Change<BodyDelta>, BodyChange);
        register!(Change<CaretDelta>, CaretChange);
        register!(Change<PropertyDelta>, PropertyChange);
        register!(Snapshot<BodyDelta>, BodySnapshot);
        register!(Snapshot<PropertyDelta>, PropertySnapshot);
        register!(CaretSnapshot, CaretSnapshot);
        register!(Caret, Caret);
        register!(Timestamp, Timestamp);
        register!(ErrorInfo, ErrorInfo);
        Self { decoders }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    /// Decode a value by constructor dispatch on its envelope tag.
    pub fn decode_any(&self, value: &Value) -> Result<CodedValue, CodecError> {
        let (tag, args) = split_envelope(value)?;
        let decode = self
            .decoders
            .get(tag)
            .ok_or_else(|| CodecError::UnknownTag(tag.to_string()))?;
        decode(args)
    }
}

fn want_u64(args: &[Value], i: usize, what: &str) -> Result<u64, CodecError> {
    args.get(i)
        .and_then(Value::as_u64)
        .ok_or_else(|| CodecError::BadData(format!("{what}: arg {i} wants u64")))
}

fn want_str<'a>(args: &'a [Value], i: usize, what: &str) -> Result<&'a str, CodecError> {
    args.get(i)
        .and_then(Value::as_str)
        .ok_or_else(|| CodecError::BadData(format!("{what}: arg {i} wants string")))
}

fn want_arity(args: &[Value], n: usize, what: &str) -> Result<(), CodecError> {
    if args.len() == n {
        Ok(())
    } else {
        Err(CodecError::BadData(format!(
            "{what}: wants {n} args, found {}",
            args.len()
        )))
    }
}

impl Codable for Timestamp {
    const TAG: &'static str = "Timestamp";

    fn encode_args(&self) -> Vec<Value> {
        vec![Value::from(self.secs), Value::from(self.usecs)]
    }

    fn decode_args(args: &[Value]) -> Result<Self, CodecError> {
        want_arity(args, 2, Self::TAG)?;
        let secs = args[0]
            .as_i64()
            .ok_or_else(|| CodecError::BadData("Timestamp: secs wants i64".into()))?;
        let usecs = want_u64(args, 1, Self::TAG)?;
        if usecs >= 1_000_000 {
            return Err(CodecError::BadData("Timestamp: usecs out of range".into()));
        }
        Ok(Timestamp { secs, usecs: usecs as u32 })
    }
}

impl Codable for ErrorInfo {
    const TAG: &'static str = "ErrorInfo";

    fn encode_args(&self) -> Vec<Value> {
        vec![Value::from(self.name.clone()), Value::from(self.detail.clone())]
    }

    fn decode_args(args: &[Value]) -> Result<Self, CodecError> {
        want_arity(args, 2, Self::TAG)?;
        Ok(ErrorInfo {
            name: want_str(args, 0, Self::TAG)?.to_string(),
            detail: want_str(args, 1, Self::TAG)?.to_string(),
        })
    }
}

/// Deltas carry their op list as one serde-shaped ctor arg, re-validated
/// on every decode (divergent encodings are rejected as bad data).
macro_rules! impl_delta_codable {
    ($ty:ty, $tag:literal) => {
        impl Codable for $ty {
            const TAG: &'static str = $tag;

            fn encode_args(&self) -> Vec<Value> {
                vec![serde_json::to_value(self).expect("delta serializes")]
            }

            fn decode_args(args: &[Value]) -> Result<Self, CodecError> {
                want_arity(args, 1, Self::TAG)?;
                let delta: $ty = serde_json::from_value(args[0].clone())
                    .map_err(|e| CodecError::BadData(format!("{}: {e}", Self::TAG)))?;
                delta
                    .validate()
                    .map_err(|e| CodecError::BadData(format!("{}: {e}", Self::TAG)))?;
                Ok(delta)
            }
        }
    };
}

impl_delta_codable!(BodyDelta, "BodyDelta");
impl_delta_codable!(CaretDelta, "CaretDelta");
impl_delta_codable!(PropertyDelta, "PropertyDelta");

macro_rules! impl_change_codable {
    ($delta:ty, $tag:literal) => {
        impl Codable for Change<$delta> {
            const TAG: &'static str = $tag;

            fn encode_args(&self) -> Vec<Value> {
                vec![
                    Value::from(self.rev_num),
                    encode(&self.delta),
                    self.timestamp.map_or(Value::Null, |ts| encode(&ts)),
                    self.author_id.clone().map_or(Value::Null, Value::from),
                ]
            }

            fn decode_args(args: &[Value]) -> Result<Self, CodecError> {
                want_arity(args, 4, Self::TAG)?;
                let rev_num = want_u64(args, 0, Self::TAG)?;
                let delta = decode::<$delta>(&args[1])?;
                let timestamp = match &args[2] {
                    Value::Null => None,
                    v => Some(decode::<Timestamp>(v)?),
                };
                let author_id = match &args[3] {
                    Value::Null => None,
                    v => Some(
                        v.as_str()
                            .ok_or_else(|| {
                                CodecError::BadData(format!("{}: author wants string", Self::TAG))
                            })?
                            .to_string(),
                    ),
                };
                Ok(Change { rev_num, delta, timestamp, author_id })
            }
        }
    };
}

impl_change_codable!(BodyDelta, "BodyChange");
impl_change_codable!(CaretDelta, "CaretChange");
impl_change_codable!(PropertyDelta, "PropertyChange");

macro_rules! impl_snapshot_codable {
    ($delta:ty, $tag:literal) => {
        impl Codable for Snapshot<$delta> {
            const TAG: &'static str = $tag;

            fn encode_args(&self) -> Vec<Value> {
                vec![Value::from(self.rev_num), encode(&self.contents)]
            }

            fn decode_args(args: &[Value]) -> Result<Self, CodecError> {
                want_arity(args, 2, Self::TAG)?;
                let rev_num = want_u64(args, 0, Self::TAG)?;
                let contents = decode::<$delta>(&args[1])?;
                Snapshot::new(rev_num, contents)
                    .map_err(|e| CodecError::BadData(format!("{}: {e}", Self::TAG)))
            }
        }
    };
}

impl_snapshot_codable!(BodyDelta, "BodySnapshot");
impl_snapshot_codable!(PropertyDelta, "PropertySnapshot");

impl Codable for Caret {
    const TAG: &'static str = "Caret";

    fn encode_args(&self) -> Vec<Value> {
        vec![
            Value::from(self.session_id.clone()),
            Value::from(self.author_id.clone()),
            Value::from(self.doc_rev_num),
            Value::from(self.index),
            Value::from(self.length),
            Value::from(self.color.clone()),
            encode(&self.last_active),
        ]
    }

    fn decode_args(args: &[Value]) -> Result<Self, CodecError> {
        want_arity(args, 7, Self::TAG)?;
        let caret = Caret {
            session_id: want_str(args, 0, Self::TAG)?.to_string(),
            author_id: want_str(args, 1, Self::TAG)?.to_string(),
            doc_rev_num: want_u64(args, 2, Self::TAG)?,
            index: want_u64(args, 3, Self::TAG)?,
            length: want_u64(args, 4, Self::TAG)?,
            color: want_str(args, 5, Self::TAG)?.to_string(),
            last_active: decode::<Timestamp>(&args[6])?,
        };
        caret
            .validate()
            .map_err(|e| CodecError::BadData(format!("{}: {e}", Self::TAG)))?;
        Ok(caret)
    }
}

impl Codable for CaretSnapshot {
    const TAG: &'static str = "CaretSnapshot";

    fn encode_args(&self) -> Vec<Value> {
        let carets = self.carets.iter().map(encode).collect();
        vec![Value::from(self.rev_num), Value::Array(carets)]
    }

    fn decode_args(args: &[Value]) -> Result<Self, CodecError> {
        want_arity(args, 2, Self::TAG)?;
        let rev_num = want_u64(args, 0, Self::TAG)?;
        let entries = args[1]
            .as_array()
            .ok_or_else(|| CodecError::BadData("CaretSnapshot: carets want array".into()))?;
        let carets = entries
            .iter()
            .map(decode::<Caret>)
            .collect::<Result<Vec<_>, _>>()?;
        let snapshot = CaretSnapshot { rev_num, carets };
        snapshot
            .validate()
            .map_err(|e| CodecError::BadData(format!("{}: {e}", Self::TAG)))?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{Attrs, CaretField, CaretOp, OtDelta};

    #[test]
    fn test_envelope_shape() {
        let ts = Timestamp { secs: 5, usecs: 6 };
        let v = encode(&ts);
        assert_eq!(v, serde_json::json!({ "Timestamp": [5, 6] }));
        assert_eq!(decode::<Timestamp>(&v).unwrap(), ts);
    }

    #[test]
    fn test_decode_rejects_wrong_tag() {
        let v = encode(&Timestamp { secs: 1, usecs: 2 });
        assert!(decode::<ErrorInfo>(&v).is_err());
    }

    #[test]
    fn test_body_change_roundtrip() {
        let mut delta = BodyDelta::new();
        delta.push_retain(3, Attrs::new());
        delta.push_insert("hi", Attrs::new());
        let change = Change::new(
            7,
            delta,
            Some(Timestamp { secs: 1, usecs: 2 }),
            Some("alice".to_string()),
        );
        let v = encode(&change);
        assert_eq!(decode::<Change<BodyDelta>>(&v).unwrap(), change);
    }

    #[test]
    fn test_change_with_nulls() {
        let change: Change<BodyDelta> = Change::correction(3, BodyDelta::empty());
        let v = encode(&change);
        let back = decode::<Change<BodyDelta>>(&v).unwrap();
        assert_eq!(back.timestamp, None);
        assert_eq!(back.author_id, None);
    }

    #[test]
    fn test_snapshot_decode_revalidates_document_form() {
        // Hand-build a snapshot envelope whose contents are not document
        // form; the boundary must reject it.
        let mut diff = BodyDelta::new();
        diff.push_retain(2, Attrs::new());
        diff.push_insert("x", Attrs::new());
        let v = serde_json::json!({ "BodySnapshot": [1, encode(&diff)] });
        assert!(decode::<Snapshot<BodyDelta>>(&v).is_err());
    }

    #[test]
    fn test_caret_snapshot_roundtrip() {
        let caret = Caret {
            session_id: "s1".into(),
            author_id: "alice".into(),
            doc_rev_num: 4,
            index: 10,
            length: 2,
            color: "#20b2aa".into(),
            last_active: Timestamp { secs: 9, usecs: 0 },
        };
        let snap = CaretSnapshot { rev_num: 3, carets: vec![caret] };
        let v = encode(&snap);
        assert_eq!(decode::<CaretSnapshot>(&v).unwrap(), snap);
    }

    #[test]
    fn test_caret_delta_roundtrip() {
        let delta = CaretDelta::from_ops(vec![
            CaretOp::EndSession { session_id: "s2".into() },
            CaretOp::SetField {
                session_id: "s1".into(),
                field: CaretField::Index,
                value: Value::from(5u64),
            },
        ]);
        let v = encode(&delta);
        assert_eq!(decode::<CaretDelta>(&v).unwrap(), delta);
    }

    #[test]
    fn test_registry_dispatch() {
        let codec = Codec::standard();
        let v = encode(&Timestamp { secs: 1, usecs: 2 });
        match codec.decode_any(&v).unwrap() {
            CodedValue::Timestamp(ts) => assert_eq!(ts.secs, 1),
            other => panic!("Expected timestamp, got {other:?}"),
        }

        let unknown = serde_json::json!({ "Mystery": [] });
        assert!(matches!(
            codec.decode_any(&unknown),
            Err(CodecError::UnknownTag(_))
        ));
        assert!(codec.has_tag("BodyChange"));
        assert!(!codec.has_tag("Mystery"));
    }

    #[test]
    fn test_malformed_envelopes() {
        for v in [
            serde_json::json!(42),
            serde_json::json!({}),
            serde_json::json!({ "A": [], "B": [] }),
            serde_json::json!({ "Timestamp": "not-array" }),
        ] {
            assert!(Codec::standard().decode_any(&v).is_err(), "accepted {v}");
        }
    }
}
