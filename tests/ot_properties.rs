//! Property tests for the OT algebra: convergence (TP1), composition,
//! and document-form preservation across all three payload kinds.

use proptest::prelude::*;
use serde_json::Value;

use tandem::delta::{
    Attrs, BodyDelta, Caret, CaretDelta, CaretField, CaretOp, OtDelta, PropertyDelta,
    Timestamp,
};

// ── body payload ─────────────────────────────────────────────────────

/// One abstract edit step; materialized against whatever base length is
/// left when it is reached.
#[derive(Debug, Clone)]
enum EditMove {
    Retain(u8),
    Insert(String),
    Delete(u8),
}

fn edit_move() -> impl Strategy<Value = EditMove> {
    prop_oneof![
        (1u8..10).prop_map(EditMove::Retain),
        "[a-z]{1,6}".prop_map(EditMove::Insert),
        (1u8..10).prop_map(EditMove::Delete),
    ]
}

fn build_edit(base_len: u64, moves: &[EditMove]) -> BodyDelta {
    let mut delta = BodyDelta::new();
    let mut remaining = base_len;
    for m in moves {
        match m {
            EditMove::Retain(n) => {
                let take = (*n as u64).min(remaining);
                delta.push_retain(take, Attrs::new());
                remaining -= take;
            }
            EditMove::Insert(text) => delta.push_insert(text, Attrs::new()),
            EditMove::Delete(n) => {
                let take = (*n as u64).min(remaining);
                delta.push_delete(take);
                remaining -= take;
            }
        }
    }
    delta
}

fn body_case() -> impl Strategy<Value = (BodyDelta, BodyDelta, BodyDelta)> {
    (
        "[a-z ]{0,24}",
        prop::collection::vec(edit_move(), 0..6),
        prop::collection::vec(edit_move(), 0..6),
    )
        .prop_map(|(text, a_moves, b_moves)| {
            let base = BodyDelta::text_document(&text);
            let len = base.target_len();
            (base.clone(), build_edit(len, &a_moves), build_edit(len, &b_moves))
        })
}

proptest! {
    /// TP1: applying `a` then `b` transformed after `a` equals applying
    /// `b` then `a` transformed after `b`, with one consistent winner.
    #[test]
    fn body_tp1_converges((base, a, b) in body_case()) {
        let left = base
            .compose(&a, true).unwrap()
            .compose(&a.transform(&b, true).unwrap(), true).unwrap();
        let right = base
            .compose(&b, true).unwrap()
            .compose(&b.transform(&a, false).unwrap(), true).unwrap();
        prop_assert_eq!(left, right);
    }

    /// Composition is associative when applied to a document.
    #[test]
    fn body_compose_application_associative((base, a, b) in body_case()) {
        let after_a = base.compose(&a, true).unwrap();
        let b_on_a = a.transform(&b, true).unwrap();
        let stepwise = after_a.compose(&b_on_a, true).unwrap();
        let fused = base.compose(&a.compose(&b_on_a, false).unwrap(), true).unwrap();
        prop_assert_eq!(stepwise, fused);
    }

    /// Composing any edit onto a document yields a document.
    #[test]
    fn body_document_form_is_closed((base, a, _b) in body_case()) {
        let next = base.compose(&a, true).unwrap();
        prop_assert!(next.is_document());
    }

    /// Empty is the identity of compose and neutral under transform.
    /// (Compose canonicalizes, so compare through the canonical form.)
    #[test]
    fn body_empty_identity((base, a, _b) in body_case()) {
        let empty = BodyDelta::empty();
        let canonical = empty.compose(&a, false).unwrap();
        prop_assert_eq!(empty.compose(&canonical, false).unwrap(), canonical.clone());
        prop_assert_eq!(canonical.compose(&empty, false).unwrap(), canonical.clone());
        prop_assert_eq!(empty.transform(&canonical, true).unwrap(), canonical.clone());
        // The canonical form acts identically on documents.
        prop_assert_eq!(
            base.compose(&a, true).unwrap(),
            base.compose(&canonical, true).unwrap()
        );
    }

    /// The composed document is `a`'s output plus whatever base tail `a`
    /// never touched.
    #[test]
    fn body_compose_length_arithmetic((base, a, _b) in body_case()) {
        let next = base.compose(&a, true).unwrap();
        let untouched = base.target_len().saturating_sub(a.base_len());
        prop_assert_eq!(next.target_len(), a.target_len() + untouched);
    }
}

// ── property payload ─────────────────────────────────────────────────

fn property_delta() -> impl Strategy<Value = PropertyDelta> {
    prop::collection::vec(
        ((0usize..4), prop::option::of("[a-z]{1,4}")),
        0..5,
    )
    .prop_map(|ops| {
        let mut delta = PropertyDelta::new();
        for (key_idx, value) in ops {
            let key = format!("k{key_idx}");
            match value {
                Some(v) => delta.push_set(&key, Value::String(v)),
                None => delta.push_delete(&key),
            }
        }
        delta
    })
}

fn property_base() -> impl Strategy<Value = PropertyDelta> {
    prop::collection::btree_map((0usize..4).prop_map(|i| format!("k{i}")), "[a-z]{1,4}", 0..4)
        .prop_map(|entries| {
            let mut delta = PropertyDelta::new();
            for (key, value) in entries {
                delta.push_set(&key, Value::String(value));
            }
            delta
        })
}

proptest! {
    #[test]
    fn property_tp1_converges(
        base in property_base(),
        a in property_delta(),
        b in property_delta(),
    ) {
        let left = base
            .compose(&a, true).unwrap()
            .compose(&a.transform(&b, true).unwrap(), true).unwrap();
        let right = base
            .compose(&b, true).unwrap()
            .compose(&b.transform(&a, false).unwrap(), true).unwrap();
        prop_assert_eq!(left, right);
    }

    #[test]
    fn property_document_has_unique_keys(base in property_base(), a in property_delta()) {
        let next = base.compose(&a, true).unwrap();
        prop_assert!(next.is_document());
    }
}

// ── caret payload ────────────────────────────────────────────────────

fn test_caret(session: usize, index: u64) -> Caret {
    Caret {
        session_id: format!("s{session}"),
        author_id: format!("author{session}"),
        doc_rev_num: 0,
        index,
        length: 0,
        color: "#4363d8".to_string(),
        last_active: Timestamp { secs: 0, usecs: 0 },
    }
}

fn caret_op() -> impl Strategy<Value = CaretOp> {
    prop_oneof![
        ((0usize..3), (0u64..50)).prop_map(|(s, i)| CaretOp::BeginSession {
            caret: test_caret(s, i)
        }),
        (0usize..3).prop_map(|s| CaretOp::EndSession { session_id: format!("s{s}") }),
        ((0usize..3), (0u64..50)).prop_map(|(s, i)| CaretOp::SetField {
            session_id: format!("s{s}"),
            field: CaretField::Index,
            value: Value::from(i),
        }),
    ]
}

fn caret_delta() -> impl Strategy<Value = CaretDelta> {
    prop::collection::vec(caret_op(), 0..5).prop_map(CaretDelta::from_ops)
}

proptest! {
    #[test]
    fn caret_tp1_converges(a in caret_delta(), b in caret_delta()) {
        // Base has all three sessions live, so field updates always have
        // a caret to land on.
        let base = CaretDelta::from_ops(vec![
            CaretOp::BeginSession { caret: test_caret(0, 0) },
            CaretOp::BeginSession { caret: test_caret(1, 0) },
            CaretOp::BeginSession { caret: test_caret(2, 0) },
        ]);
        let left = base
            .compose(&a, true).unwrap()
            .compose(&a.transform(&b, true).unwrap(), true).unwrap();
        let right = base
            .compose(&b, true).unwrap()
            .compose(&b.transform(&a, false).unwrap(), true).unwrap();
        prop_assert_eq!(left, right);
    }

    #[test]
    fn caret_document_sessions_unique(a in caret_delta()) {
        let base = CaretDelta::from_ops(vec![
            CaretOp::BeginSession { caret: test_caret(0, 0) },
            CaretOp::BeginSession { caret: test_caret(1, 0) },
            CaretOp::BeginSession { caret: test_caret(2, 0) },
        ]);
        let next = base.compose(&a, true).unwrap();
        prop_assert!(next.is_document());
        let mut ids: Vec<_> = next.carets().iter().map(|c| c.session_id.clone()).collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        prop_assert_eq!(ids.len(), total);
    }
}
