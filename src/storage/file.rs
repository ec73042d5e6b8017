//! The transactional file: atomic multi-op transactions over one
//! document's bytes.

use std::collections::BTreeMap;
use std::pin::pin;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::buffer::{BufferHash, FrozenBuffer};
use super::path::StoragePath;
use super::spec::{FileOp, OpCategory, TransactionResult, TransactionSpec};
use super::FileError;

/// Ceiling applied to wait ops whose spec carries no explicit timeout.
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// All persistent bytes for one document: hierarchical path bindings plus
/// content-addressed blobs.
///
/// A transaction is atomic: prerequisites, reads, and writes evaluate
/// under one lock acquisition, so either every prerequisite passes and
/// every mutation applies, or nothing does. Wait ops re-check their
/// condition on every mutation until satisfied or timed out.
pub struct TransactionalFile {
    id: String,
    state: Mutex<FileState>,
    changed: Notify,
}

#[derive(Default)]
struct FileState {
    bindings: BTreeMap<StoragePath, FrozenBuffer>,
    blobs: BTreeMap<BufferHash, FrozenBuffer>,
}

impl TransactionalFile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(FileState::default()),
            changed: Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run one transaction. See the module docs for the category order
    /// and the spec-level mixing rules (enforced at spec construction).
    pub async fn transact(&self, spec: TransactionSpec) -> Result<TransactionResult, FileError> {
        let deadline = match (spec.has_waits(), spec.timeout()) {
            (_, Some(t)) => Some(Instant::now() + t),
            (true, None) => Some(Instant::now() + DEFAULT_WAIT_TIMEOUT),
            (false, None) => None,
        };

        loop {
            let mut notified = pin!(self.changed.notified());
            {
                let mut state = self.state.lock().await;
                check_prerequisites(&state, &spec)?;
                let mut result = run_pulls(&state, &spec);

                if !spec.has_waits() {
                    if run_pushes(&mut state, &spec) {
                        self.changed.notify_waiters();
                    }
                    return Ok(result);
                }

                let triggered = satisfied_waits(&state, &spec);
                if !triggered.is_empty() {
                    result.triggered = triggered;
                    return Ok(result);
                }
                // Register interest while the lock still blocks mutation,
                // so no wakeup between unlock and await is lost.
                notified.as_mut().enable();
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(FileError::TimedOut);
                    }
                }
                None => notified.await,
            }
        }
    }
}

fn check_prerequisites(state: &FileState, spec: &TransactionSpec) -> Result<(), FileError> {
    for op in spec.ops_in(OpCategory::Prerequisite) {
        let (held, detail) = match op {
            FileOp::CheckBlobAbsent(h) => {
                (!state.blobs.contains_key(h), format!("blob {h} present"))
            }
            FileOp::CheckBlobPresent(h) => {
                (state.blobs.contains_key(h), format!("blob {h} absent"))
            }
            FileOp::CheckPathAbsent(p) => {
                (!state.bindings.contains_key(p), format!("path {p} present"))
            }
            FileOp::CheckPathPresent(p) => {
                (state.bindings.contains_key(p), format!("path {p} absent"))
            }
            FileOp::CheckPathIs(p, h) => (
                state.bindings.get(p).map(FrozenBuffer::hash) == Some(h),
                format!("path {p} is not {h}"),
            ),
            FileOp::CheckPathNot(p, h) => (
                state.bindings.get(p).map(FrozenBuffer::hash) != Some(h),
                format!("path {p} is {h}"),
            ),
            _ => unreachable!("non-prerequisite op in prerequisite pass"),
        };
        if !held {
            return Err(FileError::PrerequisiteFailed(detail));
        }
    }
    Ok(())
}

fn run_pulls(state: &FileState, spec: &TransactionSpec) -> TransactionResult {
    let mut result = TransactionResult::default();
    for op in spec.ops() {
        match op {
            FileOp::ListPathPrefix(p) => {
                for bound in state.bindings.keys() {
                    if p.is_strict_prefix_of(bound) {
                        result.paths.insert(truncate_to_child(p, bound));
                    }
                }
            }
            FileOp::ListPathRange(p, start, end) => {
                for bound in state.bindings.keys() {
                    if let Some(n) = range_child_index(p, bound, *start, *end) {
                        result.paths.insert(p.join_index(n));
                    }
                }
            }
            FileOp::ReadPath(p) => {
                if let Some(buf) = state.bindings.get(p) {
                    result.data.insert(p.clone(), buf.clone());
                }
            }
            FileOp::ReadPathRange(p, start, end) => {
                for (bound, buf) in &state.bindings {
                    if range_child_index(p, bound, *start, *end)
                        .is_some_and(|n| *bound == p.join_index(n))
                    {
                        result.data.insert(bound.clone(), buf.clone());
                    }
                }
            }
            FileOp::ReadBlob(h) => {
                if let Some(buf) = state.blobs.get(h) {
                    result.blobs.insert(h.clone(), buf.clone());
                }
            }
            _ => {}
        }
    }
    result
}

/// Apply deletes then writes. Returns whether anything changed.
fn run_pushes(state: &mut FileState, spec: &TransactionSpec) -> bool {
    let mut mutated = false;
    for op in spec.ops_in(OpCategory::Delete) {
        match op {
            FileOp::DeletePath(p) => {
                mutated |= state.bindings.remove(p).is_some();
            }
            FileOp::DeletePathPrefix(p) => {
                let before = state.bindings.len();
                state.bindings.retain(|b, _| !p.is_strict_prefix_of(b) && b != p);
                mutated |= state.bindings.len() != before;
            }
            FileOp::DeletePathRange(p, start, end) => {
                let before = state.bindings.len();
                state
                    .bindings
                    .retain(|b, _| range_child_index(p, b, *start, *end).is_none());
                mutated |= state.bindings.len() != before;
            }
            FileOp::DeleteBlob(h) => {
                mutated |= state.blobs.remove(h).is_some();
            }
            FileOp::DeleteAll => {
                mutated |= !state.bindings.is_empty();
                state.bindings.clear();
            }
            _ => unreachable!("non-delete op in delete pass"),
        }
    }
    for op in spec.ops_in(OpCategory::Write) {
        match op {
            FileOp::WritePath(p, buf) => {
                let unchanged = state.bindings.get(p) == Some(buf);
                if !unchanged {
                    state.bindings.insert(p.clone(), buf.clone());
                    mutated = true;
                }
            }
            FileOp::WriteBlob(buf) => {
                mutated |= state
                    .blobs
                    .insert(buf.hash().clone(), buf.clone())
                    .is_none();
            }
            _ => unreachable!("non-write op in write pass"),
        }
    }
    mutated
}

fn satisfied_waits(state: &FileState, spec: &TransactionSpec) -> Vec<StoragePath> {
    let mut triggered = Vec::new();
    for op in spec.ops_in(OpCategory::Wait) {
        let FileOp::WhenPathNot(p, h) = op else {
            unreachable!("non-wait op in wait pass");
        };
        if state.bindings.get(p).map(FrozenBuffer::hash) != Some(h) {
            triggered.push(p.clone());
        }
    }
    triggered
}

/// If `bound` sits at or under `prefix/n` for some `n` in `[start, end)`,
/// the index `n`; otherwise `None`.
fn range_child_index(
    prefix: &StoragePath,
    bound: &StoragePath,
    start: u64,
    end: u64,
) -> Option<u64> {
    if !prefix.is_strict_prefix_of(bound) {
        return None;
    }
    let depth = prefix.components().count();
    let n: u64 = bound.components().nth(depth)?.parse().ok()?;
    (start..end).contains(&n).then_some(n)
}

/// The child of `prefix` on the way to `descendant`.
fn truncate_to_child(prefix: &StoragePath, descendant: &StoragePath) -> StoragePath {
    let depth = prefix.components().count();
    let child = descendant
        .components()
        .nth(depth)
        .expect("descendant at least one level below prefix");
    prefix
        .join(child)
        .expect("component of a parsed path is valid")
}
