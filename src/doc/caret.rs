//! Ephemeral caret control: bounded history, best-effort persistence,
//! and cross-server caret visibility.
//!
//! ```text
//! caret_update ──► DocControl<CaretDelta, EphemeralLog>   (authoritative)
//!                        │ dirty session ids
//!                        ▼
//!                  flush task: 5s batch delay
//!                        │ up to 10 retries, 10s apart
//!                        ▼
//!                  /caret/${sessionId}   (best-effort side channel)
//! ```
//!
//! The in-memory log is the source of truth for the editing session; the
//! stored copies only serve peers attached to the same document.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, Notify};

use crate::api::codec::decode;
use crate::delta::{
    Caret, CaretDelta, CaretField, CaretOp, CaretSnapshot, Change, Timestamp,
};
use crate::storage::{FileOp, StoragePath, TransactionSpec, TransactionalFile};

use super::colors::ColorPicker;
use super::control::{DocControl, EphemeralLog};
use super::durable::encode_buffer;
use super::DocError;

/// Caret revisions retained in memory, per document.
pub const CARET_RETENTION: usize = 100;

/// Batch delay before dirty carets are flushed to storage.
const FLUSH_DELAY: Duration = Duration::from_secs(5);

/// Pause between flush retries.
const FLUSH_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Flush attempts before a batch is dropped.
const FLUSH_MAX_RETRIES: u32 = 10;

type CaretLog = DocControl<CaretDelta, EphemeralLog<CaretDelta>>;

/// Per-document caret state. No persistence is required for correctness;
/// the transactional file is only a side channel toward peer servers.
pub struct CaretControl {
    control: CaretLog,
    shared: Arc<FlushShared>,
    flusher: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct FlushShared {
    file: Arc<TransactionalFile>,
    /// Locally-owned sessions awaiting a storage flush.
    dirty: Mutex<BTreeSet<String>>,
    kick: Notify,
    /// Sessions this server owns; the flusher writes only these, and
    /// remote absorption never touches them.
    local_sessions: Mutex<BTreeSet<String>>,
    colors: Mutex<ColorPicker>,
}

impl CaretControl {
    pub fn new(file: Arc<TransactionalFile>) -> Arc<Self> {
        let this = Arc::new(Self {
            control: DocControl::new(EphemeralLog::new(CARET_RETENTION)),
            shared: Arc::new(FlushShared {
                file,
                dirty: Mutex::new(BTreeSet::new()),
                kick: Notify::new(),
                local_sessions: Mutex::new(BTreeSet::new()),
                colors: Mutex::new(ColorPicker::new()),
            }),
            flusher: std::sync::Mutex::new(None),
        });
        let handle = tokio::spawn(flush_loop(Arc::downgrade(&this), this.shared.clone()));
        *this.flusher.lock().expect("flusher mutex") = Some(handle);
        this
    }

    /// Stop the flush task. Partial flushes are fine; carets are
    /// ephemeral.
    pub fn shutdown(&self) {
        if let Some(handle) = self.flusher.lock().expect("flusher mutex").take() {
            handle.abort();
        }
    }

    pub async fn current_rev_num(&self) -> Result<u64, DocError> {
        self.control.current_rev_num().await
    }

    pub async fn snapshot(&self, rev: Option<u64>) -> Result<CaretSnapshot, DocError> {
        let snap = self.control.snapshot(rev).await?;
        Ok(CaretSnapshot::from_snapshot(&snap))
    }

    /// A caret change after `base_rev`, long-polling like the body.
    /// Reports `revisionNotAvailable` once `base_rev` falls out of the
    /// bounded history, pushing the caller back to `snapshot`.
    pub async fn change_after(
        &self,
        base_rev: u64,
        max_wait: Duration,
    ) -> Result<Change<CaretDelta>, DocError> {
        self.control.change_after(base_rev, max_wait).await
    }

    /// Session open: create the caret with a server-assigned color.
    pub async fn begin_session(
        &self,
        session_id: &str,
        author_id: &str,
        doc_rev_num: u64,
    ) -> Result<Caret, DocError> {
        let color = self.shared.colors.lock().await.acquire(session_id);
        let caret = Caret {
            session_id: session_id.to_string(),
            author_id: author_id.to_string(),
            doc_rev_num,
            index: 0,
            length: 0,
            color: color.to_string(),
            last_active: Timestamp::now(),
        };
        self.apply(
            CaretDelta::from_ops(vec![CaretOp::BeginSession { caret: caret.clone() }]),
            author_id,
        )
        .await?;
        self.shared
            .local_sessions
            .lock()
            .await
            .insert(session_id.to_string());
        self.mark_dirty(session_id).await;
        log::info!(
            "{}: caret session {session_id} opened with color {color}",
            self.shared.file.id()
        );
        Ok(caret)
    }

    /// `caret_update(docRevNum, index, length)`: move a session's caret,
    /// creating it on first update. Returns the correction change.
    pub async fn update_caret(
        &self,
        session_id: &str,
        author_id: &str,
        doc_rev_num: u64,
        index: u64,
        length: u64,
    ) -> Result<Change<CaretDelta>, DocError> {
        if session_id.is_empty() {
            return Err(DocError::BadValue("empty session id".into()));
        }
        let snap = self.snapshot(None).await?;
        let delta = match snap.caret(session_id) {
            Some(existing) => {
                let mut ops = Vec::new();
                let mut set = |field: CaretField, value: Value| {
                    ops.push(CaretOp::SetField {
                        session_id: session_id.to_string(),
                        field,
                        value,
                    });
                };
                if existing.doc_rev_num != doc_rev_num {
                    set(CaretField::DocRevNum, Value::from(doc_rev_num));
                }
                if existing.index != index {
                    set(CaretField::Index, Value::from(index));
                }
                if existing.length != length {
                    set(CaretField::Length, Value::from(length));
                }
                set(CaretField::LastActive, Timestamp::now().to_value());
                CaretDelta::from_ops(ops)
            }
            None => {
                let color = self.shared.colors.lock().await.acquire(session_id);
                CaretDelta::from_ops(vec![CaretOp::BeginSession {
                    caret: Caret {
                        session_id: session_id.to_string(),
                        author_id: author_id.to_string(),
                        doc_rev_num,
                        index,
                        length,
                        color: color.to_string(),
                        last_active: Timestamp::now(),
                    },
                }])
            }
        };
        let correction = self.apply(delta, author_id).await?;
        self.mark_dirty(session_id).await;
        Ok(correction)
    }

    /// Session disconnect: retire the caret and release its color.
    pub async fn end_session(&self, session_id: &str) -> Result<(), DocError> {
        let snap = self.snapshot(None).await?;
        if snap.caret(session_id).is_some() {
            self.apply(
                CaretDelta::from_ops(vec![CaretOp::EndSession {
                    session_id: session_id.to_string(),
                }]),
                session_id,
            )
            .await?;
        }
        self.shared.colors.lock().await.release(session_id);
        self.shared.local_sessions.lock().await.remove(session_id);
        self.shared.dirty.lock().await.remove(session_id);

        // Best effort: retire the stored copy too.
        if let Ok(path) = caret_path(session_id) {
            let delete = TransactionSpec::new(vec![FileOp::DeletePath(path)])
                .expect("single delete is a valid spec");
            if let Err(e) = self.shared.file.transact(delete).await {
                log::warn!(
                    "{}: stored caret delete for {session_id} failed: {e}",
                    self.shared.file.id()
                );
            }
        }
        log::info!("{}: caret session {session_id} ended", self.shared.file.id());
        Ok(())
    }

    /// Merge carets written to `/caret/*` by peer servers attached to the
    /// same document. Locally-owned sessions are never touched. Returns
    /// the number of carets that changed.
    pub async fn absorb_remote(&self) -> Result<usize, DocError> {
        let caret_root = StoragePath::parse("/caret").expect("static path");
        let listing = self
            .shared
            .file
            .transact(TransactionSpec::new(vec![FileOp::ListPathPrefix(
                caret_root.clone(),
            )])?)
            .await?;
        let stored = if listing.paths.is_empty() {
            Default::default()
        } else {
            let reads = listing
                .paths
                .iter()
                .map(|p| FileOp::ReadPath(p.clone()))
                .collect();
            self.shared.file.transact(TransactionSpec::new(reads)?).await?.data
        };

        let local = self.shared.local_sessions.lock().await.clone();
        let snap = self.snapshot(None).await?;
        let mut ops = Vec::new();
        let mut seen = BTreeSet::new();

        for (path, buf) in &stored {
            let session_id = path.last_component().to_string();
            if local.contains(&session_id) {
                continue;
            }
            let parsed: Result<Caret, DocError> = (|| {
                let value: Value = serde_json::from_str(buf.to_utf8()?)
                    .map_err(|e| DocError::BadData(format!("stored caret: {e}")))?;
                decode::<Caret>(&value).map_err(|e| DocError::BadData(e.to_string()))
            })();
            let caret = match parsed {
                Ok(c) if c.session_id == session_id => c,
                Ok(_) => {
                    log::warn!("ignoring stored caret with mismatched id at {path}");
                    continue;
                }
                Err(e) => {
                    log::warn!("ignoring undecodable stored caret at {path}: {e}");
                    continue;
                }
            };
            seen.insert(session_id.clone());
            match snap.caret(&session_id) {
                Some(current) if *current == caret => {}
                Some(current) if current.author_id == caret.author_id => {
                    // Same session moved: synthesize field updates.
                    for (field, value) in [
                        (CaretField::DocRevNum, Value::from(caret.doc_rev_num)),
                        (CaretField::Index, Value::from(caret.index)),
                        (CaretField::Length, Value::from(caret.length)),
                        (CaretField::LastActive, caret.last_active.to_value()),
                    ] {
                        ops.push(CaretOp::SetField {
                            session_id: session_id.clone(),
                            field,
                            value,
                        });
                    }
                }
                _ => ops.push(CaretOp::BeginSession { caret }),
            }
        }

        // Remote sessions gone from storage have ended.
        for caret in &snap.carets {
            if !local.contains(&caret.session_id) && !seen.contains(&caret.session_id) {
                ops.push(CaretOp::EndSession { session_id: caret.session_id.clone() });
            }
        }

        if ops.is_empty() {
            return Ok(0);
        }
        let count = ops.len();
        self.apply(CaretDelta::from_ops(ops), "remote").await?;
        log::debug!(
            "{}: absorbed {count} remote caret ops",
            self.shared.file.id()
        );
        Ok(count)
    }

    /// Flush dirty carets immediately, bypassing the batch delay.
    pub async fn flush_now(&self) -> Result<(), DocError> {
        let drained: Vec<String> = {
            let mut dirty = self.shared.dirty.lock().await;
            std::mem::take(&mut *dirty).into_iter().collect()
        };
        self.flush_sessions(&drained).await
    }

    async fn flush_sessions(&self, session_ids: &[String]) -> Result<(), DocError> {
        if session_ids.is_empty() {
            return Ok(());
        }
        let snap = self.snapshot(None).await?;
        let mut ops = Vec::new();
        for session_id in session_ids {
            let Ok(path) = caret_path(session_id) else {
                log::warn!("skipping caret flush for unstorable id {session_id:?}");
                continue;
            };
            match snap.caret(session_id) {
                Some(caret) => ops.push(FileOp::WritePath(path, encode_buffer(caret))),
                None => ops.push(FileOp::DeletePath(path)),
            }
        }
        if ops.is_empty() {
            return Ok(());
        }
        self.shared.file.transact(TransactionSpec::new(ops)?).await?;
        log::trace!(
            "{}: flushed {} caret(s)",
            self.shared.file.id(),
            session_ids.len()
        );
        Ok(())
    }

    async fn apply(&self, delta: CaretDelta, author_id: &str) -> Result<Change<CaretDelta>, DocError> {
        let current = self.control.current_rev_num().await?;
        self.control
            .update(Change::new(
                current + 1,
                delta,
                Some(Timestamp::now()),
                Some(author_id.to_string()),
            ))
            .await
    }

    async fn mark_dirty(&self, session_id: &str) {
        self.shared.dirty.lock().await.insert(session_id.to_string());
        self.shared.kick.notify_one();
    }
}

fn caret_path(session_id: &str) -> Result<StoragePath, crate::storage::FileError> {
    StoragePath::parse("/caret")
        .expect("static path")
        .join(session_id)
}

/// Background flush: wait for dirt, batch it for `FLUSH_DELAY`, then
/// write with bounded retries. Holds only a weak reference so control
/// teardown stops the loop; abort-safe at any await point.
async fn flush_loop(control: Weak<CaretControl>, shared: Arc<FlushShared>) {
    loop {
        shared.kick.notified().await;
        tokio::time::sleep(FLUSH_DELAY).await;

        let mut attempt = 0;
        loop {
            let Some(control) = control.upgrade() else {
                return;
            };
            let drained: Vec<String> = {
                let mut dirty = shared.dirty.lock().await;
                std::mem::take(&mut *dirty).into_iter().collect()
            };
            if drained.is_empty() {
                break;
            }
            match control.flush_sessions(&drained).await {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    if attempt >= FLUSH_MAX_RETRIES {
                        log::error!(
                            "caret flush dropped after {attempt} attempts: {e}"
                        );
                        break;
                    }
                    log::warn!("caret flush attempt {attempt} failed: {e}");
                    // Put the batch back so new dirt merges in.
                    let mut dirty = shared.dirty.lock().await;
                    dirty.extend(drained);
                    drop(dirty);
                    drop(control);
                    tokio::time::sleep(FLUSH_RETRY_DELAY).await;
                }
            }
        }
    }
}

impl Drop for CaretControl {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh() -> (Arc<TransactionalFile>, Arc<CaretControl>) {
        let file = Arc::new(TransactionalFile::new("caret-test"));
        let control = CaretControl::new(file.clone());
        (file, control)
    }

    #[tokio::test]
    async fn test_begin_session_assigns_color() {
        let (_file, control) = fresh().await;
        let caret = control.begin_session("s1", "alice", 0).await.unwrap();
        assert!(crate::doc::colors::CARET_PALETTE.contains(&caret.color.as_str()));

        let snap = control.snapshot(None).await.unwrap();
        assert_eq!(snap.carets.len(), 1);
        assert_eq!(snap.caret("s1").unwrap().author_id, "alice");
    }

    #[tokio::test]
    async fn test_colors_distinct_across_sessions() {
        let (_file, control) = fresh().await;
        let a = control.begin_session("s1", "alice", 0).await.unwrap();
        let b = control.begin_session("s2", "bob", 0).await.unwrap();
        assert_ne!(a.color, b.color);
    }

    #[tokio::test]
    async fn test_update_moves_caret() {
        let (_file, control) = fresh().await;
        control.begin_session("s1", "alice", 0).await.unwrap();
        control.update_caret("s1", "alice", 4, 10, 2).await.unwrap();

        let caret = control.snapshot(None).await.unwrap().caret("s1").cloned().unwrap();
        assert_eq!((caret.doc_rev_num, caret.index, caret.length), (4, 10, 2));
    }

    #[tokio::test]
    async fn test_update_creates_on_first_update() {
        let (_file, control) = fresh().await;
        control.update_caret("s9", "carol", 2, 7, 0).await.unwrap();
        let snap = control.snapshot(None).await.unwrap();
        let caret = snap.caret("s9").unwrap();
        assert_eq!(caret.index, 7);
        assert!(!caret.color.is_empty());
    }

    #[tokio::test]
    async fn test_end_session_removes_caret() {
        let (_file, control) = fresh().await;
        control.begin_session("s1", "alice", 0).await.unwrap();
        control.end_session("s1").await.unwrap();
        assert!(control.snapshot(None).await.unwrap().carets.is_empty());
    }

    #[tokio::test]
    async fn test_bounded_history_reports_unavailable() {
        let (_file, control) = fresh().await;
        control.begin_session("s1", "alice", 0).await.unwrap();
        for n in 0..(CARET_RETENTION as u64 + 50) {
            control.update_caret("s1", "alice", 0, n, 0).await.unwrap();
        }
        let err = control
            .change_after(50, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, DocError::RevisionNotAvailable(_)));

        // The snapshot fallback still works.
        let snap = control.snapshot(None).await.unwrap();
        assert_eq!(snap.caret("s1").unwrap().index, CARET_RETENTION as u64 + 49);
    }

    #[tokio::test]
    async fn test_flush_writes_stored_caret() {
        let (file, control) = fresh().await;
        control.begin_session("s1", "alice", 0).await.unwrap();
        control.update_caret("s1", "alice", 1, 3, 0).await.unwrap();
        control.flush_now().await.unwrap();

        let path = StoragePath::parse("/caret/s1").unwrap();
        let result = file
            .transact(TransactionSpec::new(vec![FileOp::ReadPath(path.clone())]).unwrap())
            .await
            .unwrap();
        let buf = &result.data[&path];
        let value: Value = serde_json::from_str(buf.to_utf8().unwrap()).unwrap();
        let stored = decode::<Caret>(&value).unwrap();
        assert_eq!(stored.index, 3);
    }

    #[tokio::test]
    async fn test_end_session_deletes_stored_caret() {
        let (file, control) = fresh().await;
        control.begin_session("s1", "alice", 0).await.unwrap();
        control.flush_now().await.unwrap();
        control.end_session("s1").await.unwrap();

        let path = StoragePath::parse("/caret/s1").unwrap();
        let result = file
            .transact(TransactionSpec::new(vec![FileOp::ReadPath(path.clone())]).unwrap())
            .await
            .unwrap();
        assert!(!result.data.contains_key(&path));
    }

    #[tokio::test]
    async fn test_absorb_remote_carets() {
        let (file, control) = fresh().await;
        control.begin_session("local", "alice", 0).await.unwrap();

        // A peer server wrote a caret for a session we do not own.
        let remote = Caret {
            session_id: "remote1".into(),
            author_id: "bob".into(),
            doc_rev_num: 5,
            index: 12,
            length: 0,
            color: "#3cb44b".into(),
            last_active: Timestamp::now(),
        };
        file.transact(
            TransactionSpec::new(vec![FileOp::WritePath(
                StoragePath::parse("/caret/remote1").unwrap(),
                encode_buffer(&remote),
            )])
            .unwrap(),
        )
        .await
        .unwrap();

        assert!(control.absorb_remote().await.unwrap() > 0);
        let snap = control.snapshot(None).await.unwrap();
        assert_eq!(snap.caret("remote1").unwrap().index, 12);
        // Local caret untouched.
        assert!(snap.caret("local").is_some());

        // The peer retires the session; absorption ends it here too.
        file.transact(
            TransactionSpec::new(vec![FileOp::DeletePath(
                StoragePath::parse("/caret/remote1").unwrap(),
            )])
            .unwrap(),
        )
        .await
        .unwrap();
        assert!(control.absorb_remote().await.unwrap() > 0);
        assert!(control.snapshot(None).await.unwrap().caret("remote1").is_none());
    }

    #[tokio::test]
    async fn test_absorb_remote_noop_without_changes() {
        let (_file, control) = fresh().await;
        control.begin_session("s1", "alice", 0).await.unwrap();
        assert_eq!(control.absorb_remote().await.unwrap(), 0);
    }
}
