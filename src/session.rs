//! Sessions: one (author, document, connection) triple, exposed to the
//! API layer as an RPC target.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::delta::{
    BodyDelta, CaretDelta, CaretSnapshot, Change, PropertyDelta, Snapshot, Timestamp,
};
use crate::doc::{DocComplex, DocError};

/// Ceiling for long-polling `*_getChangeAfter` calls; the client retries
/// the resulting `timedOut` transparently.
pub const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// A weak view onto `(DocComplex, author, session id)`. The session owns
/// the reference to its document; the document only holds it by ID.
pub struct Session {
    complex: Arc<DocComplex>,
    session_id: String,
    author_id: String,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        complex: Arc<DocComplex>,
        session_id: String,
        author_id: String,
    ) -> Arc<Self> {
        Arc::new(Self { complex, session_id, author_id, closed: AtomicBool::new(false) })
    }

    /// Identification string for client logs.
    pub fn log_info(&self) -> String {
        format!(
            "doc={} session={} author={}",
            self.complex.doc_id(),
            self.session_id,
            self.author_id
        )
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn author_id(&self) -> &str {
        &self.author_id
    }

    pub fn complex(&self) -> &Arc<DocComplex> {
        &self.complex
    }

    /// Tear down this session: retire its caret and registration.
    /// Idempotent; called when the owning API connection goes away.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.complex.release_session(&self.session_id).await;
        log::info!("session closed: {}", self.log_info());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), DocError> {
        if self.is_closed() {
            return Err(DocError::BadValue("session is closed".into()));
        }
        Ok(())
    }

    // ── body ─────────────────────────────────────────────────────────

    pub async fn body_snapshot(
        &self,
        rev_num: Option<u64>,
    ) -> Result<Snapshot<BodyDelta>, DocError> {
        self.check_open()?;
        self.complex.body().snapshot(rev_num).await
    }

    pub async fn body_change(&self, rev_num: u64) -> Result<Change<BodyDelta>, DocError> {
        self.check_open()?;
        self.complex.body().change(rev_num).await
    }

    pub async fn body_change_after(
        &self,
        base_rev_num: u64,
    ) -> Result<Change<BodyDelta>, DocError> {
        self.check_open()?;
        self.complex
            .body()
            .change_after(base_rev_num, LONG_POLL_TIMEOUT)
            .await
    }

    /// Submit a client edit made against `base_rev_num`; the returned
    /// correction steers the client onto the committed server state.
    pub async fn body_update(
        &self,
        base_rev_num: u64,
        delta: BodyDelta,
    ) -> Result<Change<BodyDelta>, DocError> {
        self.check_open()?;
        let rev_num = base_rev_num
            .checked_add(1)
            .ok_or_else(|| DocError::BadValue("base revision out of range".into()))?;
        self.complex
            .body()
            .update(Change::new(
                rev_num,
                delta,
                Some(Timestamp::now()),
                Some(self.author_id.clone()),
            ))
            .await
    }

    // ── caret ────────────────────────────────────────────────────────

    pub async fn caret_snapshot(
        &self,
        rev_num: Option<u64>,
    ) -> Result<CaretSnapshot, DocError> {
        self.check_open()?;
        self.complex.carets().snapshot(rev_num).await
    }

    pub async fn caret_change_after(
        &self,
        base_rev_num: u64,
    ) -> Result<Change<CaretDelta>, DocError> {
        self.check_open()?;
        self.complex
            .carets()
            .change_after(base_rev_num, LONG_POLL_TIMEOUT)
            .await
    }

    pub async fn caret_update(
        &self,
        doc_rev_num: u64,
        index: u64,
        length: u64,
    ) -> Result<Change<CaretDelta>, DocError> {
        self.check_open()?;
        self.complex
            .carets()
            .update_caret(&self.session_id, &self.author_id, doc_rev_num, index, length)
            .await
    }

    // ── property ─────────────────────────────────────────────────────

    pub async fn property_snapshot(
        &self,
        rev_num: Option<u64>,
    ) -> Result<Snapshot<PropertyDelta>, DocError> {
        self.check_open()?;
        self.complex.property().snapshot(rev_num).await
    }

    pub async fn property_change(
        &self,
        rev_num: u64,
    ) -> Result<Change<PropertyDelta>, DocError> {
        self.check_open()?;
        self.complex.property().change(rev_num).await
    }

    pub async fn property_change_after(
        &self,
        base_rev_num: u64,
    ) -> Result<Change<PropertyDelta>, DocError> {
        self.check_open()?;
        self.complex
            .property()
            .change_after(base_rev_num, LONG_POLL_TIMEOUT)
            .await
    }

    pub async fn property_update(
        &self,
        base_rev_num: u64,
        delta: PropertyDelta,
    ) -> Result<Change<PropertyDelta>, DocError> {
        self.check_open()?;
        let rev_num = base_rev_num
            .checked_add(1)
            .ok_or_else(|| DocError::BadValue("base revision out of range".into()))?;
        self.complex
            .property()
            .update(Change::new(
                rev_num,
                delta,
                Some(Timestamp::now()),
                Some(self.author_id.clone()),
            ))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{Attrs, OtDelta};

    fn insert_at(offset: u64, text: &str) -> BodyDelta {
        let mut d = BodyDelta::new();
        d.push_retain(offset, Attrs::new());
        d.push_insert(text, Attrs::new());
        d
    }

    async fn session() -> Arc<Session> {
        DocComplex::open_in_memory("session-test")
            .await
            .unwrap()
            .new_session("alice")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_log_info_names_the_triple() {
        let s = session().await;
        let info = s.log_info();
        assert!(info.contains("session-test"));
        assert!(info.contains("alice"));
        assert!(info.contains(s.session_id()));
    }

    #[tokio::test]
    async fn test_body_update_and_snapshot() {
        let s = session().await;
        let correction = s.body_update(0, insert_at(0, "hello")).await.unwrap();
        assert_eq!(correction.rev_num, 1);
        assert!(correction.delta.is_empty());

        let snap = s.body_snapshot(Some(1)).await.unwrap();
        assert_eq!(snap.contents.to_text(), "hello");

        let change = s.body_change(1).await.unwrap();
        assert_eq!(change.author_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_caret_update_through_session() {
        let s = session().await;
        s.body_update(0, insert_at(0, "hello")).await.unwrap();
        s.caret_update(1, 5, 0).await.unwrap();

        let snap = s.caret_snapshot(None).await.unwrap();
        let caret = snap.caret(s.session_id()).unwrap();
        assert_eq!(caret.index, 5);
        assert_eq!(caret.doc_rev_num, 1);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_calls() {
        let s = session().await;
        s.close().await;
        assert!(s.body_snapshot(None).await.is_err());
        assert!(s.caret_update(0, 0, 0).await.is_err());
        // close is idempotent
        s.close().await;
    }
}
