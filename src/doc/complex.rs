//! Per-document assembly and the server-side document registry.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::session::Session;
use crate::storage::TransactionalFile;

use super::caret::CaretControl;
use super::durable::{BodyControl, FileCondition, PropertyControl};
use super::DocError;

/// One document's file plus its three payload controls. Exclusive owner
/// of all mutation for the document within this process.
pub struct DocComplex {
    doc_id: String,
    file: Arc<TransactionalFile>,
    body: BodyControl,
    property: PropertyControl,
    carets: Arc<CaretControl>,
    /// By-id weak views of the live sessions; `Session` owns the strong
    /// reference back to the complex.
    sessions: Mutex<HashMap<String, Weak<Session>>>,
}

impl DocComplex {
    /// Open (bootstrapping or recovering as needed) a document on `file`.
    pub async fn open(
        doc_id: impl Into<String>,
        file: Arc<TransactionalFile>,
    ) -> Result<Arc<Self>, DocError> {
        let doc_id = doc_id.into();
        let (body, body_condition) = BodyControl::open_body(file.clone()).await?;
        let (property, property_condition) =
            PropertyControl::open_property(file.clone()).await?;

        for (payload, condition) in
            [("body", body_condition), ("property", property_condition)]
        {
            match condition {
                FileCondition::Ok => {}
                FileCondition::Migrate => {
                    log::info!("{doc_id}: {payload} storage migrated on open");
                }
                FileCondition::Error => {
                    return Err(DocError::BadData(format!(
                        "{doc_id}: {payload} storage is unrecoverable"
                    )));
                }
            }
        }

        let carets = CaretControl::new(file.clone());
        log::info!("{doc_id}: document opened");
        Ok(Arc::new(Self {
            doc_id,
            file,
            body,
            property,
            carets,
            sessions: Mutex::new(HashMap::new()),
        }))
    }

    /// Open on a fresh in-memory file.
    pub async fn open_in_memory(doc_id: impl Into<String>) -> Result<Arc<Self>, DocError> {
        let doc_id = doc_id.into();
        let file = Arc::new(TransactionalFile::new(doc_id.clone()));
        Self::open(doc_id, file).await
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn file(&self) -> &Arc<TransactionalFile> {
        &self.file
    }

    pub fn body(&self) -> &BodyControl {
        &self.body
    }

    pub fn property(&self) -> &PropertyControl {
        &self.property
    }

    pub fn carets(&self) -> &Arc<CaretControl> {
        &self.carets
    }

    /// Mint a session for `author_id`: a fresh session ID, a caret with a
    /// server-assigned color, and the RPC-facing binding.
    pub async fn new_session(
        self: &Arc<Self>,
        author_id: &str,
    ) -> Result<Arc<Session>, DocError> {
        let session_id = Uuid::new_v4().simple().to_string();
        let body_rev = self.body.current_rev_num().await?;
        self.carets
            .begin_session(&session_id, author_id, body_rev)
            .await?;

        let session = Session::new(self.clone(), session_id.clone(), author_id.to_string());
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, weak| weak.strong_count() > 0);
        sessions.insert(session_id, Arc::downgrade(&session));
        Ok(session)
    }

    /// Drop a session's registration and retire its caret.
    pub(crate) async fn release_session(&self, session_id: &str) {
        self.sessions.lock().await.remove(session_id);
        if let Err(e) = self.carets.end_session(session_id).await {
            log::warn!("{}: caret teardown for {session_id} failed: {e}", self.doc_id);
        }
    }

    pub async fn session_count(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, weak| weak.strong_count() > 0);
        sessions.len()
    }

    /// Stop background work (the caret flusher).
    pub fn shutdown(&self) {
        self.carets.shutdown();
    }
}

/// Server-side registry: document ID → live assembly, get-or-open.
pub struct DocRegistry {
    docs: RwLock<HashMap<String, Arc<DocComplex>>>,
}

impl Default for DocRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DocRegistry {
    pub fn new() -> Self {
        Self { docs: RwLock::new(HashMap::new()) }
    }

    /// Get the live assembly for `doc_id`, opening it on first use.
    pub async fn get_or_open(&self, doc_id: &str) -> Result<Arc<DocComplex>, DocError> {
        {
            let docs = self.docs.read().await;
            if let Some(doc) = docs.get(doc_id) {
                return Ok(doc.clone());
            }
        }
        let mut docs = self.docs.write().await;
        // Double-check: another opener may have won the write lock.
        if let Some(doc) = docs.get(doc_id) {
            return Ok(doc.clone());
        }
        let doc = DocComplex::open_in_memory(doc_id).await?;
        docs.insert(doc_id.to_string(), doc.clone());
        Ok(doc)
    }

    /// Install a pre-opened document (e.g. on a specific file).
    pub async fn insert(&self, doc: Arc<DocComplex>) {
        self.docs
            .write()
            .await
            .insert(doc.doc_id().to_string(), doc);
    }

    /// Tear down a document with no live sessions. Returns whether it
    /// was removed.
    pub async fn remove_if_idle(&self, doc_id: &str) -> bool {
        let mut docs = self.docs.write().await;
        if let Some(doc) = docs.get(doc_id) {
            if doc.session_count().await == 0 {
                doc.shutdown();
                docs.remove(doc_id);
                log::info!("{doc_id}: document closed (idle)");
                return true;
            }
        }
        false
    }

    pub async fn doc_count(&self) -> usize {
        self.docs.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_bootstraps_all_payloads() {
        let doc = DocComplex::open_in_memory("d1").await.unwrap();
        assert_eq!(doc.body().current_rev_num().await.unwrap(), 0);
        assert_eq!(doc.property().current_rev_num().await.unwrap(), 0);
        assert_eq!(doc.carets().current_rev_num().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_new_session_creates_caret() {
        let doc = DocComplex::open_in_memory("d1").await.unwrap();
        let session = doc.new_session("alice").await.unwrap();
        assert!(!session.session_id().is_empty());
        assert_eq!(doc.session_count().await, 1);

        let snap = doc.carets().snapshot(None).await.unwrap();
        assert!(snap.caret(session.session_id()).is_some());
    }

    #[tokio::test]
    async fn test_sessions_are_weakly_held() {
        let doc = DocComplex::open_in_memory("d1").await.unwrap();
        let session = doc.new_session("alice").await.unwrap();
        session.close().await;
        drop(session);
        assert_eq!(doc.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_registry_get_or_open_is_idempotent() {
        let registry = DocRegistry::new();
        let a = registry.get_or_open("doc-a").await.unwrap();
        let b = registry.get_or_open("doc-a").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.doc_count().await, 1);
    }

    #[tokio::test]
    async fn test_registry_removes_idle_docs() {
        let registry = DocRegistry::new();
        let doc = registry.get_or_open("doc-a").await.unwrap();
        let session = doc.new_session("alice").await.unwrap();

        assert!(!registry.remove_if_idle("doc-a").await);
        session.close().await;
        drop(session);
        assert!(registry.remove_if_idle("doc-a").await);
        assert_eq!(registry.doc_count().await, 0);
    }
}
