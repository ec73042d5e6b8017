//! The editor-facing contract: what the sync machine needs from the
//! widget, and an in-memory editor for embedding-free use and tests.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::delta::{BodyDelta, OtDelta};

/// Source tag on every edit this subsystem applies on behalf of the
/// server. Events carrying it are never echoed back (no feedback loops).
pub const CLIENT_SOURCE: &str = "tandem-client";

/// What the editor reports into the sync machine.
#[derive(Debug, Clone)]
pub enum EditorEvent {
    TextChange { delta: BodyDelta, source: String },
    SelectionChange { index: u64, length: u64, source: String },
}

impl EditorEvent {
    pub fn source(&self) -> &str {
        match self {
            EditorEvent::TextChange { source, .. }
            | EditorEvent::SelectionChange { source, .. } => source,
        }
    }
}

/// The slice of the editor widget the machine drives. The widget itself
/// is external; implementations bridge to it.
pub trait EditorHandle: Send + 'static {
    /// Replace the whole document (initial snapshot install).
    fn set_contents(&mut self, contents: &BodyDelta);

    /// Apply a server-originated change to the current contents.
    fn apply_change(&mut self, delta: &BodyDelta);

    /// Editing is disabled between errors and recovery.
    fn set_enabled(&mut self, enabled: bool);
}

#[derive(Default)]
struct EditorInner {
    contents: BodyDelta,
    enabled: bool,
    /// Where echo events go once connected to a machine.
    events: Option<mpsc::UnboundedSender<EditorEvent>>,
}

/// In-memory editor: holds a document-form delta, echoes applied changes
/// the way a real widget does (tagged with [`CLIENT_SOURCE`]), and lets
/// tests inject user edits.
#[derive(Clone, Default)]
pub struct MemoryEditor {
    inner: Arc<Mutex<EditorInner>>,
}

impl MemoryEditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire the editor's event stream into a sync machine's input.
    pub fn connect(&self, events: mpsc::UnboundedSender<EditorEvent>) {
        self.inner.lock().expect("editor mutex").events = Some(events);
    }

    /// A user edit: applied locally and reported with the user source.
    pub fn local_edit(&self, delta: BodyDelta) {
        let mut inner = self.inner.lock().expect("editor mutex");
        inner.contents = inner
            .contents
            .compose(&delta, true)
            .expect("local edit applies to document");
        if let Some(events) = &inner.events {
            let _ = events.send(EditorEvent::TextChange { delta, source: "user".into() });
        }
    }

    /// A user selection move.
    pub fn local_select(&self, index: u64, length: u64) {
        let inner = self.inner.lock().expect("editor mutex");
        if let Some(events) = &inner.events {
            let _ = events.send(EditorEvent::SelectionChange {
                index,
                length,
                source: "user".into(),
            });
        }
    }

    pub fn text(&self) -> String {
        self.inner.lock().expect("editor mutex").contents.to_text()
    }

    pub fn contents(&self) -> BodyDelta {
        self.inner.lock().expect("editor mutex").contents.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().expect("editor mutex").enabled
    }
}

impl EditorHandle for MemoryEditor {
    fn set_contents(&mut self, contents: &BodyDelta) {
        self.inner.lock().expect("editor mutex").contents = contents.clone();
    }

    fn apply_change(&mut self, delta: &BodyDelta) {
        let mut inner = self.inner.lock().expect("editor mutex");
        match inner.contents.compose(delta, true) {
            Ok(next) => inner.contents = next,
            Err(e) => {
                log::error!("editor rejected change: {e}");
                return;
            }
        }
        // Real widgets report API-applied edits too; the machine relies
        // on the source tag to skip them.
        if let Some(events) = &inner.events {
            let _ = events.send(EditorEvent::TextChange {
                delta: delta.clone(),
                source: CLIENT_SOURCE.into(),
            });
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.inner.lock().expect("editor mutex").enabled = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::Attrs;

    fn insert_at(offset: u64, text: &str) -> BodyDelta {
        let mut d = BodyDelta::new();
        d.push_retain(offset, Attrs::new());
        d.push_insert(text, Attrs::new());
        d
    }

    #[test]
    fn test_set_and_apply() {
        let mut editor = MemoryEditor::new();
        editor.set_contents(&BodyDelta::text_document("hello"));
        editor.apply_change(&insert_at(5, "!"));
        assert_eq!(editor.text(), "hello!");
    }

    #[tokio::test]
    async fn test_apply_echoes_with_client_source() {
        let mut editor = MemoryEditor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        editor.connect(tx);
        editor.set_contents(&BodyDelta::text_document("hi"));
        editor.apply_change(&insert_at(2, "!"));

        match rx.recv().await.unwrap() {
            EditorEvent::TextChange { source, .. } => assert_eq!(source, CLIENT_SOURCE),
            other => panic!("Expected text change, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_local_edit_reports_user_source() {
        let editor = MemoryEditor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        editor.connect(tx);
        editor.local_edit(BodyDelta::text_document("typed"));

        match rx.recv().await.unwrap() {
            EditorEvent::TextChange { source, .. } => assert_eq!(source, "user"),
            other => panic!("Expected text change, got {other:?}"),
        }
        assert_eq!(editor.text(), "typed");
    }

    #[test]
    fn test_enable_toggle() {
        let mut editor = MemoryEditor::new();
        assert!(!editor.is_enabled());
        editor.set_enabled(true);
        assert!(editor.is_enabled());
    }
}
