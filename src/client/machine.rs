//! The client sync state machine: one local editor married to one
//! server session.
//!
//! ```text
//! detached ──start──► starting ──gotSnapshot──► idle ◄─────────────┐
//!                                               │ editor text      │
//!                                               ▼                  │
//!                                           collecting ──push──► merging
//!                                                                  │
//!            errorWait ◄──apiError── (any)          gotUpdate ─────┘
//!               │ restart timer
//!               ▼
//!            detached        errorWait rate > budget ──► unrecoverable
//! ```
//!
//! Events go through one FIFO; handlers never block, they spawn tasks
//! that post follow-up events. Dispatch is an explicit `(state, event)`
//! table: exact match wins over `(state, any)`, over `(any, event)`,
//! over `(any, any)`.

use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::api::{ApiError, SessionProxy};
use crate::delta::{BodyDelta, Change, OtDelta, Snapshot};

use super::budget::ErrorBudget;
use super::editor::{EditorEvent, EditorHandle, CLIENT_SOURCE};

/// Client timing knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Local edits batch this long before a `body_update`.
    pub push_delay: Duration,
    /// Pause between successful pulls.
    pub pull_delay: Duration,
    /// Pause in `errorWait` before restarting.
    pub restart_delay: Duration,
    /// Minimum spacing of `caret_update` calls.
    pub caret_request_delay: Duration,
    /// Backoff after a failed `caret_update`.
    pub caret_error_delay: Duration,
    /// Error-budget trailing window.
    pub error_window: Duration,
    /// Error-budget ceiling, per minute.
    pub max_error_rate_per_minute: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            push_delay: Duration::from_millis(1000),
            pull_delay: Duration::from_millis(1000),
            restart_delay: Duration::from_millis(10_000),
            caret_request_delay: Duration::from_millis(250),
            caret_error_delay: Duration::from_millis(5000),
            error_window: Duration::from_secs(180),
            max_error_rate_per_minute: 2.25,
        }
    }
}

impl ClientConfig {
    /// Tight timings for tests.
    pub fn for_testing() -> Self {
        Self {
            push_delay: Duration::from_millis(20),
            pull_delay: Duration::from_millis(10),
            restart_delay: Duration::from_millis(50),
            caret_request_delay: Duration::from_millis(10),
            caret_error_delay: Duration::from_millis(50),
            error_window: Duration::from_secs(180),
            max_error_rate_per_minute: 2.25,
        }
    }
}

/// Machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Detached,
    Starting,
    Idle,
    Collecting,
    Merging,
    ErrorWait,
    Unrecoverable,
}

/// Machine events.
#[derive(Debug)]
pub enum Event {
    Start,
    GotSnapshot(Snapshot<BodyDelta>),
    GotChangeAfter { base: u64, change: Change<BodyDelta> },
    GotEditorEvent(EditorEvent),
    WantInput,
    WantToUpdate,
    GotUpdate { sent: BodyDelta, correction: Change<BodyDelta> },
    WantCaretPush,
    ApiError { method: &'static str, error: ApiError },
    Stop,
}

/// Fieldless mirror of [`Event`] for table matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Start,
    GotSnapshot,
    GotChangeAfter,
    GotEditorEvent,
    WantInput,
    WantToUpdate,
    GotUpdate,
    WantCaretPush,
    ApiError,
    Stop,
}

impl Event {
    fn kind(&self) -> EventKind {
        match self {
            Event::Start => EventKind::Start,
            Event::GotSnapshot(_) => EventKind::GotSnapshot,
            Event::GotChangeAfter { .. } => EventKind::GotChangeAfter,
            Event::GotEditorEvent(_) => EventKind::GotEditorEvent,
            Event::WantInput => EventKind::WantInput,
            Event::WantToUpdate => EventKind::WantToUpdate,
            Event::GotUpdate { .. } => EventKind::GotUpdate,
            Event::WantCaretPush => EventKind::WantCaretPush,
            Event::ApiError { .. } => EventKind::ApiError,
            Event::Stop => EventKind::Stop,
        }
    }
}

struct Envelope {
    /// `None` = valid in any epoch (external inputs); `Some` = posted by
    /// a task belonging to that epoch, dropped if the machine moved on.
    epoch: Option<u64>,
    event: Event,
}

type Handler<E> = fn(&mut ClientSync<E>, Event);

/// One dispatch-table row. `None` is the wildcard.
struct Rule<E: EditorHandle> {
    state: Option<State>,
    event: Option<EventKind>,
    handler: Handler<E>,
}

/// Shared view of the machine for embedders and tests.
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<Envelope>,
    state: Arc<StdRwLock<State>>,
}

impl ClientHandle {
    pub fn start(&self) {
        let _ = self.tx.send(Envelope { epoch: None, event: Event::Start });
    }

    pub fn stop(&self) {
        let _ = self.tx.send(Envelope { epoch: None, event: Event::Stop });
    }

    /// Feed one editor event into the machine's FIFO.
    pub fn editor_event(&self, event: EditorEvent) {
        let _ = self
            .tx
            .send(Envelope { epoch: None, event: Event::GotEditorEvent(event) });
    }

    /// An unbounded sender suitable for [`MemoryEditor::connect`]
    /// (crate::client::MemoryEditor).
    pub fn editor_events(&self) -> mpsc::UnboundedSender<EditorEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handle.editor_event(event);
            }
        });
        tx
    }

    pub fn state(&self) -> State {
        *self.state.read().expect("state lock")
    }
}

/// The machine. Single-task cooperative: construct, wire the editor,
/// spawn [`run`](Self::run), then [`ClientHandle::start`].
pub struct ClientSync<E: EditorHandle> {
    proxy: SessionProxy,
    editor: E,
    config: ClientConfig,
    rules: Vec<Rule<E>>,

    state: State,
    shared_state: Arc<StdRwLock<State>>,
    rx: mpsc::UnboundedReceiver<Envelope>,
    tx: mpsc::UnboundedSender<Envelope>,
    /// Bumped on every error teardown; stale task events are dropped.
    epoch: u64,
    tasks: JoinSet<()>,

    /// Client's view of the server body revision.
    rev_num: u64,
    /// Local edits not yet on the wire.
    pending: BodyDelta,
    /// The delta currently inside a `body_update` round trip.
    in_flight: Option<BodyDelta>,
    /// Whether a `body_getChangeAfter` is outstanding.
    poll_outstanding: bool,

    budget: ErrorBudget,

    // Caret throttle.
    last_caret_sent: Option<Instant>,
    pending_caret: Option<(u64, u64)>,
    caret_timer_armed: bool,
    caret_backoff_until: Option<Instant>,
}

impl<E: EditorHandle> ClientSync<E> {
    pub fn new(proxy: SessionProxy, editor: E, config: ClientConfig) -> (Self, ClientHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared_state = Arc::new(StdRwLock::new(State::Detached));
        let handle = ClientHandle { tx: tx.clone(), state: shared_state.clone() };
        let budget = ErrorBudget::new(config.error_window, config.max_error_rate_per_minute);
        let machine = Self {
            proxy,
            editor,
            config,
            rules: Self::rules(),
            state: State::Detached,
            shared_state,
            rx,
            tx,
            epoch: 0,
            tasks: JoinSet::new(),
            rev_num: 0,
            pending: BodyDelta::empty(),
            in_flight: None,
            poll_outstanding: false,
            budget,
            last_caret_sent: None,
            pending_caret: None,
            caret_timer_armed: false,
            caret_backoff_until: None,
        };
        (machine, handle)
    }

    /// The dispatch table. Order only matters within a tie-break class.
    fn rules() -> Vec<Rule<E>> {
        let row = |state, event, handler| Rule { state, event, handler };
        vec![
            row(Some(State::Detached), Some(EventKind::Start), Self::on_start as Handler<E>),
            row(Some(State::Starting), Some(EventKind::GotSnapshot), Self::on_got_snapshot),
            row(Some(State::Idle), Some(EventKind::WantInput), Self::on_want_input),
            row(Some(State::Idle), Some(EventKind::GotChangeAfter), Self::on_got_change_after),
            row(Some(State::Idle), Some(EventKind::GotEditorEvent), Self::on_editor_event),
            row(Some(State::Collecting), Some(EventKind::GotEditorEvent), Self::on_editor_event),
            row(Some(State::Collecting), Some(EventKind::WantToUpdate), Self::on_want_to_update),
            row(Some(State::Merging), Some(EventKind::GotEditorEvent), Self::on_editor_event),
            row(Some(State::Merging), Some(EventKind::GotUpdate), Self::on_got_update),
            row(Some(State::ErrorWait), Some(EventKind::Start), Self::on_restart),
            // Terminal state swallows everything.
            row(Some(State::Unrecoverable), None, Self::on_ignore),
            // Wildcard-state rows.
            row(None, Some(EventKind::ApiError), Self::on_api_error),
            row(None, Some(EventKind::GotChangeAfter), Self::on_stale_pull),
            row(None, Some(EventKind::WantCaretPush), Self::on_want_caret_push),
            // Anything else is a stale or out-of-order event.
            row(None, None, Self::on_ignore),
        ]
    }

    /// Exact `(state, event)` beats `(state, any)` beats `(any, event)`
    /// beats `(any, any)`.
    fn find_handler(&self, state: State, kind: EventKind) -> Handler<E> {
        let mut best: Option<(u8, Handler<E>)> = None;
        for rule in &self.rules {
            let state_ok = rule.state.map_or(true, |s| s == state);
            let event_ok = rule.event.map_or(true, |e| e == kind);
            if !state_ok || !event_ok {
                continue;
            }
            let specificity = match (rule.state.is_some(), rule.event.is_some()) {
                (true, true) => 3,
                (true, false) => 2,
                (false, true) => 1,
                (false, false) => 0,
            };
            if best.map_or(true, |(s, _)| specificity > s) {
                best = Some((specificity, rule.handler));
            }
        }
        best.expect("wildcard row always matches").1
    }

    fn dispatch(&mut self, event: Event) {
        let handler = self.find_handler(self.state, event.kind());
        handler(self, event);
        *self.shared_state.write().expect("state lock") = self.state;
    }

    /// Run the event loop until stopped.
    pub async fn run(mut self) {
        while let Some(envelope) = self.rx.recv().await {
            if let Some(epoch) = envelope.epoch {
                if epoch != self.epoch {
                    log::trace!("dropping stale event from epoch {epoch}");
                    continue;
                }
            }
            if matches!(envelope.event, Event::Stop) {
                log::info!("client sync stopping");
                break;
            }
            self.dispatch(envelope.event);
        }
        self.tasks.abort_all();
        self.editor.set_enabled(false);
    }

    // ── plumbing ─────────────────────────────────────────────────────

    fn post(&self, event: Event) {
        let _ = self.tx.send(Envelope { epoch: Some(self.epoch), event });
    }

    /// Spawn a cancellable timer that posts `event` after `delay`.
    fn arm_timer(&mut self, delay: Duration, event: Event) {
        let tx = self.tx.clone();
        let epoch = self.epoch;
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Envelope { epoch: Some(epoch), event });
        });
    }

    fn spawn_net<F>(&mut self, fut: F)
    where
        F: std::future::Future<Output = Event> + Send + 'static,
    {
        let tx = self.tx.clone();
        let epoch = self.epoch;
        self.tasks.spawn(async move {
            let event = fut.await;
            let _ = tx.send(Envelope { epoch: Some(epoch), event });
        });
    }

    fn enter(&mut self, state: State) {
        log::debug!("client sync: {:?} -> {state:?}", self.state);
        self.state = state;
    }

    // ── handlers ─────────────────────────────────────────────────────

    fn on_start(&mut self, _event: Event) {
        self.enter(State::Starting);
        self.editor.set_enabled(false);
        let proxy = self.proxy.clone();
        self.spawn_net(async move {
            match proxy.body_snapshot(None).await {
                Ok(snapshot) => Event::GotSnapshot(snapshot),
                Err(error) => Event::ApiError { method: "body_getSnapshot", error },
            }
        });
    }

    fn on_got_snapshot(&mut self, event: Event) {
        let Event::GotSnapshot(snapshot) = event else { return };
        self.rev_num = snapshot.rev_num;
        self.pending = BodyDelta::empty();
        self.in_flight = None;
        self.poll_outstanding = false;
        self.editor.set_contents(&snapshot.contents);
        self.editor.set_enabled(true);
        self.enter(State::Idle);
        log::info!("client sync attached at revision {}", self.rev_num);
        self.post(Event::WantInput);
    }

    fn on_want_input(&mut self, _event: Event) {
        if self.poll_outstanding {
            return;
        }
        self.poll_outstanding = true;
        let proxy = self.proxy.clone();
        let base = self.rev_num;
        self.spawn_net(async move {
            match proxy.body_change_after(base).await {
                Ok(change) => Event::GotChangeAfter { base, change },
                Err(error) => Event::ApiError { method: "body_getChangeAfter", error },
            }
        });
    }

    fn on_got_change_after(&mut self, event: Event) {
        let Event::GotChangeAfter { base, change } = event else { return };
        self.poll_outstanding = false;
        // A poll from an older base spans changes the update correction
        // already integrated; its content must not be applied twice.
        if base != self.rev_num {
            log::debug!(
                "discarding pull from base {base}; client is at {}",
                self.rev_num
            );
            self.post(Event::WantInput);
            return;
        }
        // Idle with a current base means no local divergence: the remote
        // change applies to the editor as-is.
        self.editor.apply_change(&change.delta);
        self.rev_num = change.rev_num;
        self.arm_timer(self.config.pull_delay, Event::WantInput);
    }

    /// A pull that resolved outside `idle`; its content is superseded by
    /// the correction the in-flight update will return.
    fn on_stale_pull(&mut self, _event: Event) {
        self.poll_outstanding = false;
    }

    fn on_editor_event(&mut self, event: Event) {
        let Event::GotEditorEvent(editor_event) = event else { return };
        // Our own server-applied edits come back with our tag; echoing
        // them would loop forever.
        if editor_event.source() == CLIENT_SOURCE {
            return;
        }
        match editor_event {
            EditorEvent::TextChange { delta, .. } => {
                match self.pending.compose(&delta, false) {
                    Ok(next) => self.pending = next,
                    Err(e) => return self.defect(&format!("pending compose: {e}")),
                }
                if self.state == State::Idle {
                    self.enter(State::Collecting);
                    self.arm_timer(self.config.push_delay, Event::WantToUpdate);
                }
            }
            EditorEvent::SelectionChange { index, length, .. } => {
                self.request_caret(index, length);
            }
        }
    }

    fn on_want_to_update(&mut self, _event: Event) {
        if self.pending.is_empty() {
            self.enter(State::Idle);
            self.post(Event::WantInput);
            return;
        }
        let sent = std::mem::replace(&mut self.pending, BodyDelta::empty());
        self.in_flight = Some(sent.clone());
        self.enter(State::Merging);
        let proxy = self.proxy.clone();
        let base = self.rev_num;
        self.spawn_net(async move {
            match proxy.body_update(base, &sent).await {
                Ok(correction) => Event::GotUpdate { sent, correction },
                Err(error) => Event::ApiError { method: "body_update", error },
            }
        });
    }

    fn on_got_update(&mut self, event: Event) {
        let Event::GotUpdate { sent: _, correction } = event else { return };
        self.in_flight = None;
        let d_more = std::mem::replace(&mut self.pending, BodyDelta::empty());

        if !correction.delta.is_empty() {
            // Editor shows base∘sent∘dMore; the correction was computed
            // against base∘sent. Slide it past dMore for the editor, and
            // rebase dMore onto it for the next send.
            let d_corr = &correction.delta;
            let integrated = match d_more.transform(d_corr, false) {
                Ok(d) => d,
                Err(e) => return self.defect(&format!("correction transform: {e}")),
            };
            let rebased_more = match d_corr.transform(&d_more, true) {
                Ok(d) => d,
                Err(e) => return self.defect(&format!("pending rebase: {e}")),
            };
            self.editor.apply_change(&integrated);
            self.pending = rebased_more;
        } else {
            self.pending = d_more;
        }
        self.rev_num = correction.rev_num;

        if self.pending.is_empty() {
            self.enter(State::Idle);
            self.post(Event::WantInput);
        } else {
            self.enter(State::Collecting);
            self.arm_timer(self.config.push_delay, Event::WantToUpdate);
        }
    }

    fn on_api_error(&mut self, event: Event) {
        let Event::ApiError { method, error } = event else { return };

        // An expired long poll is expected traffic: re-issue and move on.
        if error.is_timeout() && method == "body_getChangeAfter" {
            self.poll_outstanding = false;
            if self.state == State::Idle {
                self.post(Event::WantInput);
            }
            return;
        }

        // Caret traffic is best-effort; back off without disturbing the
        // editing session.
        if method == "caret_update" {
            log::warn!("caret update failed ({error}); backing off");
            self.caret_backoff_until = Some(Instant::now() + self.config.caret_error_delay);
            return;
        }

        log::warn!("api error from {method}: {error}");
        let now = std::time::Instant::now();
        self.budget.record(now);
        self.teardown();
        if self.budget.is_exhausted(now) {
            log::error!("error budget exhausted; client is unrecoverable");
            self.enter(State::Unrecoverable);
            return;
        }
        self.enter(State::ErrorWait);
        self.arm_timer(self.config.restart_delay, Event::Start);
    }

    fn on_restart(&mut self, _event: Event) {
        self.enter(State::Detached);
        self.post(Event::Start);
    }

    fn on_ignore(&mut self, event: Event) {
        log::trace!("ignoring {:?} in {:?}", event.kind(), self.state);
    }

    /// Cancel the current epoch: abort tasks, drop in-flight work,
    /// disable editing until recovery.
    fn teardown(&mut self) {
        self.epoch += 1;
        self.tasks.abort_all();
        self.editor.set_enabled(false);
        self.poll_outstanding = false;
        self.in_flight = None;
        self.pending = BodyDelta::empty();
        self.pending_caret = None;
        self.caret_timer_armed = false;
    }

    fn defect(&mut self, detail: &str) {
        log::error!("invariant violation: {detail}");
        self.teardown();
        self.enter(State::Unrecoverable);
    }

    // ── caret flow ───────────────────────────────────────────────────

    fn on_want_caret_push(&mut self, _event: Event) {
        self.caret_timer_armed = false;
        if let Some((index, length)) = self.pending_caret.take() {
            self.request_caret(index, length);
        }
    }

    /// Throttled `caret_update`: at most one per `caret_request_delay`,
    /// with an extra backoff after failures.
    fn request_caret(&mut self, index: u64, length: u64) {
        let now = Instant::now();
        let mut not_before = self
            .last_caret_sent
            .map(|sent| sent + self.config.caret_request_delay);
        if let Some(backoff) = self.caret_backoff_until {
            not_before = Some(not_before.map_or(backoff, |t| t.max(backoff)));
        }

        if let Some(at) = not_before.filter(|at| *at > now) {
            self.pending_caret = Some((index, length));
            if !self.caret_timer_armed {
                self.caret_timer_armed = true;
                self.arm_timer(at - now, Event::WantCaretPush);
            }
            return;
        }

        self.last_caret_sent = Some(now);
        self.caret_backoff_until = None;
        let proxy = self.proxy.clone();
        let doc_rev = self.rev_num;
        self.spawn_net(async move {
            match proxy.caret_update(doc_rev, index, length).await {
                // The correction for our own caret has nothing to teach
                // us; position is authoritative locally.
                Ok(_) => Event::WantCaretPush,
                Err(error) => Event::ApiError { method: "caret_update", error },
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::editor::MemoryEditor;

    fn dummy_machine() -> (ClientSync<MemoryEditor>, ClientHandle) {
        let client = crate::api::ApiClient::new();
        let proxy = SessionProxy::new(client, "t1");
        ClientSync::new(proxy, MemoryEditor::new(), ClientConfig::for_testing())
    }

    #[tokio::test]
    async fn test_tie_break_exact_over_wildcards() {
        let (machine, _handle) = dummy_machine();
        // (Idle, GotEditorEvent) has an exact row; (Starting,
        // GotEditorEvent) falls to the (any, any) wildcard.
        let exact = machine.find_handler(State::Idle, EventKind::GotEditorEvent);
        let expected = ClientSync::<MemoryEditor>::on_editor_event as Handler<MemoryEditor>;
        assert_eq!(exact as usize, expected as usize);
        let wild = machine.find_handler(State::Starting, EventKind::GotEditorEvent);
        let expected = ClientSync::<MemoryEditor>::on_ignore as Handler<MemoryEditor>;
        assert_eq!(wild as usize, expected as usize);
    }

    #[tokio::test]
    async fn test_tie_break_state_any_over_any_event() {
        let (machine, _handle) = dummy_machine();
        // Unrecoverable has a (state, any) row which must beat the
        // (any, ApiError) row.
        let handler = machine.find_handler(State::Unrecoverable, EventKind::ApiError);
        let expected = ClientSync::<MemoryEditor>::on_ignore as Handler<MemoryEditor>;
        assert_eq!(handler as usize, expected as usize);
        // Any other state without an exact row still gets the error row.
        let handler = machine.find_handler(State::Starting, EventKind::ApiError);
        let expected = ClientSync::<MemoryEditor>::on_api_error as Handler<MemoryEditor>;
        assert_eq!(handler as usize, expected as usize);
    }

    #[tokio::test]
    async fn test_self_sourced_events_are_skipped() {
        let (mut machine, _handle) = dummy_machine();
        machine.state = State::Idle;
        machine.dispatch(Event::GotEditorEvent(EditorEvent::TextChange {
            delta: BodyDelta::text_document("x"),
            source: CLIENT_SOURCE.into(),
        }));
        // No transition, nothing collected.
        assert_eq!(machine.state, State::Idle);
        assert!(machine.pending.is_empty());
    }

    #[tokio::test]
    async fn test_user_event_starts_collecting() {
        let (mut machine, _handle) = dummy_machine();
        machine.state = State::Idle;
        machine.dispatch(Event::GotEditorEvent(EditorEvent::TextChange {
            delta: BodyDelta::text_document("x"),
            source: "user".into(),
        }));
        assert_eq!(machine.state, State::Collecting);
        assert!(!machine.pending.is_empty());
    }

    #[tokio::test]
    async fn test_error_budget_burst_goes_unrecoverable() {
        let (mut machine, _handle) = dummy_machine();
        machine.state = State::Idle;
        // 5.0/min over two simulated minutes is over the 2.25 ceiling;
        // ten rapid-fire errors trip it immediately here.
        for _ in 0..10 {
            machine.dispatch(Event::ApiError {
                method: "body_update",
                error: ApiError::ConnectionError("boom".into()),
            });
        }
        assert_eq!(machine.state, State::Unrecoverable);

        // Terminal: further events change nothing.
        machine.dispatch(Event::Start);
        assert_eq!(machine.state, State::Unrecoverable);
    }

    #[tokio::test]
    async fn test_single_error_waits_then_restarts() {
        let (mut machine, _handle) = dummy_machine();
        machine.state = State::Idle;
        machine.dispatch(Event::ApiError {
            method: "body_update",
            error: ApiError::ConnectionError("boom".into()),
        });
        assert_eq!(machine.state, State::ErrorWait);

        machine.dispatch(Event::Start);
        // Restart bounces through detached and posts Start to re-init.
        assert_eq!(machine.state, State::Detached);
    }

    #[tokio::test]
    async fn test_long_poll_timeout_is_transparent() {
        let (mut machine, _handle) = dummy_machine();
        machine.state = State::Idle;
        machine.poll_outstanding = true;
        machine.dispatch(Event::ApiError {
            method: "body_getChangeAfter",
            error: ApiError::TimedOut,
        });
        assert_eq!(machine.state, State::Idle);
        assert_eq!(machine.budget.error_count(), 0);
    }

    #[tokio::test]
    async fn test_caret_error_only_backs_off() {
        let (mut machine, _handle) = dummy_machine();
        machine.state = State::Idle;
        machine.dispatch(Event::ApiError {
            method: "caret_update",
            error: ApiError::ConnectionError("boom".into()),
        });
        assert_eq!(machine.state, State::Idle);
        assert!(machine.caret_backoff_until.is_some());
        assert_eq!(machine.budget.error_count(), 0);
    }

    #[tokio::test]
    async fn test_merge_with_edits_during_round_trip() {
        let (mut machine, _handle) = dummy_machine();
        // Editor showed "hello" at rev 1; we sent " world" (at 5) and a
        // local "!" landed at 5 during the flight. Server correction says
        // another client prepended ">" (insert at 0), committed first.
        machine.state = State::Merging;
        machine.rev_num = 1;
        let mut d_more = BodyDelta::new();
        d_more.push_retain(5, Default::default());
        d_more.push_insert("!", Default::default());
        machine.pending = d_more;

        let mut d_corr = BodyDelta::new();
        d_corr.push_insert(">", Default::default());
        // Editor body after base∘sent∘dMore.
        machine.editor.set_contents(&BodyDelta::text_document("hello! world"));

        let mut sent = BodyDelta::new();
        sent.push_retain(5, Default::default());
        sent.push_insert(" world", Default::default());
        machine.dispatch(Event::GotUpdate {
            sent,
            correction: Change::correction(3, d_corr),
        });

        assert_eq!(machine.rev_num, 3);
        // Correction applied past the local "!".
        assert_eq!(machine.editor.text(), ">hello! world");
        // The local "!" is requeued, rebased past the correction.
        assert_eq!(machine.state, State::Collecting);
        assert!(!machine.pending.is_empty());
        let rebased = &machine.pending;
        assert_eq!(rebased.base_len(), 6);
    }
}
