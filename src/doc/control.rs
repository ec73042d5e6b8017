//! The generic revision-log engine: OT `update`, long-poll
//! `change_after`, and snapshot derivation, shared by every payload.

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::delta::{Change, OtDelta, Snapshot};

use super::DocError;

/// Retry limit for the `update` compare-and-swap loop.
pub(crate) const UPDATE_RETRY_LIMIT: u32 = 25;

/// Backing store for one payload's append-only revision log.
///
/// Implementations serialize appends themselves (`try_append` is a
/// compare-and-swap); `DocControl` layers the OT protocol on top.
pub trait RevisionLog<D: OtDelta>: Send + Sync {
    /// Current head revision.
    fn current_rev(&self) -> impl std::future::Future<Output = Result<u64, DocError>> + Send;

    /// Direct log read of one change.
    fn change(&self, rev: u64) -> impl std::future::Future<Output = Result<Change<D>, DocError>> + Send;

    /// All changes in `from..=to`, read at one consistent point.
    fn changes_range(
        &self,
        from: u64,
        to: u64,
    ) -> impl std::future::Future<Output = Result<Vec<Change<D>>, DocError>> + Send;

    /// Append `change` iff the head is still `base_rev`. `Ok(false)`
    /// means the head moved; the caller rebases and retries.
    fn try_append(
        &self,
        base_rev: u64,
        change: &Change<D>,
    ) -> impl std::future::Future<Output = Result<bool, DocError>> + Send;

    /// Best snapshot anchor at or below `max_rev`.
    fn base_snapshot(
        &self,
        max_rev: u64,
    ) -> impl std::future::Future<Output = Result<Snapshot<D>, DocError>> + Send;

    /// Called after every successful append; durable logs use it to
    /// refresh the stored snapshot cache. Failures must not propagate.
    fn after_append(
        &self,
        head: u64,
        snapshot: &Snapshot<D>,
    ) -> impl std::future::Future<Output = ()> + Send;
}

/// The per-payload control: one exclusive writer, many readers.
pub struct DocControl<D: OtDelta, L: RevisionLog<D>> {
    log: L,
    changed: Notify,
    /// Latest fully composed snapshot, reused as the compose anchor.
    cache: Mutex<Option<Snapshot<D>>>,
}

impl<D: OtDelta, L: RevisionLog<D>> DocControl<D, L> {
    pub fn new(log: L) -> Self {
        Self { log, changed: Notify::new(), cache: Mutex::new(None) }
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub async fn current_rev_num(&self) -> Result<u64, DocError> {
        self.log.current_rev().await
    }

    /// Direct log read; succeeds forever once the revision exists
    /// (durable payloads) or until it falls below the retention floor.
    pub async fn change(&self, rev: u64) -> Result<Change<D>, DocError> {
        self.log.change(rev).await
    }

    /// The snapshot at `rev` (current if omitted), derived by composing
    /// forward from the nearest anchor.
    pub async fn snapshot(&self, rev: Option<u64>) -> Result<Snapshot<D>, DocError> {
        let current = self.log.current_rev().await?;
        let rev = rev.unwrap_or(current);
        if rev > current {
            return Err(DocError::RevisionTooHigh { requested: rev, current });
        }

        let cached = self.cache.lock().await.clone();
        let mut snapshot = match cached {
            Some(c) if c.rev_num <= rev => c,
            _ => self.log.base_snapshot(rev).await?,
        };
        if snapshot.rev_num < rev {
            let changes = self.log.changes_range(snapshot.rev_num + 1, rev).await?;
            for change in &changes {
                snapshot = snapshot.compose_change(change)?;
            }
        }
        if snapshot.rev_num != rev {
            return Err(DocError::Wtf(format!(
                "snapshot composition stopped at {} short of {rev}",
                snapshot.rev_num
            )));
        }
        if rev == current {
            *self.cache.lock().await = Some(snapshot.clone());
        }
        Ok(snapshot)
    }

    /// A change strictly after `base_rev`, long-polling up to `max_wait`
    /// when `base_rev` is the head. Multiple pending revisions come back
    /// composed into one change at the head revision.
    pub async fn change_after(
        &self,
        base_rev: u64,
        max_wait: Duration,
    ) -> Result<Change<D>, DocError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let mut notified = pin!(self.changed.notified());
            // Register before reading the head so an append between the
            // read and the await still wakes us.
            notified.as_mut().enable();

            let current = self.log.current_rev().await?;
            if base_rev > current {
                return Err(DocError::RevisionTooHigh { requested: base_rev, current });
            }
            if current > base_rev {
                let delta = self.compose_span(base_rev + 1, current).await?;
                return Ok(Change::correction(current, delta));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(DocError::TimedOut);
            }
        }
    }

    /// The OT heart. `change.rev_num` is the revision the client expects
    /// to create (`base + 1`); the returned correction change, composed
    /// onto the client's post-update expectation, yields the server
    /// state.
    pub async fn update(&self, change: Change<D>) -> Result<Change<D>, DocError> {
        change
            .validate()
            .map_err(|e| DocError::BadValue(e.to_string()))?;
        if change.rev_num == 0 {
            return Err(DocError::BadValue("cannot update revision 0".into()));
        }
        let base_rev = change.rev_num - 1;
        let d_client = change.delta.clone();

        // Warm the compose anchor so the append path can maintain it.
        if self.cache.lock().await.is_none() {
            self.snapshot(None).await?;
        }

        for _ in 0..UPDATE_RETRY_LIMIT {
            let current = self.log.current_rev().await?;
            if base_rev > current {
                return Err(DocError::RevisionTooHigh {
                    requested: change.rev_num,
                    current,
                });
            }

            if current == base_rev {
                let appended = Change::new(
                    current + 1,
                    d_client.clone(),
                    change.timestamp,
                    change.author_id.clone(),
                );
                if self.commit(current, appended).await? {
                    return Ok(Change::correction(current + 1, D::empty()));
                }
                continue;
            }

            // The head moved past the client's base: rebase. The server's
            // committed changes win ties — a hard convergence contract.
            let d_server = self.compose_span(base_rev + 1, current).await?;
            let d_client_rebased = d_server.transform(&d_client, true)?;

            if d_client_rebased.is_empty() {
                // Nothing left to append; hand back a pure correction at
                // the current head.
                let d_correction = d_client.transform(&d_server, false)?;
                return Ok(Change::correction(current, d_correction));
            }

            let appended = Change::new(
                current + 1,
                d_client_rebased,
                change.timestamp,
                change.author_id.clone(),
            );
            if self.commit(current, appended).await? {
                let d_correction = d_client.transform(&d_server, false)?;
                return Ok(Change::correction(current + 1, d_correction));
            }
        }
        Err(DocError::TooMuchContention)
    }

    /// Try one compare-and-swap append; on success refresh the cache and
    /// wake long-pollers.
    async fn commit(&self, base_rev: u64, change: Change<D>) -> Result<bool, DocError> {
        if !self.log.try_append(base_rev, &change).await? {
            return Ok(false);
        }
        let head = change.rev_num;
        {
            let mut cache = self.cache.lock().await;
            match cache.take() {
                Some(prev) if prev.rev_num == base_rev => {
                    let next = prev.compose_change(&change)?;
                    self.log.after_append(head, &next).await;
                    *cache = Some(next);
                }
                other => *cache = other,
            }
        }
        self.changed.notify_waiters();
        Ok(true)
    }

    /// Changes `from..=to` composed into one delta.
    async fn compose_span(&self, from: u64, to: u64) -> Result<D, DocError> {
        let changes = self.log.changes_range(from, to).await?;
        if changes.len() as u64 != to - from + 1 {
            return Err(DocError::Wtf(format!(
                "log hole between revisions {from} and {to}"
            )));
        }
        let mut composed = D::empty();
        for change in &changes {
            composed = composed.compose(&change.delta, false)?;
        }
        Ok(composed)
    }
}

/// Bounded in-memory log for ephemeral payloads: the last `retention`
/// changes plus the snapshot at the retention floor.
pub struct EphemeralLog<D: OtDelta> {
    inner: Mutex<EphemeralState<D>>,
}

struct EphemeralState<D: OtDelta> {
    /// Snapshot at the retention floor.
    base: Snapshot<D>,
    /// Changes `base.rev_num + 1 ..= head`.
    changes: VecDeque<Change<D>>,
    retention: usize,
}

impl<D: OtDelta> EphemeralLog<D> {
    pub fn new(retention: usize) -> Self {
        Self {
            inner: Mutex::new(EphemeralState {
                base: Snapshot::genesis(),
                changes: VecDeque::new(),
                retention: retention.max(1),
            }),
        }
    }

    pub async fn retention_floor(&self) -> u64 {
        self.inner.lock().await.base.rev_num
    }
}

impl<D: OtDelta> RevisionLog<D> for EphemeralLog<D> {
    async fn current_rev(&self) -> Result<u64, DocError> {
        let state = self.inner.lock().await;
        Ok(state.base.rev_num + state.changes.len() as u64)
    }

    async fn change(&self, rev: u64) -> Result<Change<D>, DocError> {
        let state = self.inner.lock().await;
        let head = state.base.rev_num + state.changes.len() as u64;
        if rev > head {
            return Err(DocError::RevisionTooHigh { requested: rev, current: head });
        }
        if rev <= state.base.rev_num {
            return Err(DocError::RevisionNotAvailable(rev));
        }
        Ok(state.changes[(rev - state.base.rev_num - 1) as usize].clone())
    }

    async fn changes_range(&self, from: u64, to: u64) -> Result<Vec<Change<D>>, DocError> {
        let state = self.inner.lock().await;
        let head = state.base.rev_num + state.changes.len() as u64;
        if to > head {
            return Err(DocError::RevisionTooHigh { requested: to, current: head });
        }
        if from <= state.base.rev_num {
            return Err(DocError::RevisionNotAvailable(from));
        }
        let offset = state.base.rev_num + 1;
        Ok((from..=to)
            .map(|rev| state.changes[(rev - offset) as usize].clone())
            .collect())
    }

    async fn try_append(&self, base_rev: u64, change: &Change<D>) -> Result<bool, DocError> {
        let mut state = self.inner.lock().await;
        let head = state.base.rev_num + state.changes.len() as u64;
        if head != base_rev {
            return Ok(false);
        }
        state.changes.push_back(change.clone());
        // Garbage-collect past the retention horizon.
        while state.changes.len() > state.retention {
            let evicted = state.changes.pop_front().expect("non-empty after len check");
            state.base = state.base.compose_change(&evicted)?;
        }
        Ok(true)
    }

    async fn base_snapshot(&self, max_rev: u64) -> Result<Snapshot<D>, DocError> {
        let state = self.inner.lock().await;
        if max_rev < state.base.rev_num {
            return Err(DocError::RevisionNotAvailable(max_rev));
        }
        Ok(state.base.clone())
    }

    async fn after_append(&self, _head: u64, _snapshot: &Snapshot<D>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{Attrs, BodyDelta};

    type TestControl = DocControl<BodyDelta, EphemeralLog<BodyDelta>>;

    fn control(retention: usize) -> TestControl {
        DocControl::new(EphemeralLog::new(retention))
    }

    fn insert_at(offset: u64, text: &str) -> BodyDelta {
        let mut d = BodyDelta::new();
        d.push_retain(offset, Attrs::new());
        d.push_insert(text, Attrs::new());
        d
    }

    async fn apply(c: &TestControl, base: u64, delta: BodyDelta) -> Change<BodyDelta> {
        c.update(Change::new(base + 1, delta, None, None)).await.unwrap()
    }

    #[tokio::test]
    async fn test_clean_append_returns_empty_correction() {
        let c = control(100);
        let correction = apply(&c, 0, insert_at(0, "hello")).await;
        assert_eq!(correction.rev_num, 1);
        assert!(correction.delta.is_empty());
        assert_eq!(c.snapshot(None).await.unwrap().contents.to_text(), "hello");
    }

    #[tokio::test]
    async fn test_concurrent_update_rebases() {
        let c = control(100);
        apply(&c, 0, insert_at(0, "hello")).await;
        // First writer commits " world" at base 1.
        apply(&c, 1, insert_at(5, " world")).await;
        // Second writer also built on base 1; gets a correction.
        let correction = apply(&c, 1, insert_at(5, "!")).await;
        assert_eq!(correction.rev_num, 3);
        assert!(!correction.delta.is_empty());
        assert_eq!(
            c.snapshot(None).await.unwrap().contents.to_text(),
            "hello world!"
        );
    }

    #[tokio::test]
    async fn test_update_base_too_high() {
        let c = control(100);
        let err = c
            .update(Change::new(5, insert_at(0, "x"), None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, DocError::RevisionTooHigh { .. }));
    }

    #[tokio::test]
    async fn test_update_rejects_empty_delta() {
        let c = control(100);
        let err = c
            .update(Change::new(1, BodyDelta::new(), None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, DocError::BadValue(_)));
    }

    #[tokio::test]
    async fn test_snapshot_composition_invariant() {
        let c = control(100);
        apply(&c, 0, insert_at(0, "ab")).await;
        apply(&c, 1, insert_at(2, "cd")).await;
        apply(&c, 2, insert_at(4, "ef")).await;

        for rev in 1..=3u64 {
            let prev = c.snapshot(Some(rev - 1)).await.unwrap();
            let change = c.change(rev).await.unwrap();
            let composed = prev.compose_change(&change).unwrap();
            assert_eq!(composed, c.snapshot(Some(rev)).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_snapshot_too_high() {
        let c = control(100);
        let err = c.snapshot(Some(7)).await.unwrap_err();
        assert!(matches!(err, DocError::RevisionTooHigh { .. }));
    }

    #[tokio::test]
    async fn test_change_after_returns_pending_immediately() {
        let c = control(100);
        apply(&c, 0, insert_at(0, "a")).await;
        apply(&c, 1, insert_at(1, "b")).await;
        let change = c.change_after(0, Duration::from_secs(1)).await.unwrap();
        assert_eq!(change.rev_num, 2);
        // Both pending revisions composed into one delta.
        assert_eq!(change.delta.to_text(), "ab");
    }

    #[tokio::test]
    async fn test_change_after_times_out() {
        let c = control(100);
        let err = c.change_after(0, Duration::from_millis(30)).await.unwrap_err();
        assert_eq!(err, DocError::TimedOut);
    }

    #[tokio::test]
    async fn test_change_after_wakes_on_append() {
        let c = Arc::new(control(100));
        let poller = {
            let c = c.clone();
            tokio::spawn(async move { c.change_after(0, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        apply(&c, 0, insert_at(0, "hey")).await;
        let change = poller.await.unwrap().unwrap();
        assert_eq!(change.rev_num, 1);
        assert_eq!(change.delta.to_text(), "hey");
    }

    #[tokio::test]
    async fn test_change_after_rejects_future_base() {
        let c = control(100);
        let err = c.change_after(9, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, DocError::RevisionTooHigh { .. }));
    }

    #[tokio::test]
    async fn test_retention_floor_garbage_collects() {
        let c = control(10);
        apply(&c, 0, insert_at(0, "x")).await;
        for n in 1..30u64 {
            apply(&c, n, insert_at(0, "x")).await;
        }
        assert_eq!(c.current_rev_num().await.unwrap(), 30);
        assert_eq!(c.log().retention_floor().await, 20);

        let err = c.change(5).await.unwrap_err();
        assert!(matches!(err, DocError::RevisionNotAvailable(_)));
        let err = c.change_after(5, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, DocError::RevisionNotAvailable(_)));

        // Snapshot at the head still works from the floor snapshot.
        let snap = c.snapshot(None).await.unwrap();
        assert_eq!(snap.contents.to_text().len(), 30);
    }

    #[tokio::test]
    async fn test_at_most_one_writer_per_revision() {
        let c = Arc::new(control(100));
        apply(&c, 0, insert_at(0, "base")).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let c = c.clone();
            handles.push(tokio::spawn(async move {
                c.update(Change::new(2, insert_at(0, &format!("w{i} ")), None, None))
                    .await
            }));
        }
        let mut empties = 0;
        for h in handles {
            let correction = h.await.unwrap().unwrap();
            if correction.delta.is_empty() {
                empties += 1;
                assert_eq!(correction.rev_num, 2);
            } else {
                assert!(correction.rev_num > 2);
            }
        }
        // Exactly one writer won revision 2 outright.
        assert_eq!(empties, 1);
        assert_eq!(c.current_rev_num().await.unwrap(), 9);
    }
}
