//! Durable revision logs: body and property payloads over the
//! transactional file, with bootstrap and crash recovery on open.

use std::sync::Arc;

use serde_json::Value;

use crate::api::codec::{decode, encode, Codable};
use crate::delta::{BodyDelta, Change, OtDelta, PropertyDelta, Snapshot};
use crate::storage::{
    FileError, FileOp, FrozenBuffer, StoragePath, TransactionSpec, TransactionalFile,
};

use super::control::{DocControl, RevisionLog};
use super::DocError;

/// Stored schema version; bumped on layout changes.
pub const SCHEMA_VERSION: &str = "1";

/// Every this many revisions, the composed snapshot is also stored, to
/// bound recovery and cold-read time.
const STORED_SNAPSHOT_INTERVAL: u64 = 100;

/// Result of validating a file on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCondition {
    /// Ready to use.
    Ok,
    /// Schema-compatible, but a storage upgrade was needed (and done).
    Migrate,
    /// Unrecoverable.
    Error,
}

/// Storage layout for one durable payload.
#[derive(Debug, Clone)]
pub struct PayloadPaths {
    rev_num: StoragePath,
    revision_root: StoragePath,
    snapshot_root: StoragePath,
    schema: StoragePath,
}

fn static_path(s: &str) -> StoragePath {
    StoragePath::parse(s).expect("static layout path is valid")
}

impl PayloadPaths {
    /// Body lives at the file root.
    pub fn body() -> Self {
        Self {
            rev_num: static_path("/revision_number"),
            revision_root: static_path("/revision"),
            snapshot_root: static_path("/snapshot"),
            schema: static_path("/schema_version"),
        }
    }

    /// Property mirrors the body layout under `/property`.
    pub fn property() -> Self {
        Self {
            rev_num: static_path("/property/revision_number"),
            revision_root: static_path("/property/revision"),
            snapshot_root: static_path("/property/snapshot"),
            schema: static_path("/schema_version"),
        }
    }

    fn change_path(&self, rev: u64) -> StoragePath {
        self.revision_root
            .join_index(rev)
            .join("change")
            .expect("static component")
    }
}

/// File-backed revision log. Appends are a compare-and-swap on the
/// ASCII-decimal head at `revision_number`.
pub struct DurableLog<D> {
    file: Arc<TransactionalFile>,
    paths: PayloadPaths,
    _payload: std::marker::PhantomData<fn() -> D>,
}

impl<D> DurableLog<D>
where
    D: OtDelta,
    Change<D>: Codable,
    Snapshot<D>: Codable,
{
    /// Open the log: bootstrap an empty file, or validate and recover an
    /// existing one. `FileCondition::Error` leaves the log unusable.
    pub async fn open(
        file: Arc<TransactionalFile>,
        paths: PayloadPaths,
    ) -> Result<(Self, FileCondition), DocError> {
        let log = Self { file, paths, _payload: std::marker::PhantomData };
        let condition = log.validate_and_recover().await?;
        Ok((log, condition))
    }

    async fn validate_and_recover(&self) -> Result<FileCondition, DocError> {
        let read = self
            .file
            .transact(spec(vec![
                FileOp::ReadPath(self.paths.rev_num.clone()),
                FileOp::ReadPath(self.paths.schema.clone()),
            ])?)
            .await?;

        if !read.data.contains_key(&self.paths.rev_num) {
            match self.bootstrap().await {
                Ok(()) => return Ok(FileCondition::Ok),
                // Lost the bootstrap race to a peer; fall through and
                // validate what it wrote.
                Err(DocError::File(FileError::PrerequisiteFailed(_))) => {}
                Err(e) => return Err(e),
            }
        }

        let schema_condition = match read
            .data
            .get(&self.paths.schema)
            .map(|b| b.to_utf8().map(str::to_string))
            .transpose()?
        {
            Some(v) if v == SCHEMA_VERSION => FileCondition::Ok,
            Some(other) => {
                log::error!(
                    "{}: unsupported schema version {other:?}",
                    self.file.id()
                );
                return Ok(FileCondition::Error);
            }
            None => {
                // Pre-versioning file: upgrade by stamping it.
                self.file
                    .transact(spec(vec![FileOp::WritePath(
                        self.paths.schema.clone(),
                        FrozenBuffer::from_utf8(SCHEMA_VERSION),
                    )])?)
                    .await?;
                FileCondition::Migrate
            }
        };

        self.recover().await?;
        Ok(schema_condition)
    }

    /// First open of a file: write the empty-document change at
    /// revision 0, guarded against concurrent bootstrappers.
    async fn bootstrap(&self) -> Result<(), DocError> {
        let first: Change<D> = Change::first();
        self.file
            .transact(spec(vec![
                FileOp::CheckPathAbsent(self.paths.rev_num.clone()),
                FileOp::WritePath(self.paths.change_path(0), encode_buffer(&first)),
                FileOp::WritePath(self.paths.rev_num.clone(), FrozenBuffer::from_utf8("0")),
                FileOp::WritePath(
                    self.paths.schema.clone(),
                    FrozenBuffer::from_utf8(SCHEMA_VERSION),
                ),
            ])?)
            .await?;
        log::info!("{}: bootstrapped revision log", self.file.id());
        Ok(())
    }

    /// Recovery after unclean shutdown: the head becomes the highest
    /// contiguous revision; gap-creating changes above it are discarded
    /// (they were never acknowledged — acks follow the compare-and-swap).
    async fn recover(&self) -> Result<(), DocError> {
        let result = self
            .file
            .transact(spec(vec![
                FileOp::ListPathPrefix(self.paths.revision_root.clone()),
                FileOp::ReadPath(self.paths.rev_num.clone()),
            ])?)
            .await?;

        let mut indices: Vec<u64> =
            result.paths.iter().filter_map(StoragePath::index_suffix).collect();
        indices.sort_unstable();
        if indices.first() != Some(&0) {
            return Err(DocError::Wtf("revision log lost its genesis change".into()));
        }
        let mut contiguous = 0;
        for &n in &indices[1..] {
            if n == contiguous + 1 {
                contiguous = n;
            } else {
                break;
            }
        }

        let stored: Option<u64> = result
            .data
            .get(&self.paths.rev_num)
            .map(|b| {
                b.to_utf8()?
                    .parse()
                    .map_err(|_| FileError::BadData("unparseable revision number".into()))
            })
            .transpose()?;

        let max_index = *indices.last().expect("non-empty after genesis check");
        if stored == Some(contiguous) && max_index == contiguous {
            return Ok(());
        }

        log::warn!(
            "{}: recovering revision log to {contiguous} (stored {stored:?}, max {max_index})",
            self.file.id()
        );
        self.file
            .transact(spec(vec![
                FileOp::DeletePathRange(
                    self.paths.revision_root.clone(),
                    contiguous + 1,
                    u64::MAX,
                ),
                FileOp::WritePath(
                    self.paths.rev_num.clone(),
                    FrozenBuffer::from_utf8(&contiguous.to_string()),
                ),
            ])?)
            .await?;
        Ok(())
    }

    fn decode_change(&self, buf: &FrozenBuffer) -> Result<Change<D>, DocError> {
        let value: Value = serde_json::from_str(buf.to_utf8()?)
            .map_err(|e| DocError::BadData(format!("stored change: {e}")))?;
        decode::<Change<D>>(&value).map_err(|e| DocError::BadData(e.to_string()))
    }
}

fn spec(ops: Vec<FileOp>) -> Result<TransactionSpec, FileError> {
    TransactionSpec::new(ops)
}

pub(crate) fn encode_buffer<T: Codable>(value: &T) -> FrozenBuffer {
    FrozenBuffer::from_utf8(&encode(value).to_string())
}

impl<D> RevisionLog<D> for DurableLog<D>
where
    D: OtDelta,
    Change<D>: Codable,
    Snapshot<D>: Codable,
{
    async fn current_rev(&self) -> Result<u64, DocError> {
        let result = self
            .file
            .transact(spec(vec![FileOp::ReadPath(self.paths.rev_num.clone())])?)
            .await?;
        let buf = result
            .data
            .get(&self.paths.rev_num)
            .ok_or_else(|| DocError::Wtf("revision log not initialized".into()))?;
        buf.to_utf8()?
            .parse()
            .map_err(|_| DocError::BadData("unparseable revision number".into()))
    }

    async fn change(&self, rev: u64) -> Result<Change<D>, DocError> {
        let path = self.paths.change_path(rev);
        let result = self
            .file
            .transact(spec(vec![
                FileOp::ReadPath(path.clone()),
                FileOp::ReadPath(self.paths.rev_num.clone()),
            ])?)
            .await?;
        match result.data.get(&path) {
            Some(buf) => self.decode_change(buf),
            None => {
                let current = result
                    .data
                    .get(&self.paths.rev_num)
                    .and_then(|b| b.to_utf8().ok()?.parse().ok())
                    .unwrap_or(0);
                if rev > current {
                    Err(DocError::RevisionTooHigh { requested: rev, current })
                } else {
                    Err(DocError::Wtf(format!("durable log hole at revision {rev}")))
                }
            }
        }
    }

    async fn changes_range(&self, from: u64, to: u64) -> Result<Vec<Change<D>>, DocError> {
        let ops = (from..=to)
            .map(|rev| FileOp::ReadPath(self.paths.change_path(rev)))
            .collect();
        let result = self.file.transact(spec(ops)?).await?;
        (from..=to)
            .map(|rev| {
                let buf = result
                    .data
                    .get(&self.paths.change_path(rev))
                    .ok_or_else(|| {
                        DocError::Wtf(format!("durable log hole at revision {rev}"))
                    })?;
                self.decode_change(buf)
            })
            .collect()
    }

    async fn try_append(&self, base_rev: u64, change: &Change<D>) -> Result<bool, DocError> {
        let expected = FrozenBuffer::from_utf8(&base_rev.to_string());
        let outcome = self
            .file
            .transact(spec(vec![
                FileOp::CheckPathIs(self.paths.rev_num.clone(), expected.hash().clone()),
                FileOp::WritePath(
                    self.paths.change_path(change.rev_num),
                    encode_buffer(change),
                ),
                FileOp::WritePath(
                    self.paths.rev_num.clone(),
                    FrozenBuffer::from_utf8(&change.rev_num.to_string()),
                ),
            ])?)
            .await;
        match outcome {
            Ok(_) => Ok(true),
            Err(FileError::PrerequisiteFailed(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn base_snapshot(&self, max_rev: u64) -> Result<Snapshot<D>, DocError> {
        let listing = self
            .file
            .transact(spec(vec![FileOp::ListPathPrefix(self.paths.snapshot_root.clone())])?)
            .await?;
        let anchor = listing
            .paths
            .iter()
            .filter_map(StoragePath::index_suffix)
            .filter(|n| *n <= max_rev)
            .max();

        if let Some(n) = anchor {
            let path = self.paths.snapshot_root.join_index(n);
            let result = self
                .file
                .transact(spec(vec![FileOp::ReadPath(path.clone())])?)
                .await?;
            if let Some(buf) = result.data.get(&path) {
                let parsed: Result<Snapshot<D>, DocError> = (|| {
                    let value: Value = serde_json::from_str(buf.to_utf8()?)
                        .map_err(|e| DocError::BadData(format!("stored snapshot: {e}")))?;
                    decode::<Snapshot<D>>(&value).map_err(|e| DocError::BadData(e.to_string()))
                })();
                match parsed {
                    Ok(snapshot) => return Ok(snapshot),
                    Err(e) => {
                        // A bad cache entry costs a longer replay, not
                        // correctness.
                        log::warn!("{}: ignoring stored snapshot {n}: {e}", self.file.id());
                    }
                }
            }
        }

        let first = self.change(0).await?;
        Ok(Snapshot::genesis().compose_change(&first)?)
    }

    async fn after_append(&self, head: u64, snapshot: &Snapshot<D>) {
        if head == 0 || head % STORED_SNAPSHOT_INTERVAL != 0 {
            return;
        }
        let write = spec(vec![FileOp::WritePath(
            self.paths.snapshot_root.join_index(head),
            encode_buffer(snapshot),
        )]);
        let outcome = match write {
            Ok(s) => self.file.transact(s).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            log::warn!("{}: stored snapshot write failed: {e}", self.file.id());
        } else {
            log::debug!("{}: stored snapshot at revision {head}", self.file.id());
        }
    }
}

/// Durable body-payload control. Body paths live at the file root.
pub type BodyControl = DocControl<BodyDelta, DurableLog<BodyDelta>>;

/// Durable property-payload control, under `/property`.
pub type PropertyControl = DocControl<PropertyDelta, DurableLog<PropertyDelta>>;

impl DocControl<BodyDelta, DurableLog<BodyDelta>> {
    pub async fn open_body(
        file: Arc<TransactionalFile>,
    ) -> Result<(Self, FileCondition), DocError> {
        let (log, condition) = DurableLog::open(file, PayloadPaths::body()).await?;
        Ok((DocControl::new(log), condition))
    }
}

impl DocControl<PropertyDelta, DurableLog<PropertyDelta>> {
    pub async fn open_property(
        file: Arc<TransactionalFile>,
    ) -> Result<(Self, FileCondition), DocError> {
        let (log, condition) = DurableLog::open(file, PayloadPaths::property()).await?;
        Ok((DocControl::new(log), condition))
    }
}
