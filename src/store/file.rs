//! JSON-lines file stores used by the `cursorflow` binary.
//!
//! Sources read one JSON document per line and resume from a byte offset. The sink,
//! the quarantine log and the state files all `sync_data` before reporting success so a
//! crash right after a write keeps what was acknowledged.

use super::quarantine::{QuarantineRecord, QuarantineStore};
use super::sink::{SinkError, SinkStore};
use super::source::{Page, SourceError, SourceStore};
use super::state::{Checkpoint, StateStore};
use crate::runtime::progress::RunState;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

/// Position inside a JSON-lines file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePosition {
    /// Byte offset of the next unread line.
    pub offset: u64,
    /// Records consumed so far.
    pub record: u64,
}

#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    path: PathBuf,
}

pub struct JsonLinesCursor {
    reader: BufReader<File>,
    position: FilePosition,
}

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SourceStore for JsonLinesSource {
    type Record = serde_json::Value;
    type Position = FilePosition;
    type Handle = JsonLinesCursor;

    fn open_cursor<'a>(
        &'a self,
        _query: &'a str,
        resume_from: Option<FilePosition>,
    ) -> BoxFuture<'a, Result<JsonLinesCursor, SourceError>> {
        Box::pin(async move {
            let mut file = File::open(&self.path).await.map_err(|err| {
                SourceError::Unavailable(format!("failed to open {}: {err}", self.path.display()))
            })?;
            let position = resume_from.unwrap_or_default();
            if position.offset > 0 {
                file.seek(SeekFrom::Start(position.offset))
                    .await
                    .map_err(|err| {
                        SourceError::Unavailable(format!(
                            "failed to seek {} to offset {}: {err}",
                            self.path.display(),
                            position.offset
                        ))
                    })?;
            }
            Ok(JsonLinesCursor {
                reader: BufReader::new(file),
                position,
            })
        })
    }

    fn fetch_batch<'a>(
        &'a self,
        handle: &'a mut JsonLinesCursor,
        desired: usize,
    ) -> BoxFuture<'a, Result<Page<serde_json::Value, FilePosition>, SourceError>> {
        Box::pin(async move {
            let start = handle.position;
            let mut position = start;
            let mut records = Vec::with_capacity(desired.min(4_096));
            let mut exhausted = false;
            let mut line = String::new();

            while records.len() < desired {
                line.clear();
                let read = match handle.reader.read_line(&mut line).await {
                    Ok(read) => read,
                    Err(err) => {
                        // Rewind so a retried fetch re-reads the partial page.
                        let _ = handle.reader.seek(SeekFrom::Start(start.offset)).await;
                        return Err(SourceError::Unavailable(format!(
                            "failed to read {}: {err}",
                            self.path.display()
                        )));
                    }
                };
                if read == 0 {
                    exhausted = true;
                    break;
                }

                let line_offset = position.offset;
                position.offset += read as u64;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let value = serde_json::from_str(trimmed).map_err(|err| {
                    SourceError::Corrupt(format!(
                        "invalid JSON at byte offset {line_offset} of {}: {err}",
                        self.path.display()
                    ))
                })?;
                records.push(value);
                position.record += 1;
            }

            handle.position = position;
            Ok(Page {
                records,
                position,
                exhausted,
            })
        })
    }

    fn position(&self, handle: &JsonLinesCursor) -> FilePosition {
        handle.position
    }

    fn close_cursor(&self, handle: JsonLinesCursor) -> BoxFuture<'_, Result<(), SourceError>> {
        drop(handle);
        Box::pin(async { Ok(()) })
    }
}

/// Appends each batch to a JSON-lines file with a single write followed by `sync_data`.
///
/// A failed append is truncated back to where the batch started. Appends run on their own
/// task so a caller that times out cannot cut one short; an append that lands after its
/// caller went away is kept aside, and the retry of the same batch is acknowledged without
/// writing it twice.
pub struct JsonLinesSink {
    path: PathBuf,
    state: Arc<Mutex<SinkFile>>,
}

struct SinkFile {
    file: File,
    /// Landed appends whose caller never saw the result.
    abandoned: Vec<Vec<u8>>,
}

type AppendReply = (Result<(), SinkError>, oneshot::Sender<()>);

impl JsonLinesSink {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        ensure_parent_dir(&path).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open sink file {}", path.display()))?;
        Ok(Self::from_file(path, file))
    }

    fn from_file(path: PathBuf, file: File) -> Self {
        Self {
            path,
            state: Arc::new(Mutex::new(SinkFile {
                file,
                abandoned: Vec::new(),
            })),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SinkStore for JsonLinesSink {
    type Record = serde_json::Value;

    fn bulk_write<'a>(
        &'a self,
        records: &'a [serde_json::Value],
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let mut buffer = Vec::new();
            for record in records {
                serde_json::to_writer(&mut buffer, record)
                    .map_err(|err| SinkError::permanent(format!("unserializable record: {err}")))?;
                buffer.push(b'\n');
            }

            let (reply_tx, reply_rx) = oneshot::channel();
            tokio::spawn(append_batch(Arc::clone(&self.state), buffer, reply_tx));
            let (result, ack) = reply_rx
                .await
                .map_err(|_| SinkError::permanent("append task ended without a result"))?;
            // No await between receiving and acknowledging: once the result is taken the
            // append task learns it was delivered.
            let _ = ack.send(());
            result
        })
    }
}

async fn append_batch(
    state: Arc<Mutex<SinkFile>>,
    buffer: Vec<u8>,
    reply: oneshot::Sender<AppendReply>,
) {
    let mut sink = state.lock().await;
    let result = match sink.abandoned.iter().position(|landed| *landed == buffer) {
        Some(index) => {
            sink.abandoned.swap_remove(index);
            tracing::debug!(bytes = buffer.len(), "batch already appended by an abandoned attempt");
            Ok(())
        }
        None => append_or_rollback(&mut sink.file, &buffer).await,
    };

    let landed = result.is_ok();
    let (ack_tx, ack_rx) = oneshot::channel();
    let delivered = reply.send((result, ack_tx)).is_ok() && ack_rx.await.is_ok();
    if landed && !delivered {
        tracing::warn!(
            bytes = buffer.len(),
            "sink append finished after its caller gave up; keeping it for the retry"
        );
        sink.abandoned.push(buffer);
    }
}

/// Appends `buffer` and syncs it. On failure the file is cut back to its previous length;
/// a partial batch that cannot be removed is reported as permanent.
async fn append_or_rollback(file: &mut File, buffer: &[u8]) -> Result<(), SinkError> {
    let start = file
        .metadata()
        .await
        .map_err(|err| SinkError::transient(format!("failed to stat sink file: {err}")))?
        .len();

    let written: std::io::Result<()> = async {
        file.write_all(buffer).await?;
        file.flush().await?;
        file.sync_data().await
    }
    .await;
    let Err(err) = written else {
        return Ok(());
    };

    let current = file.metadata().await.map(|meta| meta.len()).ok();
    if current == Some(start) {
        return Err(SinkError::transient(format!("write failed: {err}")));
    }
    match file.set_len(start).await {
        Ok(()) => Err(SinkError::transient(format!(
            "write failed and the partial batch was rolled back: {err}"
        ))),
        Err(truncate) => Err(SinkError::permanent(format!(
            "write failed ({err}) and the partial batch could not be removed: {truncate}"
        ))),
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
enum QuarantineEntry {
    Quarantined(QuarantineRecord),
    Replayed {
        run_id: Uuid,
        batch_id: u64,
        replayed_at: DateTime<Utc>,
    },
}

/// Append-only quarantine log. Replays are recorded as separate entries.
pub struct FileQuarantineStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileQuarantineStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, entry: &QuarantineEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry).context("failed to encode quarantine entry")?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        ensure_parent_dir(&self.path).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open quarantine log {}", self.path.display()))?;
        file.write_all(&line)
            .await
            .context("failed to append quarantine entry")?;
        file.sync_data()
            .await
            .context("failed to sync quarantine log")?;
        Ok(())
    }

    async fn load_pending(&self) -> Result<Vec<QuarantineRecord>> {
        let _guard = self.lock.lock().await;
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read quarantine log {}", self.path.display())
                })
            }
        };

        let mut records = Vec::new();
        let mut replayed = HashSet::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: QuarantineEntry = serde_json::from_str(line).with_context(|| {
                format!(
                    "malformed entry on line {} of {}",
                    index + 1,
                    self.path.display()
                )
            })?;
            match entry {
                QuarantineEntry::Quarantined(record) => records.push(record),
                QuarantineEntry::Replayed {
                    run_id, batch_id, ..
                } => {
                    replayed.insert((run_id, batch_id));
                }
            }
        }

        records.retain(|record| !replayed.contains(&(record.run_id, record.batch_id)));
        Ok(records)
    }
}

impl QuarantineStore for FileQuarantineStore {
    fn record(&self, record: QuarantineRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.append(&QuarantineEntry::Quarantined(record)).await })
    }

    fn list_pending(&self) -> BoxFuture<'_, Result<Vec<QuarantineRecord>>> {
        Box::pin(self.load_pending())
    }

    fn get(&self, run_id: Uuid, batch_id: u64) -> BoxFuture<'_, Result<Option<QuarantineRecord>>> {
        Box::pin(async move {
            Ok(self
                .load_pending()
                .await?
                .into_iter()
                .find(|record| record.run_id == run_id && record.batch_id == batch_id))
        })
    }

    fn mark_replayed(&self, run_id: Uuid, batch_id: u64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.append(&QuarantineEntry::Replayed {
                run_id,
                batch_id,
                replayed_at: Utc::now(),
            })
            .await
        })
    }
}

/// Directory-backed state: `checkpoints/<pipeline>.json`, `runs/<run_id>.json`, and
/// `runs/<run_id>.cancel` markers used to cancel a run from another process.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn checkpoint_path(&self, pipeline: &str) -> PathBuf {
        self.root.join("checkpoints").join(format!("{pipeline}.json"))
    }

    fn run_path(&self, run_id: Uuid) -> PathBuf {
        self.root.join("runs").join(format!("{run_id}.json"))
    }

    fn cancel_marker_path(&self, run_id: Uuid) -> PathBuf {
        self.root.join("runs").join(format!("{run_id}.cancel"))
    }

    /// Asks the process running `run_id` to cancel it.
    pub async fn request_cancel(&self, run_id: Uuid) -> Result<()> {
        let path = self.cancel_marker_path(run_id);
        write_atomic(&path, Utc::now().to_rfc3339().as_bytes()).await
    }

    pub async fn cancel_requested(&self, run_id: Uuid) -> Result<bool> {
        let path = self.cancel_marker_path(run_id);
        fs::try_exists(&path)
            .await
            .with_context(|| format!("failed to probe {}", path.display()))
    }
}

impl StateStore for FileStateStore {
    fn load_checkpoint<'a>(&'a self, pipeline: &'a str) -> BoxFuture<'a, Result<Option<Checkpoint>>> {
        Box::pin(async move { read_json(&self.checkpoint_path(pipeline)).await })
    }

    fn save_checkpoint<'a>(&'a self, checkpoint: &'a Checkpoint) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let bytes = serde_json::to_vec_pretty(checkpoint).context("failed to encode checkpoint")?;
            write_atomic(&self.checkpoint_path(&checkpoint.pipeline), &bytes).await
        })
    }

    fn save_run_state<'a>(&'a self, state: &'a RunState) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let bytes = serde_json::to_vec_pretty(state).context("failed to encode run state")?;
            write_atomic(&self.run_path(state.run_id), &bytes).await
        })
    }

    fn load_run_state(&self, run_id: Uuid) -> BoxFuture<'_, Result<Option<RunState>>> {
        Box::pin(async move { read_json(&self.run_path(run_id)).await })
    }
}

async fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }
    Ok(())
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent_dir(path).await?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = File::create(&tmp)
        .await
        .with_context(|| format!("failed to create {}", tmp.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("failed to sync {}", tmp.display()))?;
    drop(file);

    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to move {} into place", path.display()))
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .with_context(|| format!("failed to decode {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}
