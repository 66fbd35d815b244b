// src/core/persistence/aof_rewriter.rs

//! Implements the AOF (Append-Only File) rewrite logic.
//!
//! The rewrite replaces the growing AOF with an equivalent compact file. It
//! serializes a dictionary snapshot of every database as reconstruction
//! commands (file A) while the live writer keeps appending to the old AOF
//! and copying each buffer into a rewrite-side queue. A drain task persists
//! that queue to file B, spilling to numbered overflow files when the queue
//! backs up. When the snapshot pass ends, A, B, and the overflow files are
//! merged and atomically swapped in as the new AOF. Failure at any point
//! leaves the live AOF untouched.
//!
//! The trigger phase (arming the rewrite-side queue and starting the
//! snapshots) runs on the caller, which in the single-writer model is the
//! command loop itself. That makes the cut exact: every command lands
//! either wholly before the snapshot or wholly in the rewrite-side queue,
//! never both and never neither.

use crate::core::JasperDBError;
use crate::core::persistence::aof_batch::AofBatchWriter;
use crate::core::persistence::coordinator::SnapshotKind;
use crate::core::protocol::RespFrame;
use crate::core::state::ServerState;
use crate::core::storage::db::Db;
use crate::core::storage::dict::{SnapshotCursor, SnapshotToken};
use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Soft cap on snapshot creation across all databases.
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(30);
/// How long the drain task may take to wind down after `stop_draining`.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// The drain task's poll interval on the rewrite-side queue.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Bound of the rewrite-side queue, in buffers.
pub const REWRITE_QUEUE_CAPACITY: usize = 1024;
/// How long the live writer waits on a full rewrite-side queue before
/// spilling the buffer to an overflow file.
const REWRITE_OFFER_TIMEOUT: Duration = Duration::from_millis(100);
/// Overflow files rotate at twice the queue's soft byte bound.
const OVERFLOW_FILE_MAX_BYTES: u64 = 8 * 1024 * 1024;
/// Snapshot entries copied out per dictionary lock acquisition.
const SNAPSHOT_CHUNK_ENTRIES: usize = 128;

/// Where a rewrite currently is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RewritePhase {
    #[default]
    Idle,
    Snapshotting,
    WritingSnapshot,
    Draining,
    Merging,
    Replacing,
}

// --- Rewrite-side queue ---

/// The bounded queue the live AOF writer copies command buffers into while
/// a rewrite runs, plus the overflow spill that catches what the queue
/// cannot hold. Owned by the engine state; armed per rewrite.
pub struct RewriteFeed {
    active: AtomicBool,
    tx: parking_lot::Mutex<Option<mpsc::Sender<Bytes>>>,
    overflow: Mutex<OverflowSpill>,
}

impl Default for RewriteFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl RewriteFeed {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            tx: parking_lot::Mutex::new(None),
            overflow: Mutex::new(OverflowSpill::new()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Arms the feed for a rewrite session and returns the queue receiver.
    pub(crate) async fn begin(&self, dir: PathBuf) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(REWRITE_QUEUE_CAPACITY);
        self.overflow.lock().await.reset(dir);
        *self.tx.lock() = Some(tx);
        self.active.store(true, Ordering::Release);
        rx
    }

    /// Stops copying buffers. Idempotent; called once the merged file has
    /// everything and again on teardown.
    pub(crate) fn end(&self) {
        self.active.store(false, Ordering::Release);
        *self.tx.lock() = None;
    }

    /// Copies one written buffer into the rewrite-side queue, spilling to
    /// an overflow file if the queue stays full past the offer timeout.
    /// Buffers are never dropped.
    pub async fn offer(&self, buffer: Bytes) {
        if !self.is_active() {
            return;
        }
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            return;
        };
        match tx.send_timeout(buffer, REWRITE_OFFER_TIMEOUT).await {
            Ok(()) => {}
            Err(mpsc::error::SendTimeoutError::Timeout(buffer))
            | Err(mpsc::error::SendTimeoutError::Closed(buffer)) => {
                warn!("rewrite-side queue is saturated; spilling buffer to overflow file");
                let mut overflow = self.overflow.lock().await;
                if let Err(e) = overflow.append(&buffer).await {
                    error!("failed to spill AOF buffer to overflow file: {e}");
                }
            }
        }
    }

    /// Syncs and closes the current overflow file, then hands over the
    /// spill files accumulated since the last drain, in creation order.
    /// The next spill starts a fresh file.
    pub(crate) async fn drain_overflow_files(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut overflow = self.overflow.lock().await;
        overflow.finish().await?;
        Ok(overflow.take_files())
    }

    /// Hands over and forgets the spill files without syncing, for error
    /// paths that are about to delete them.
    pub(crate) async fn take_overflow_files(&self) -> Vec<PathBuf> {
        self.overflow.lock().await.take_files()
    }
}

/// On-demand spill files, named with a monotone counter and rotated at a
/// size cap so no single file grows unbounded.
struct OverflowSpill {
    dir: PathBuf,
    counter: u64,
    current: Option<(File, u64)>,
    files: Vec<PathBuf>,
}

impl OverflowSpill {
    fn new() -> Self {
        Self {
            dir: PathBuf::from("."),
            counter: 0,
            current: None,
            files: Vec::new(),
        }
    }

    fn reset(&mut self, dir: PathBuf) {
        self.dir = dir;
        self.current = None;
        self.files.clear();
    }

    async fn append(&mut self, data: &[u8]) -> std::io::Result<()> {
        let needs_rotation = match &self.current {
            Some((_, written)) => *written >= OVERFLOW_FILE_MAX_BYTES,
            None => true,
        };
        if needs_rotation {
            self.finish().await?;
            let path = self.dir.join(format!("redis_aof_overflow.{}", self.counter));
            self.counter += 1;
            let file = File::create(&path).await?;
            self.files.push(path);
            self.current = Some((file, 0));
        }
        let (file, written) = self.current.as_mut().expect("overflow file just opened");
        file.write_all(data).await?;
        *written += data.len() as u64;
        Ok(())
    }

    async fn finish(&mut self) -> std::io::Result<()> {
        if let Some((file, _)) = self.current.take() {
            file.sync_all().await?;
        }
        Ok(())
    }

    fn take_files(&mut self) -> Vec<PathBuf> {
        self.current = None;
        std::mem::take(&mut self.files)
    }
}

// --- The rewriter ---

pub struct AofRewriter {
    state: Arc<ServerState>,
}

/// Everything the trigger phase produced on the caller: the held
/// snapshots, the armed queue receiver, and the session file names.
struct PreparedRewrite {
    snapshots: Vec<(Arc<Db>, SnapshotToken)>,
    queue_rx: mpsc::Receiver<Bytes>,
    paths: RewritePaths,
}

struct RewritePaths {
    snapshot_file: PathBuf,
    buffer_file: PathBuf,
    merged_file: PathBuf,
    aof: PathBuf,
}

impl AofRewriter {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    /// Kicks off a rewrite: snapshots on the caller, everything else on a
    /// background task. Returns false when another snapshot consumer holds
    /// the coordinator slot.
    pub async fn bg_rewrite(&self) -> Result<bool, JasperDBError> {
        let Some(writer) = self.state.persistence.aof_writer.clone() else {
            return Err(JasperDBError::InvalidState(
                "AOF persistence is disabled".into(),
            ));
        };
        if !self
            .state
            .persistence
            .coordinator
            .try_acquire(SnapshotKind::Aof)
        {
            debug!("snapshot slot busy; skipping AOF rewrite");
            return Ok(false);
        }
        let prepared = match prepare_rewrite(&self.state, &writer).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.state
                    .persistence
                    .coordinator
                    .release(SnapshotKind::Aof);
                return Err(e);
            }
        };
        let state = self.state.clone();
        tokio::spawn(async move {
            match finish_rewrite(&state, &writer, prepared).await {
                Ok(()) => info!("AOF rewrite completed successfully."),
                Err(e) => error!("AOF rewrite failed: {e}. The live AOF is untouched."),
            }
            state.persistence.coordinator.release(SnapshotKind::Aof);
        });
        Ok(true)
    }

    /// Runs a rewrite to completion on the caller. Used at shutdown and in
    /// tests where the caller needs the outcome.
    pub async fn rewrite(&self) -> Result<(), JasperDBError> {
        let Some(writer) = self.state.persistence.aof_writer.clone() else {
            return Err(JasperDBError::InvalidState(
                "AOF persistence is disabled".into(),
            ));
        };
        if !self
            .state
            .persistence
            .coordinator
            .try_acquire(SnapshotKind::Aof)
        {
            return Err(JasperDBError::InvalidState(
                "another snapshot consumer is active".into(),
            ));
        }
        let result = match prepare_rewrite(&self.state, &writer).await {
            Ok(prepared) => finish_rewrite(&self.state, &writer, prepared).await,
            Err(e) => Err(e),
        };
        self.state
            .persistence
            .coordinator
            .release(SnapshotKind::Aof);
        result
    }
}

fn set_phase(state: &ServerState, phase: RewritePhase) {
    debug!("AOF rewrite phase: {phase:?}");
    *state.persistence.rewrite_phase.lock() = phase;
}

/// The trigger phase, on the caller: flush the batch queue, arm the
/// rewrite-side queue, then snapshot every non-empty database. Flushing
/// first means no buffer older than the snapshot can still be in flight
/// when the feed arms; arming before snapshotting means a command running
/// after this function is fully captured by the queue, one that ran
/// before is fully captured by the snapshots.
async fn prepare_rewrite(
    state: &Arc<ServerState>,
    writer: &Arc<AofBatchWriter>,
) -> Result<PreparedRewrite, JasperDBError> {
    let persistence_config = state.config.lock().await.persistence.clone();
    let aof = PathBuf::from(&persistence_config.aof_file_name);
    let dir = aof
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let session: u32 = rand::random();
    let paths = RewritePaths {
        snapshot_file: dir.join(format!("redis_aof_snapshot.{session}")),
        buffer_file: dir.join(format!("redis_aof_buffer.{session}")),
        merged_file: dir.join(format!("redis_aof_merged.{session}")),
        aof,
    };

    set_phase(state, RewritePhase::Snapshotting);
    writer.flush_queue().await;
    let feed = state.persistence.rewrite_feed.clone();
    let queue_rx = feed.begin(dir).await;
    let snapshots = match timeout(SNAPSHOT_TIMEOUT, super::take_snapshots(state)).await {
        Ok(Ok(snapshots)) => snapshots,
        Ok(Err(e)) => {
            feed.end();
            set_phase(state, RewritePhase::Idle);
            return Err(e);
        }
        Err(_) => {
            feed.end();
            set_phase(state, RewritePhase::Idle);
            return Err(JasperDBError::Timeout(
                "snapshot creation exceeded its cap".into(),
            ));
        }
    };
    Ok(PreparedRewrite {
        snapshots,
        queue_rx,
        paths,
    })
}

/// Everything after the trigger. Each exit path deletes the temporaries,
/// releases the snapshots, and returns the state machine to `Idle`.
async fn finish_rewrite(
    state: &Arc<ServerState>,
    writer: &Arc<AofBatchWriter>,
    prepared: PreparedRewrite,
) -> Result<(), JasperDBError> {
    let PreparedRewrite {
        snapshots,
        queue_rx,
        paths,
    } = prepared;
    let feed = state.persistence.rewrite_feed.clone();

    let stop_draining = Arc::new(AtomicBool::new(false));
    let drain = tokio::spawn(drain_rewrite_queue(
        queue_rx,
        paths.buffer_file.clone(),
        stop_draining.clone(),
    ));

    let result =
        write_merge_replace(state, writer, &feed, &snapshots, &paths, stop_draining, drain).await;

    // Teardown shared by success and failure.
    feed.end();
    for path in feed.take_overflow_files().await {
        let _ = fs::remove_file(&path).await;
    }
    let _ = fs::remove_file(&paths.snapshot_file).await;
    let _ = fs::remove_file(&paths.buffer_file).await;
    if result.is_err() {
        let _ = fs::remove_file(&paths.merged_file).await;
    }
    for (db, _) in &snapshots {
        db.finish_snapshot_quietly().await;
    }
    if result.is_ok()
        && let Ok(metadata) = fs::metadata(&paths.aof).await
    {
        state
            .persistence
            .aof_last_rewrite_size
            .store(metadata.len(), Ordering::Relaxed);
    }
    set_phase(state, RewritePhase::Idle);
    result
}

async fn write_merge_replace(
    state: &Arc<ServerState>,
    writer: &Arc<AofBatchWriter>,
    feed: &Arc<RewriteFeed>,
    snapshots: &[(Arc<Db>, SnapshotToken)],
    paths: &RewritePaths,
    stop_draining: Arc<AtomicBool>,
    mut drain: JoinHandle<(mpsc::Receiver<Bytes>, Result<u64, JasperDBError>)>,
) -> Result<(), JasperDBError> {
    set_phase(state, RewritePhase::WritingSnapshot);
    write_snapshot_commands(snapshots, &paths.snapshot_file).await?;

    set_phase(state, RewritePhase::Draining);
    stop_draining.store(true, Ordering::Release);
    let mut queue_rx = match timeout(DRAIN_TIMEOUT, &mut drain).await {
        Ok(Ok((rx, drain_result))) => {
            let written = drain_result?;
            debug!("rewrite drain task persisted {written} bytes to the buffer file");
            rx
        }
        Ok(Err(join_error)) => {
            return Err(JasperDBError::Internal(format!(
                "rewrite drain task panicked: {join_error}"
            )));
        }
        Err(_) => {
            drain.abort();
            return Err(JasperDBError::Timeout(
                "rewrite drain did not complete in time".into(),
            ));
        }
    };

    set_phase(state, RewritePhase::Merging);
    let mut merged = File::create(&paths.merged_file).await?;
    append_file(&mut merged, &paths.snapshot_file).await?;
    append_file(&mut merged, &paths.buffer_file).await?;
    for overflow_path in feed.drain_overflow_files().await? {
        append_file(&mut merged, &overflow_path).await?;
        let _ = fs::remove_file(&overflow_path).await;
    }
    merged.flush().await?;

    set_phase(state, RewritePhase::Replacing);
    {
        // Appends block on this lock, so nothing can land between the
        // merged file and the new live AOF.
        let mut live = writer.file.lock().await;
        feed.end();

        // Late arrivals: whatever reached the queue or the overflow spill
        // after the drain stopped.
        while let Ok(buffer) = queue_rx.try_recv() {
            merged.write_all(&buffer).await?;
        }
        for overflow_path in feed.drain_overflow_files().await? {
            append_file(&mut merged, &overflow_path).await?;
            let _ = fs::remove_file(&overflow_path).await;
        }
        merged.sync_all().await?;
        drop(merged);

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let backup_path = paths.aof.with_extension(format!("{millis}.bak"));
        let have_backup = match fs::rename(&paths.aof, &backup_path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = fs::rename(&paths.merged_file, &paths.aof).await {
            if have_backup && fs::metadata(&paths.aof).await.is_err() {
                let _ = fs::rename(&backup_path, &paths.aof).await;
            }
            return Err(e.into());
        }
        if have_backup {
            let _ = fs::remove_file(&backup_path).await;
        }
        live.reopen().await?;
    }
    Ok(())
}

/// Serializes every snapshot as reconstruction commands into file A, each
/// database scoped by a SELECT.
async fn write_snapshot_commands(
    snapshots: &[(Arc<Db>, SnapshotToken)],
    path: &Path,
) -> Result<(), JasperDBError> {
    let mut file = File::create(path).await?;
    for (db, token) in snapshots {
        let select = RespFrame::command([
            Bytes::from_static(b"SELECT"),
            Bytes::from(db.index().to_string()),
        ]);
        file.write_all(&select.encode_to_vec()?).await?;

        let mut cursor = SnapshotCursor::start();
        loop {
            // The lock is dropped between chunks so the command loop keeps
            // running while the snapshot is serialized.
            let (pairs, next) = {
                let dict = db.dict.lock().await;
                dict.snapshot_chunk(*token, cursor, SNAPSHOT_CHUNK_ENTRIES)?
            };
            let mut chunk = BytesMut::new();
            for (key, value) in &pairs {
                for frame in value.reconstruction_commands(key) {
                    chunk.extend_from_slice(&frame.encode_to_vec()?);
                }
            }
            file.write_all(&chunk).await?;
            match next {
                Some(resumed) => cursor = resumed,
                None => break,
            }
        }
        info!("AOF rewrite: snapshot of db {} written", db.index());
    }
    file.sync_all().await?;
    Ok(())
}

/// Persists the rewrite-side queue to file B until told to stop, then
/// finishes what is immediately available and hands the receiver back for
/// the final catch-up.
async fn drain_rewrite_queue(
    mut rx: mpsc::Receiver<Bytes>,
    path: PathBuf,
    stop: Arc<AtomicBool>,
) -> (mpsc::Receiver<Bytes>, Result<u64, JasperDBError>) {
    let mut file = match File::create(&path).await {
        Ok(file) => file,
        Err(e) => return (rx, Err(e.into())),
    };
    let mut written = 0u64;
    loop {
        match timeout(DRAIN_POLL_INTERVAL, rx.recv()).await {
            Ok(Some(buffer)) => {
                if let Err(e) = file.write_all(&buffer).await {
                    return (rx, Err(e.into()));
                }
                written += buffer.len() as u64;
            }
            Ok(None) => break,
            Err(_) => {}
        }
        if stop.load(Ordering::Acquire) {
            // Finish what is already queued, then hand control back.
            while let Ok(buffer) = rx.try_recv() {
                if let Err(e) = file.write_all(&buffer).await {
                    return (rx, Err(e.into()));
                }
                written += buffer.len() as u64;
            }
            break;
        }
    }
    if let Err(e) = file.sync_all().await {
        return (rx, Err(e.into()));
    }
    (rx, Ok(written))
}

async fn append_file(dst: &mut File, src: &Path) -> Result<(), JasperDBError> {
    let mut reader = File::open(src).await?;
    tokio::io::copy(&mut reader, dst).await?;
    Ok(())
}
