// src/core/persistence/aof_batch.rs

//! The single-writer batching pipeline in front of the live append-only
//! file.
//!
//! Callers hand in opaque RESP-encoded command buffers. Normal-sized
//! buffers go through a bounded queue to a dedicated worker that coalesces
//! them into one write; oversized buffers and `always`-fsync appends take a
//! direct path so durability and latency bounds hold. While an AOF rewrite
//! is running, every buffer that reaches the file is also offered to the
//! rewrite-side queue, in file order.

use crate::config::{FsyncPolicy, PersistenceConfig};
use crate::core::JasperDBError;
use crate::core::persistence::aof_rewriter::RewriteFeed;
use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{error, info, warn};

/// Capacity of the command queue, in encoded buffers.
pub const AOF_QUEUE_CAPACITY: usize = 1000;
/// Most buffers coalesced into a single file write.
const BATCH_MAX_BUFFERS: usize = 50;
/// How long the worker waits to fill a batch before writing what it has.
const BATCH_WINDOW: Duration = Duration::from_millis(5);
/// Buffers above this size bypass the queue entirely.
const LARGE_COMMAND_BYTES: usize = 512 * 1024;
/// How long shutdown waits for the worker before abandoning it.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Step by which a preallocated AOF is extended.
const PREALLOCATE_CHUNK: u64 = 4 * 1024 * 1024;

/// The live AOF with logical-size tracking. When preallocation is on, the
/// physical file is kept ahead of the logical end in 4 MiB steps and
/// truncated back on close.
pub struct AofFile {
    file: File,
    path: PathBuf,
    logical_size: u64,
    allocated_size: u64,
    preallocate: bool,
}

impl AofFile {
    pub async fn open(path: impl AsRef<Path>, preallocate: bool) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        let logical_size = file.metadata().await?.len();
        let mut allocated_size = logical_size;
        if preallocate {
            allocated_size = logical_size + PREALLOCATE_CHUNK;
            file.set_len(allocated_size).await?;
        }
        file.seek(SeekFrom::Start(logical_size)).await?;
        Ok(Self {
            file,
            path,
            logical_size,
            allocated_size,
            preallocate,
        })
    }

    pub async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if self.preallocate {
            let needed = self.logical_size + data.len() as u64;
            if needed > self.allocated_size {
                // set_len does not move the write cursor.
                self.allocated_size = needed + PREALLOCATE_CHUNK;
                self.file.set_len(self.allocated_size).await?;
            }
        }
        self.file.write_all(data).await?;
        self.logical_size += data.len() as u64;
        Ok(())
    }

    pub async fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_data().await
    }

    /// Truncates any preallocated tail and flushes file metadata.
    pub async fn close(&mut self) -> std::io::Result<()> {
        if self.preallocate && self.allocated_size > self.logical_size {
            self.file.set_len(self.logical_size).await?;
            self.allocated_size = self.logical_size;
        }
        self.file.sync_all().await
    }

    /// Reopens the path after the rewrite swapped a new file underneath;
    /// the old handle pointed at the replaced inode.
    pub async fn reopen(&mut self) -> std::io::Result<()> {
        *self = AofFile::open(&self.path, self.preallocate).await?;
        Ok(())
    }

    /// Logical size: bytes of real AOF content, excluding preallocation.
    pub fn len(&self) -> u64 {
        self.logical_size
    }

    pub fn is_empty(&self) -> bool {
        self.logical_size == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct AofBatchWriter {
    pub(crate) file: Arc<Mutex<AofFile>>,
    tx: mpsc::Sender<Bytes>,
    policy: FsyncPolicy,
    dirty: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    backpressure: Arc<AtomicBool>,
    /// Buffers enqueued but not yet written by the worker.
    queued: Arc<AtomicI64>,
    feed: Arc<RewriteFeed>,
    shutdown_tx: broadcast::Sender<()>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    fsync_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl AofBatchWriter {
    /// Opens the live AOF and starts the batch worker, plus the fsync
    /// scheduler when the policy is `everysecond`.
    pub async fn open(
        config: &PersistenceConfig,
        feed: Arc<RewriteFeed>,
    ) -> Result<Arc<Self>, JasperDBError> {
        let file = Arc::new(Mutex::new(
            AofFile::open(&config.aof_file_name, config.preallocate_aof).await?,
        ));
        let (tx, rx) = mpsc::channel(AOF_QUEUE_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);
        let dirty = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let backpressure = Arc::new(AtomicBool::new(false));
        let queued = Arc::new(AtomicI64::new(0));

        let writer = Arc::new(Self {
            file: file.clone(),
            tx,
            policy: config.fsync_policy,
            dirty: dirty.clone(),
            running: running.clone(),
            backpressure: backpressure.clone(),
            queued: queued.clone(),
            feed: feed.clone(),
            shutdown_tx: shutdown_tx.clone(),
            worker: parking_lot::Mutex::new(None),
            fsync_task: parking_lot::Mutex::new(None),
        });

        let worker = BatchWorker {
            rx,
            file: file.clone(),
            policy: config.fsync_policy,
            dirty: dirty.clone(),
            feed,
            backpressure,
            queued,
        };
        let worker_handle = tokio::spawn(worker.run(shutdown_tx.subscribe()));
        *writer.worker.lock() = Some(worker_handle);

        if config.fsync_policy == FsyncPolicy::EverySecond {
            let interval = Duration::from_millis(config.aof_fsync_interval_ms);
            let handle = tokio::spawn(fsync_scheduler(
                file,
                dirty,
                interval,
                shutdown_tx.subscribe(),
            ));
            *writer.fsync_task.lock() = Some(handle);
        }

        info!(
            "AOF batch writer started. Writing to {}. Fsync policy: {:?}",
            config.aof_file_name, config.fsync_policy
        );
        Ok(writer)
    }

    /// Appends one encoded command buffer to the live AOF.
    ///
    /// Under the `always` policy the write and its fsync complete before
    /// this returns. Oversized buffers bypass the queue and raise the
    /// backpressure flag for one worker tick. A full queue degrades to a
    /// direct write instead of dropping the buffer.
    pub async fn append(&self, buffer: Bytes) -> Result<(), JasperDBError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(JasperDBError::InvalidState(
                "AOF writer is shut down".into(),
            ));
        }
        if buffer.len() > LARGE_COMMAND_BYTES {
            self.backpressure.store(true, Ordering::Release);
            return self.write_direct(buffer).await;
        }
        if self.policy == FsyncPolicy::Always {
            return self.write_direct(buffer).await;
        }
        self.queued.fetch_add(1, Ordering::AcqRel);
        match self.tx.try_send(buffer) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(buffer)) => {
                self.queued.fetch_sub(1, Ordering::AcqRel);
                warn!("AOF command queue is full; falling back to a direct write");
                self.write_direct(buffer).await
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.queued.fetch_sub(1, Ordering::AcqRel);
                Err(JasperDBError::InvalidState(
                    "AOF writer queue is closed".into(),
                ))
            }
        }
    }

    /// Waits until every buffer enqueued so far has reached the file. The
    /// rewrite trigger uses this so commands older than the snapshot can
    /// never leak into the rewrite-side queue.
    pub async fn flush_queue(&self) {
        let mut waited = Duration::ZERO;
        while self.queued.load(Ordering::Acquire) > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
            waited += Duration::from_millis(1);
            if waited > Duration::from_secs(5) {
                warn!("AOF queue flush timed out with buffers still pending");
                return;
            }
        }
    }

    async fn write_direct(&self, buffer: Bytes) -> Result<(), JasperDBError> {
        let mut file = self.file.lock().await;
        file.write(&buffer).await?;
        match self.policy {
            FsyncPolicy::Always => file.sync().await?,
            FsyncPolicy::EverySecond => self.dirty.store(true, Ordering::Release),
            FsyncPolicy::Never => {}
        }
        // Offered under the file lock so the rewrite queue sees buffers in
        // file order.
        self.feed.offer(buffer).await;
        Ok(())
    }

    /// True for the tick after a large command went around the queue.
    pub fn is_backpressured(&self) -> bool {
        self.backpressure.load(Ordering::Acquire)
    }

    /// True when bytes have been written since the last fsync under the
    /// `everysecond` policy.
    pub fn fsync_pending(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Current logical size of the live AOF.
    pub async fn file_len(&self) -> u64 {
        self.file.lock().await.len()
    }

    /// Stops the worker, drains what it can, fsyncs, and truncates any
    /// preallocated tail. Idempotent.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());

        let worker = self.worker.lock().take();
        if let Some(mut handle) = worker
            && timeout(SHUTDOWN_JOIN_TIMEOUT, &mut handle).await.is_err()
        {
            handle.abort();
            warn!("AOF worker did not exit in time; aborted with queued buffers leaked");
        }
        if let Some(handle) = self.fsync_task.lock().take() {
            handle.abort();
        }

        let mut file = self.file.lock().await;
        if let Err(e) = file.sync().await {
            error!("final AOF fsync failed during shutdown: {e}");
        }
        if let Err(e) = file.close().await {
            error!("failed to close AOF file during shutdown: {e}");
        }
        info!("AOF batch writer shut down");
    }
}

struct BatchWorker {
    rx: mpsc::Receiver<Bytes>,
    file: Arc<Mutex<AofFile>>,
    policy: FsyncPolicy,
    dirty: Arc<AtomicBool>,
    feed: Arc<RewriteFeed>,
    backpressure: Arc<AtomicBool>,
    queued: Arc<AtomicI64>,
}

impl BatchWorker {
    async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            let first = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                item = self.rx.recv() => match item {
                    Some(buffer) => buffer,
                    None => break,
                },
            };

            let mut batch = Vec::with_capacity(BATCH_MAX_BUFFERS);
            batch.push(first);
            let deadline = Instant::now() + BATCH_WINDOW;
            while batch.len() < BATCH_MAX_BUFFERS {
                match timeout_at(deadline, self.rx.recv()).await {
                    Ok(Some(buffer)) => batch.push(buffer),
                    Ok(None) => break,
                    Err(_) => break,
                }
            }

            if let Err(e) = self.flush_batch(&batch).await {
                error!("AOF batch write failed: {e}");
            }
            self.queued.fetch_sub(batch.len() as i64, Ordering::AcqRel);
            self.backpressure.store(false, Ordering::Release);
        }

        // Shutdown drain: whatever is still queued is written out before
        // the file is released.
        self.rx.close();
        let mut leftover = Vec::new();
        while let Ok(buffer) = self.rx.try_recv() {
            leftover.push(buffer);
        }
        if !leftover.is_empty() {
            info!("draining {} queued AOF buffers on shutdown", leftover.len());
            if let Err(e) = self.flush_batch(&leftover).await {
                error!("failed to drain AOF queue during shutdown: {e}");
            }
            self.queued.fetch_sub(leftover.len() as i64, Ordering::AcqRel);
        }
        let mut file = self.file.lock().await;
        if let Err(e) = file.sync().await {
            error!("failed to fsync AOF file on worker exit: {e}");
        }
    }

    /// Concatenates the batch into a single write, then offers each buffer
    /// to the rewrite feed in order.
    async fn flush_batch(&self, batch: &[Bytes]) -> Result<(), JasperDBError> {
        let total: usize = batch.iter().map(|b| b.len()).sum();
        let mut combined = BytesMut::with_capacity(total);
        for buffer in batch {
            combined.extend_from_slice(buffer);
        }

        let mut file = self.file.lock().await;
        file.write(&combined).await?;
        match self.policy {
            FsyncPolicy::Always => file.sync().await?,
            FsyncPolicy::EverySecond => self.dirty.store(true, Ordering::Release),
            FsyncPolicy::Never => {}
        }
        for buffer in batch {
            self.feed.offer(buffer.clone()).await;
        }
        Ok(())
    }
}

/// Periodic fsync for the `everysecond` policy: sync only when something
/// was written since the last pass.
async fn fsync_scheduler(
    file: Arc<Mutex<AofFile>>,
    dirty: Arc<AtomicBool>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return,
            _ = ticker.tick() => {
                if dirty.swap(false, Ordering::AcqRel) {
                    let mut file = file.lock().await;
                    if let Err(e) = file.sync().await {
                        error!("periodic AOF fsync failed: {e}");
                    }
                }
            }
        }
    }
}
