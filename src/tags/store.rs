//! Durable, append-only store of canonical reads.
//!
//! Every accepted batch is written as its own small file:
//!
//! ```text
//! <root>/YYYY/MM/DD/HH/HH-MM-SS-mmm.dat     one encoded read per line
//! ```
//!
//! There is no large mutable file to corrupt. A power cut loses at most the batch that
//! was being written; every earlier file replays on its own. On open the whole tree is
//! scanned and loaded into memory before the store hands out a handle, so nothing is
//! appended ahead of history.
//!
//! # Architecture
//!
//! ```text
//! append(batch) ──mpsc──→ writer task ──→ in-memory Vec (extend)
//!                                      └─→ new batch file
//! snapshot()  ←── copy of the Vec, sorted by timestamp
//! ```
//!
//! Only the writer task mutates the in-memory collection. Readers always receive a copy
//! taken under the lock, so they never see half a batch.

use chrono::{Local, NaiveDateTime};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::read::{sort_by_time, TagRead};
use crate::config::StorageSettings;
use crate::error::{AppResult, IngestError};

/// Attempts at finding a free file name when two batches land in the same millisecond.
const CREATE_ATTEMPTS: usize = 5;

enum StoreCommand {
    Append(Arc<Vec<TagRead>>),
    Flush(oneshot::Sender<()>),
}

/// Outcome of the startup scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Batch files read
    pub files: usize,
    /// Reads loaded
    pub reads: usize,
    /// Lines that failed to decode
    pub skipped_lines: usize,
    /// Files that could not be opened or read
    pub unreadable_files: usize,
    /// Wall time of the scan
    pub elapsed: Duration,
}

/// Write-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Batches appended to memory
    pub batches: u64,
    /// Batch files written successfully
    pub files_written: u64,
    /// Batch files that failed to write
    pub write_failures: u64,
}

#[derive(Default)]
struct Counters {
    batches: AtomicU64,
    files_written: AtomicU64,
    write_failures: AtomicU64,
}

/// Handle to the durable store.
pub struct TagStore {
    root: PathBuf,
    retention_days: u32,
    reads: Arc<RwLock<Vec<TagRead>>>,
    tx: mpsc::Sender<StoreCommand>,
    counters: Arc<Counters>,
    replay: ReplayReport,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TagStore {
    /// Replay the store under `settings.path`, then start the writer.
    ///
    /// A root that cannot be created is logged and the store keeps running without
    /// durability; batches still reach memory and subscribers.
    pub async fn open(settings: &StorageSettings, capacity: usize) -> Arc<Self> {
        let root = settings.path.clone();

        if let Err(err) = tokio::fs::create_dir_all(&root).await {
            tracing::error!(path = %root.display(), error = %err, "Unable to create store directory");
        }

        let scan_root = root.clone();
        let (history, replay) = match tokio::task::spawn_blocking(move || replay_dir(&scan_root)).await {
            Ok(loaded) => loaded,
            Err(err) => {
                tracing::error!(error = %err, "Store replay task failed");
                (Vec::new(), ReplayReport::default())
            }
        };
        tracing::info!(
            path = %root.display(),
            elapsed_ms = replay.elapsed.as_millis() as u64,
            reads = replay.reads,
            files = replay.files,
            skipped = replay.skipped_lines,
            "Loaded store"
        );
        tracing::info!(
            retention_days = settings.retention_days,
            "Retention is advertised only; no batch files are removed"
        );

        let reads = Arc::new(RwLock::new(history));
        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let worker = tokio::spawn(run_writer(
            root.clone(),
            Arc::clone(&reads),
            Arc::clone(&counters),
            rx,
            cancel.clone(),
        ));

        Arc::new(Self {
            root,
            retention_days: settings.retention_days,
            reads,
            tx,
            counters,
            replay,
            cancel,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a batch for memory and disk.
    ///
    /// Waits while the writer's queue is full.
    pub async fn append(&self, batch: Arc<Vec<TagRead>>) -> AppResult<()> {
        self.tx
            .send(StoreCommand::Append(batch))
            .await
            .map_err(|_| IngestError::ChannelClosed("store"))
    }

    /// Wait until every batch queued before this call has been handled.
    pub async fn flush(&self) -> AppResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Flush(done_tx))
            .await
            .map_err(|_| IngestError::ChannelClosed("store"))?;
        done_rx
            .await
            .map_err(|_| IngestError::ChannelClosed("store"))
    }

    /// Copy of every known read, sorted by timestamp.
    pub fn snapshot(&self) -> Vec<TagRead> {
        let mut reads = self.reads.read().clone();
        sort_by_time(&mut reads);
        reads
    }

    /// Number of reads in memory
    pub fn len(&self) -> usize {
        self.reads.read().len()
    }

    /// Whether the store holds no reads
    pub fn is_empty(&self) -> bool {
        self.reads.read().is_empty()
    }

    /// Root directory of the batch files
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Advertised retention in days
    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// What the startup scan found
    pub fn replay_report(&self) -> &ReplayReport {
        &self.replay
    }

    /// Write-side counters
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            batches: self.counters.batches.load(Ordering::Relaxed),
            files_written: self.counters.files_written.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
        }
    }

    /// Stop the writer after it has handled everything already queued.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "Store writer task failed");
            }
        }
    }
}

async fn run_writer(
    root: PathBuf,
    reads: Arc<RwLock<Vec<TagRead>>>,
    counters: Arc<Counters>,
    mut rx: mpsc::Receiver<StoreCommand>,
    cancel: CancellationToken,
) {
    tracing::info!("Store writer started");
    loop {
        let command = tokio::select! {
            biased;
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
            _ = cancel.cancelled() => {
                while let Ok(command) = rx.try_recv() {
                    handle_command(&root, &reads, &counters, command).await;
                }
                break;
            }
        };
        handle_command(&root, &reads, &counters, command).await;
    }
    tracing::info!("Exiting store writer");
}

async fn handle_command(
    root: &Path,
    reads: &RwLock<Vec<TagRead>>,
    counters: &Counters,
    command: StoreCommand,
) {
    match command {
        StoreCommand::Append(batch) => {
            reads.write().extend(batch.iter().cloned());
            counters.batches.fetch_add(1, Ordering::Relaxed);

            match write_batch(root, &batch).await {
                Ok(path) => {
                    counters.files_written.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(path = %path.display(), count = batch.len(), "Wrote batch file");
                }
                Err(err) => {
                    counters.write_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        root = %root.display(),
                        count = batch.len(),
                        error = %err,
                        "Error writing batch file; reads kept in memory"
                    );
                }
            }
        }
        StoreCommand::Flush(done) => {
            let _ = done.send(());
        }
    }
}

/// Path of a batch file written at `now`.
pub fn batch_path(root: &Path, now: NaiveDateTime) -> PathBuf {
    root.join(now.format("%Y/%m/%d/%H/%H-%M-%S-%3f.dat").to_string())
}

/// Encode a batch as newline-terminated lines.
pub fn encode_batch(batch: &[TagRead]) -> String {
    let mut data = String::with_capacity(batch.len() * 128);
    for read in batch {
        data.push_str(&read.to_line());
        data.push('\n');
    }
    data
}

async fn write_batch(root: &Path, batch: &[TagRead]) -> std::io::Result<PathBuf> {
    let data = encode_batch(batch);

    let mut attempt = 0;
    loop {
        attempt += 1;
        let path = batch_path(root, Local::now().naive_local());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        let mut file = match opened {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && attempt < CREATE_ATTEMPTS => {
                tokio::time::sleep(Duration::from_millis(1)).await;
                continue;
            }
            Err(err) => return Err(err),
        };

        file.write_all(data.as_bytes()).await?;
        file.sync_all().await?;
        return Ok(path);
    }
}

/// Load every batch file below `root`.
///
/// Unreadable files and undecodable lines are logged and skipped; the scan always
/// completes.
pub fn replay_dir(root: &Path) -> (Vec<TagRead>, ReplayReport) {
    let start = Instant::now();
    let mut report = ReplayReport::default();
    let mut reads = Vec::new();

    let mut files = Vec::new();
    collect_files(root, &mut files);
    files.sort();

    for file in files {
        let text = match std::fs::read_to_string(&file) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(path = %file.display(), error = %err, "Error reading batch file");
                report.unreadable_files += 1;
                continue;
            }
        };
        report.files += 1;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match TagRead::from_line(line) {
                Ok(read) => reads.push(read),
                Err(err) => {
                    tracing::warn!(path = %file.display(), line, error = %err, "Skipping malformed read");
                    report.skipped_lines += 1;
                }
            }
        }
    }

    report.reads = reads.len();
    report.elapsed = start.elapsed();
    (reads, report)
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::error!(path = %dir.display(), error = %err, "Error reading store directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(kind) if kind.is_dir() => collect_files(&path, files),
            Ok(kind) if kind.is_file() => files.push(path),
            _ => {}
        }
    }
}
