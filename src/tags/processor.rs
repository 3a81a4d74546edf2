//! Gating window processor.
//!
//! A single worker turns the bursty raw stream into one canonical read per grouping key
//! per window:
//!
//! 1. Wait, with no deadline, for the first raw read of a window.
//! 2. Read gating length and style from the current configuration version.
//! 3. Sleep out the window, then drain everything queued meanwhile.
//! 4. Collapse to survivors, update the status counters and route the batch.
//!
//! The worker is spawned on the first submitted read and lives until shutdown.
//! Cancellation during either wait ends the loop without emitting the window in
//! progress.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::gating::collapse;
use super::read::TagRead;
use super::router::TagRouter;
use crate::config::ConfigHandle;
use crate::error::{AppResult, IngestError};
use crate::status::StatusAggregator;

/// Handle to the gating worker.
pub struct GatingProcessor {
    config: ConfigHandle,
    router: Arc<TagRouter>,
    status: Arc<StatusAggregator>,
    tx: mpsc::Sender<TagRead>,
    pending: Mutex<Option<mpsc::Receiver<TagRead>>>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl GatingProcessor {
    /// Create the processor; the worker starts with the first submitted read
    pub fn new(
        config: ConfigHandle,
        router: Arc<TagRouter>,
        status: Arc<StatusAggregator>,
        capacity: usize,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Arc::new(Self {
            config,
            router,
            status,
            tx,
            pending: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }

    /// Queue one raw read for the next window
    pub async fn submit(&self, read: TagRead) -> AppResult<()> {
        if self.cancel.is_cancelled() {
            return Err(IngestError::ChannelClosed("gating"));
        }
        self.ensure_started();
        self.tx
            .send(read)
            .await
            .map_err(|_| IngestError::ChannelClosed("gating"))
    }

    /// Whether the worker has been spawned
    pub fn is_started(&self) -> bool {
        self.pending.lock().is_none()
    }

    fn ensure_started(&self) {
        let Some(rx) = self.pending.lock().take() else {
            return;
        };
        tracing::info!("Starting gating processor");
        let worker = tokio::spawn(run_processor(
            rx,
            self.config.clone(),
            Arc::clone(&self.router),
            Arc::clone(&self.status),
            self.cancel.clone(),
        ));
        *self.worker.lock() = Some(worker);
    }

    /// Stop the worker, discarding the window in progress
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.pending.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "Gating processor task failed");
            }
        }
    }
}

async fn run_processor(
    mut rx: mpsc::Receiver<TagRead>,
    config: ConfigHandle,
    router: Arc<TagRouter>,
    status: Arc<StatusAggregator>,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = rx.recv() => match read {
                Some(read) => read,
                None => break,
            },
        };

        let current = config.current();
        let window = current.settings.gating_window();
        let style = current.settings.reader.gating_style;
        tracing::debug!(
            gating_ms = window.as_millis() as u64,
            style = %style,
            version = current.version,
            "Gating window opened"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Shutdown during gating window, discarding it");
                break;
            }
            _ = tokio::time::sleep(window) => {}
        }

        let mut reads = vec![first];
        while let Ok(read) = rx.try_recv() {
            reads.push(read);
        }
        let raw = reads.len();

        let gated = collapse(reads, style);
        let count = gated.survivors.len();
        tracing::debug!(raw, count, "Gating window closed");

        status.record_accepted(count as u64, gated.last_read);
        if let Err(err) = router.submit(gated.survivors).await {
            tracing::error!(count, error = %err, "Unable to route gated batch");
            break;
        }
    }
    tracing::info!("Exiting gating processor");
}
