//! Pipeline assembly and control.
//!
//! [`Pipeline`] builds every stage once and wires them together by explicit handles:
//!
//! ```text
//!            ┌────────────── ReaderSet ──────────────┐
//!            ▼                                       │
//!       ReadIntake ──→ GatingProcessor ──→ TagRouter ──→ TagStore
//!            │                                  └──────→ LiveFeed ──→ subscribers
//!            └──→ StatusAggregator ────────────────────→ LiveFeed
//! ```
//!
//! It is also the surface an API layer drives: start/stop ingestion, current status,
//! stored reads, a manual trigger and live subscriptions.

use chrono::NaiveDateTime;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::{ConfigHandle, Settings};
use crate::error::{AppResult, IngestError};
use crate::feed::{LiveEvent, LiveFeed};
use crate::readers::{ReaderRegistry, ReaderSet};
use crate::status::{StatusAggregator, StatusSnapshot};
use crate::tags::{filter_by_time, Epc, GatingProcessor, ReadIntake, TagRead, TagRouter, TagStore};

/// The assembled ingestion pipeline.
pub struct Pipeline {
    config: ConfigHandle,
    ingesting: Arc<AtomicBool>,
    feed: Arc<LiveFeed>,
    store: Arc<TagStore>,
    router: Arc<TagRouter>,
    status: Arc<StatusAggregator>,
    processor: Arc<GatingProcessor>,
    readers: Arc<ReaderSet>,
    intake: ReadIntake,
    reader_failures: Vec<IngestError>,
}

impl Pipeline {
    /// Validate `settings`, replay the store and start every long-lived worker.
    ///
    /// Readers whose backend cannot be built are logged and left out; see
    /// [`Pipeline::reader_failures`].
    pub async fn build(settings: Settings, registry: &ReaderRegistry) -> AppResult<Self> {
        settings.validate()?;
        let (readers, reader_failures) = ReaderSet::from_settings(&settings, registry);
        let queues = settings.queues.clone();
        let storage = settings.storage.clone();
        let config = ConfigHandle::new(settings);

        let ingesting = Arc::new(AtomicBool::new(false));
        let feed = Arc::new(LiveFeed::new(queues.subscriber_capacity));
        let store = TagStore::open(&storage, queues.store_capacity).await;
        let router = TagRouter::spawn(Arc::clone(&store), Arc::clone(&feed), queues.router_capacity);

        let readers = Arc::new(readers);
        let status = StatusAggregator::new(
            config.clone(),
            Arc::clone(&readers),
            Arc::clone(&feed),
            Arc::clone(&ingesting),
        );
        status.start();

        let processor = GatingProcessor::new(
            config.clone(),
            Arc::clone(&router),
            Arc::clone(&status),
            queues.raw_capacity,
        );
        let intake = ReadIntake::new(
            Arc::clone(&ingesting),
            Arc::clone(&status),
            Arc::clone(&processor),
            Arc::clone(&feed),
        );

        tracing::info!(
            readers = readers.len(),
            stored = store.len(),
            "Pipeline ready"
        );

        Ok(Self {
            config,
            ingesting,
            feed,
            store,
            router,
            status,
            processor,
            readers,
            intake,
            reader_failures,
        })
    }

    /// Live configuration
    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Handle readers use to submit raw reads
    pub fn intake(&self) -> ReadIntake {
        self.intake.clone()
    }

    /// Configured readers
    pub fn readers(&self) -> &ReaderSet {
        &self.readers
    }

    /// Errors of readers that could not be built
    pub fn reader_failures(&self) -> &[IngestError] {
        &self.reader_failures
    }

    /// Durable store
    pub fn store(&self) -> &TagStore {
        &self.store
    }

    /// Live fan-out
    pub fn feed(&self) -> &LiveFeed {
        &self.feed
    }

    /// Submit one raw read, as a reader would
    pub async fn submit_raw_read(&self, read: TagRead) -> AppResult<()> {
        self.intake.submit(read).await
    }

    /// Begin ingesting: reset counters, accept reads, sync reader clocks and start readers.
    ///
    /// Counters are reset only on the stopped to started transition; calling this while
    /// already ingesting changes nothing.
    pub async fn start_ingestion(&self) {
        if self
            .ingesting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Ingestion already running");
            return;
        }
        // Reads accepted from here are counted only when their window closes
        self.status.reset();
        let now = self.config.current().settings.clock_zone().now();
        self.readers.set_clocks(now).await;
        self.readers.start_reading(&self.intake).await;
        tracing::info!("Ingestion started");
    }

    /// Stop accepting reads; anything already queued still drains
    pub async fn stop_ingestion(&self) {
        self.ingesting.store(false, Ordering::SeqCst);
        self.readers.stop_reading().await;
        tracing::info!("Ingestion stopped");
    }

    /// Whether raw reads are being accepted
    pub fn is_ingesting(&self) -> bool {
        self.ingesting.load(Ordering::SeqCst)
    }

    /// Latest status snapshot
    pub fn status(&self) -> Arc<StatusSnapshot> {
        self.status.current()
    }

    /// Take a status sample immediately instead of waiting for the next tick
    pub fn sample_status(&self) -> Arc<StatusSnapshot> {
        self.status.sample_now()
    }

    /// Subscribe to live events
    pub fn subscribe(&self, name: impl Into<String>) -> mpsc::Receiver<LiveEvent> {
        self.feed.subscribe(name)
    }

    /// Every stored read, sorted by timestamp
    pub fn reads(&self) -> Vec<TagRead> {
        self.store.snapshot()
    }

    /// Stored reads strictly between the bounds, sorted by timestamp
    pub fn reads_between(
        &self,
        from: Option<NaiveDateTime>,
        to: Option<NaiveDateTime>,
    ) -> Vec<TagRead> {
        filter_by_time(self.store.snapshot(), from, to)
    }

    /// Route a marker read (tag 0) straight to store and subscribers, bypassing gating
    pub async fn trigger(&self) -> AppResult<TagRead> {
        let now = self.config.current().settings.clock_zone().now();
        let marker = TagRead::new(Epc::from(0), 0, 0, 0.0, now)?;
        tracing::info!(time = %marker.formatted_timestamp(), "Manual trigger");
        self.router.submit(vec![marker.clone()]).await?;
        Ok(marker)
    }

    /// Wait until every batch routed so far has been stored and broadcast.
    ///
    /// Raw reads still inside an open gating window are not covered.
    pub async fn flush(&self) -> AppResult<()> {
        self.router.flush().await
    }

    /// Stop readers, then every stage in pipeline order.
    ///
    /// The gating window in progress is discarded; batches already handed to the
    /// router or store are finished.
    pub async fn shutdown(&self) -> AppResult<()> {
        tracing::info!("Shutting down pipeline");
        self.ingesting.store(false, Ordering::SeqCst);
        let failures = self.readers.stop_reading().await;

        self.processor.shutdown().await;
        self.router.shutdown().await;
        self.store.shutdown().await;
        self.status.shutdown().await;

        if failures.is_empty() {
            tracing::info!("Pipeline stopped");
            Ok(())
        } else {
            Err(IngestError::ShutdownFailed(failures))
        }
    }
}
