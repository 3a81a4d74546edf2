//! Entry point for raw reads.
//!
//! Readers hold a cloned [`ReadIntake`] and call [`ReadIntake::submit`] for every
//! detection. While ingestion is stopped reads are dropped here. Otherwise each read is
//! offered to the status sampler, checked for a sighting notice and queued for the
//! gating processor.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::processor::GatingProcessor;
use super::read::TagRead;
use super::sighting::SightingTracker;
use crate::error::AppResult;
use crate::feed::{LiveEvent, LiveFeed};
use crate::status::StatusAggregator;

/// Cloneable submit handle shared by every reader.
#[derive(Clone)]
pub struct ReadIntake {
    ingesting: Arc<AtomicBool>,
    status: Arc<StatusAggregator>,
    processor: Arc<GatingProcessor>,
    sightings: Arc<Mutex<SightingTracker>>,
    feed: Arc<LiveFeed>,
}

impl ReadIntake {
    /// Wire an intake to the pipeline stages
    pub fn new(
        ingesting: Arc<AtomicBool>,
        status: Arc<StatusAggregator>,
        processor: Arc<GatingProcessor>,
        feed: Arc<LiveFeed>,
    ) -> Self {
        Self {
            ingesting,
            status,
            processor,
            sightings: Arc::new(Mutex::new(SightingTracker::default())),
            feed,
        }
    }

    /// Whether reads are currently accepted
    pub fn is_ingesting(&self) -> bool {
        self.ingesting.load(Ordering::SeqCst)
    }

    /// Accept one raw read.
    ///
    /// Returns once the read is queued for gating; waits only when that queue is full.
    pub async fn submit(&self, read: TagRead) -> AppResult<()> {
        if !self.is_ingesting() {
            tracing::trace!(tag = %read.epc(), reader = read.reader_id(), "Not ingesting, dropping read");
            return Ok(());
        }

        tracing::trace!(
            tag = %read.tag_decimal(),
            reader = read.reader_id(),
            antenna = read.antenna(),
            rssi = read.rssi(),
            "Raw read"
        );
        self.status.sample(read.clone());

        let sighted = self.sightings.lock().observe(&read);
        if sighted {
            self.feed.publish(LiveEvent::Sighting(read.clone()));
        }

        self.processor.submit(read).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigHandle, Settings};
    use crate::readers::ReaderSet;
    use crate::tags::router::TagRouter;
    use crate::tags::store::TagStore;
    use crate::tags::Epc;
    use chrono::{FixedOffset, TimeZone};

    fn read(tag: u128, millis: i64) -> TagRead {
        let at = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 1, 9, 0, 0)
            .unwrap()
            + chrono::Duration::milliseconds(millis);
        TagRead::new(Epc::from(tag), 1, 1, -50.0, at).unwrap()
    }

    #[tokio::test]
    async fn stopped_intake_drops_and_running_intake_tees() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.storage.path = dir.path().to_path_buf();
        settings.reader.gating = Some(0.02);
        let config = ConfigHandle::new(settings);

        let ingesting = Arc::new(AtomicBool::new(false));
        let feed = Arc::new(LiveFeed::new(16));
        let mut events = feed.subscribe("test");
        let store = TagStore::open(&config.current().settings.storage, 4).await;
        let router = TagRouter::spawn(store, Arc::clone(&feed), 4);
        let status = StatusAggregator::new(
            config.clone(),
            Arc::new(ReaderSet::default()),
            Arc::clone(&feed),
            Arc::clone(&ingesting),
        );
        let processor = GatingProcessor::new(config, router, Arc::clone(&status), 16);
        let intake = ReadIntake::new(Arc::clone(&ingesting), Arc::clone(&status), Arc::clone(&processor), feed);

        intake.submit(read(1, 0)).await.unwrap();
        assert!(!processor.is_started());
        assert!(events.try_recv().is_err());

        ingesting.store(true, Ordering::SeqCst);
        intake.submit(read(1, 0)).await.unwrap();
        intake.submit(read(1, 100)).await.unwrap();
        assert!(processor.is_started());

        // One sighting for the two reads of tag 1
        assert!(matches!(events.recv().await, Some(LiveEvent::Sighting(r)) if r.epc() == Epc::from(1)));
        assert!(matches!(events.recv().await, Some(LiveEvent::Reads(batch)) if batch.len() == 1));
        assert_eq!(status.sample_now().raw_reads_per_interval, 2);
        processor.shutdown().await;
    }
}
