//! Status aggregation.
//!
//! Once per interval the aggregator drains the raw-read sample ring, works out the
//! strongest signal per reader antenna, merges in the accepted-read counters updated by
//! the gating processor and publishes a fresh [`StatusSnapshot`]. The snapshot is kept
//! as the current status and pushed to live subscribers.
//!
//! Sampling never blocks a reader: the ring holds a fixed number of raw reads and
//! silently drops the oldest when full.

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ConfigHandle;
use crate::feed::LiveFeed;
use crate::readers::{ReaderSet, ReaderStatus};
use crate::tags::TagRead;

/// Signal summary of one antenna port over one interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortStat {
    /// Port status reported by the reader, if the port is known to it
    pub status: Option<String>,
    /// Strongest signal seen, or the no-signal floor
    pub read_strength: f64,
}

/// Everything the unit reports about itself at one sampling tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    /// Whether ingestion is active
    pub reading: bool,
    /// Accepted reads since the last reset
    pub total_reads: u64,
    /// Decimal id of the last accepted tag
    pub last_chip_read: Option<String>,
    /// Wall-clock time of the last accepted tag
    pub last_chip_read_time: Option<String>,
    /// The last accepted read itself
    #[serde(skip)]
    pub last_read: Option<TagRead>,
    /// Identifier of this unit
    #[serde(rename = "unitID")]
    pub unit_id: String,
    /// Every configured reader
    pub readers: Vec<ReaderStatus>,
    /// Per reader, per antenna signal summary
    pub reader_port_stats: BTreeMap<u32, BTreeMap<u16, PortStat>>,
    /// Raw reads sampled during the interval
    pub raw_reads_per_interval: usize,
    /// Raw reads dropped from the sample ring since the previous tick
    pub dropped_samples: u64,
    /// Sample time
    pub timestamp: DateTime<Utc>,
    /// Sample time on the unit's clock
    pub local_time: NaiveDateTime,
    /// Label of the unit's zone
    pub timezone: String,
}

impl StatusSnapshot {
    /// Snapshot reported before the first tick
    pub fn idle(unit_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            reading: false,
            total_reads: 0,
            last_chip_read: None,
            last_chip_read_time: None,
            last_read: None,
            unit_id: unit_id.into(),
            readers: Vec::new(),
            reader_port_stats: BTreeMap::new(),
            raw_reads_per_interval: 0,
            dropped_samples: 0,
            timestamp: now,
            local_time: now.naive_utc(),
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Default)]
struct Accepted {
    total: u64,
    last_read: Option<TagRead>,
}

/// Compute the per-port summary for one interval.
///
/// Every port a reader reports starts at `floor`; sampled reads raise it, and reads on
/// ports no reader reports are added as they appear.
pub fn port_stats(
    readers: &[ReaderStatus],
    samples: &[TagRead],
    floor: f64,
) -> BTreeMap<u32, BTreeMap<u16, PortStat>> {
    let mut stats: BTreeMap<u32, BTreeMap<u16, PortStat>> = BTreeMap::new();

    for reader in readers {
        let ports = stats.entry(reader.id).or_default();
        for (port, status) in &reader.port_status {
            ports.insert(
                *port,
                PortStat {
                    status: Some(status.clone()),
                    read_strength: floor,
                },
            );
        }
    }

    for read in samples {
        let stat = stats
            .entry(read.reader_id())
            .or_default()
            .entry(read.antenna())
            .or_insert(PortStat {
                status: None,
                read_strength: read.rssi(),
            });
        if read.rssi() > stat.read_strength {
            stat.read_strength = read.rssi();
        }
    }

    stats
}

/// Periodic status sampler.
pub struct StatusAggregator {
    config: ConfigHandle,
    readers: Arc<ReaderSet>,
    feed: Arc<LiveFeed>,
    ingesting: Arc<AtomicBool>,
    samples: Mutex<VecDeque<TagRead>>,
    sample_capacity: usize,
    dropped: AtomicU64,
    accepted: Mutex<Accepted>,
    current: RwLock<Arc<StatusSnapshot>>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StatusAggregator {
    /// Create an aggregator; nothing is sampled until [`StatusAggregator::start`]
    pub fn new(
        config: ConfigHandle,
        readers: Arc<ReaderSet>,
        feed: Arc<LiveFeed>,
        ingesting: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let current = config.current();
        let sample_capacity = current.settings.status.sample_capacity.max(1);
        let idle = StatusSnapshot::idle(current.settings.application.unit_id.clone());

        Arc::new(Self {
            config,
            readers,
            feed,
            ingesting,
            samples: Mutex::new(VecDeque::with_capacity(sample_capacity.min(4096))),
            sample_capacity,
            dropped: AtomicU64::new(0),
            accepted: Mutex::new(Accepted::default()),
            current: RwLock::new(Arc::new(idle)),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }

    /// Start the ticker.
    ///
    /// The first tick lands on the next wall-clock second boundary; later ticks follow
    /// every `status.interval_ms`.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let interval_ms = self.config.current().settings.status.interval_ms.max(1);
        let period = Duration::from_millis(interval_ms);
        let into_second = u64::from(Utc::now().timestamp_subsec_millis() % 1000);
        let first_tick = Instant::now() + Duration::from_millis(1000 - into_second);

        let aggregator = Arc::clone(self);
        let cancel = self.cancel.clone();
        *worker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first_tick, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(interval_ms, "Status ticker started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        aggregator.sample_now();
                    }
                }
            }
            tracing::info!("Exiting status ticker");
        }));
    }

    /// Offer one raw read to the sample ring, dropping the oldest when full
    pub fn sample(&self, read: TagRead) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.sample_capacity {
            samples.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        samples.push_back(read);
    }

    /// Count a gated window's survivors and remember its latest read
    pub fn record_accepted(&self, count: u64, last_read: Option<TagRead>) {
        let mut accepted = self.accepted.lock();
        accepted.total = accepted.total.saturating_add(count);
        if last_read.is_some() {
            accepted.last_read = last_read;
        }
    }

    /// Zero the accepted-read counter and forget the last tag
    pub fn reset(&self) {
        *self.accepted.lock() = Accepted::default();
        tracing::debug!("Status counters reset");
    }

    /// Latest published snapshot
    pub fn current(&self) -> Arc<StatusSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Take one sample now, publish it and return it.
    pub fn sample_now(&self) -> Arc<StatusSnapshot> {
        let samples: Vec<TagRead> = self.samples.lock().drain(..).collect();
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        let (total_reads, last_read) = {
            let accepted = self.accepted.lock();
            (accepted.total, accepted.last_read.clone())
        };

        let config = self.config.current();
        let settings = &config.settings;
        let zone = settings.clock_zone();
        let readers = self.readers.statuses();
        let reader_port_stats = port_stats(&readers, &samples, settings.status.no_signal_floor_dbm);
        let timestamp = Utc::now();

        let snapshot = Arc::new(StatusSnapshot {
            reading: self.ingesting.load(Ordering::SeqCst),
            total_reads,
            last_chip_read: last_read.as_ref().map(TagRead::tag_decimal),
            last_chip_read_time: last_read.as_ref().map(TagRead::formatted_timestamp),
            last_read,
            unit_id: settings.application.unit_id.clone(),
            readers,
            reader_port_stats,
            raw_reads_per_interval: samples.len(),
            dropped_samples: dropped,
            timestamp,
            local_time: zone.now().naive_local(),
            timezone: zone.label(),
        });

        if dropped > 0 {
            tracing::debug!(dropped, "Status sample ring overflowed");
        }
        tracing::trace!(raw = samples.len(), total_reads, "Status sample");

        *self.current.write() = Arc::clone(&snapshot);
        self.feed.publish_status(Arc::clone(&snapshot));
        snapshot
    }

    /// Stop the ticker
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "Status ticker task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::feed::LiveEvent;
    use crate::tags::gating::{collapse, GatingStyle};
    use crate::tags::Epc;
    use chrono::{FixedOffset, TimeZone};

    fn read(tag: u128, reader: u32, antenna: u16, rssi: f64, second: u32) -> TagRead {
        let at = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 1, 9, 0, second)
            .unwrap();
        TagRead::new(Epc::from(tag), reader, antenna, rssi, at).unwrap()
    }

    fn reader_status(id: u32, ports: &[u16]) -> ReaderStatus {
        ReaderStatus {
            id,
            name: format!("Reader {id}"),
            kind: "SIMULATED".into(),
            reading: true,
            connected: true,
            status: "Reading".into(),
            port_status: ports.iter().map(|p| (*p, "Connected".to_string())).collect(),
        }
    }

    fn aggregator(capacity: usize) -> (Arc<StatusAggregator>, Arc<LiveFeed>) {
        let mut settings = Settings::default();
        settings.status.sample_capacity = capacity;
        settings.application.unit_id = "unit-7".into();
        let feed = Arc::new(LiveFeed::new(8));
        let aggregator = StatusAggregator::new(
            ConfigHandle::new(settings),
            Arc::new(ReaderSet::default()),
            Arc::clone(&feed),
            Arc::new(AtomicBool::new(true)),
        );
        (aggregator, feed)
    }

    #[test]
    fn known_ports_default_to_floor_and_take_peaks() {
        let readers = vec![reader_status(1, &[1, 2])];
        let samples = vec![
            read(1, 1, 1, -60.0, 0),
            read(2, 1, 1, -42.0, 1),
            read(3, 2, 3, -55.0, 2),
        ];
        let stats = port_stats(&readers, &samples, -100.0);

        assert_eq!(stats[&1][&1].read_strength, -42.0);
        assert_eq!(stats[&1][&2].read_strength, -100.0);
        assert_eq!(stats[&1][&2].status.as_deref(), Some("Connected"));
        assert_eq!(stats[&2][&3].read_strength, -55.0);
        assert_eq!(stats[&2][&3].status, None);
    }

    #[test]
    fn reset_then_one_batch_reports_survivor_count_and_latest() {
        let (aggregator, _feed) = aggregator(100);
        aggregator.record_accepted(12, Some(read(99, 1, 1, -40.0, 0)));
        aggregator.reset();

        let window = collapse(
            (0..5u32).map(|n| read(u128::from(n) + 1, 1, 1, -50.0, n * 2)),
            GatingStyle::Box,
        );
        assert_eq!(window.survivors.len(), 5);
        aggregator.record_accepted(window.survivors.len() as u64, window.last_read.clone());

        let snapshot = aggregator.sample_now();
        assert_eq!(snapshot.total_reads, 5);
        assert_eq!(snapshot.last_read, window.last_read);
        assert_eq!(snapshot.last_chip_read.as_deref(), Some("5"));
        assert_eq!(snapshot.unit_id, "unit-7");
    }

    #[test]
    fn ring_drops_oldest_when_full() {
        let (aggregator, _feed) = aggregator(3);
        for n in 0..5u32 {
            aggregator.sample(read(u128::from(n), 1, 1, -80.0 + f64::from(n), n));
        }
        let snapshot = aggregator.sample_now();
        assert_eq!(snapshot.raw_reads_per_interval, 3);
        assert_eq!(snapshot.dropped_samples, 2);
        assert_eq!(snapshot.reader_port_stats[&1][&1].read_strength, -76.0);

        // The ring was drained by the previous sample
        let next = aggregator.sample_now();
        assert_eq!(next.raw_reads_per_interval, 0);
        assert_eq!(next.dropped_samples, 0);
    }

    #[tokio::test]
    async fn samples_become_current_and_reach_subscribers() {
        let (aggregator, feed) = aggregator(10);
        let mut rx = feed.subscribe("dashboard");
        assert!(!aggregator.current().reading);

        let published = aggregator.sample_now();
        assert!(published.reading);
        assert_eq!(aggregator.current(), published);
        match rx.recv().await {
            Some(LiveEvent::Status(snapshot)) => assert_eq!(snapshot, published),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn ticker_publishes_and_stops() {
        let mut settings = Settings::default();
        settings.status.interval_ms = 20;
        let feed = Arc::new(LiveFeed::new(64));
        let mut rx = feed.subscribe("test");
        let aggregator = StatusAggregator::new(
            ConfigHandle::new(settings),
            Arc::new(ReaderSet::default()),
            Arc::clone(&feed),
            Arc::new(AtomicBool::new(false)),
        );
        aggregator.start();

        let first = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await;
        assert!(matches!(first, Ok(Some(LiveEvent::Status(_)))));
        aggregator.shutdown().await;
    }

    #[test]
    fn snapshot_serializes_with_dashboard_keys() {
        let (aggregator, _feed) = aggregator(10);
        aggregator.record_accepted(1, Some(read(4660, 2, 1, -41.5, 0)));
        let json = serde_json::to_value(&*aggregator.sample_now()).unwrap();
        assert_eq!(json["totalReads"], 1);
        assert_eq!(json["lastChipRead"], "4660");
        assert_eq!(json["unitID"], "unit-7");
        assert!(json.get("lastRead").is_none());
    }
}
