//! Live event fan-out to connected consumers.
//!
//! The dashboard and any other live consumer subscribe here and receive every gated
//! batch, every status snapshot and every sighting notice as they happen.
//!
//! # Architecture
//!
//! ```text
//! Router ──Reads──┐
//! Status ─Status──┼──→ LiveFeed → [dashboard, socket client, ...]
//! Intake ─Sighting┘
//! ```
//!
//! Delivery is best-effort by design of the pipeline: durability is the store's job,
//! so a slow subscriber loses events instead of stalling the router. Each subscriber has
//! a dedicated bounded channel fed with `try_send`; a full channel counts as a drop and a
//! closed one removes the subscriber.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::status::StatusSnapshot;
use crate::tags::TagRead;

/// Something a live consumer is told about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LiveEvent {
    /// One gated batch, in the order the router accepted it
    Reads(Arc<Vec<TagRead>>),
    /// The latest status sample
    Status(Arc<StatusSnapshot>),
    /// A tag seen for the first time, or again after a quiet period
    Sighting(TagRead),
}

/// Delivery counters for one subscriber.
#[derive(Clone, Debug, Default)]
pub struct SubscriberMetricsSnapshot {
    /// Subscriber name (as provided to [`LiveFeed::subscribe`]).
    pub subscriber: String,
    /// Events delivered since the subscriber connected.
    pub total_sent: u64,
    /// Events dropped because the subscriber's channel was full.
    pub total_dropped: u64,
    /// `total_dropped / (total_sent + total_dropped) * 100`.
    pub drop_rate_percent: f64,
    /// Events currently waiting in the subscriber's channel.
    pub channel_occupancy: usize,
    /// Capacity of the subscriber's channel.
    pub channel_capacity: usize,
}

struct SubscriberEntry {
    name: String,
    sender: mpsc::Sender<LiveEvent>,
    total_sent: u64,
    total_dropped: u64,
    window_dropped: u64,
    window_start: Instant,
    drop_warn_emitted: bool,
}

impl SubscriberEntry {
    fn record_drop(&mut self, now: Instant, window: Duration) {
        self.total_dropped = self.total_dropped.saturating_add(1);
        self.window_dropped = self.window_dropped.saturating_add(1);
        if now.duration_since(self.window_start) >= window {
            self.window_start = now;
            self.window_dropped = 1;
            self.drop_warn_emitted = false;
        }
        if !self.drop_warn_emitted {
            tracing::warn!(
                subscriber = %self.name,
                dropped = self.window_dropped,
                "Live subscriber is not keeping up, dropping events"
            );
            self.drop_warn_emitted = true;
        }
    }

    fn snapshot(&self, capacity: usize) -> SubscriberMetricsSnapshot {
        let attempted = self.total_sent + self.total_dropped;
        let drop_rate_percent = if attempted == 0 {
            0.0
        } else {
            (self.total_dropped as f64 / attempted as f64) * 100.0
        };
        SubscriberMetricsSnapshot {
            subscriber: self.name.clone(),
            total_sent: self.total_sent,
            total_dropped: self.total_dropped,
            drop_rate_percent,
            channel_occupancy: capacity.saturating_sub(self.sender.capacity()),
            channel_capacity: capacity,
        }
    }
}

/// Named-subscriber fan-out of [`LiveEvent`]s.
pub struct LiveFeed {
    subscribers: Mutex<Vec<SubscriberEntry>>,
    capacity: usize,
    warn_window: Duration,
}

impl LiveFeed {
    /// Create a feed whose subscribers each buffer up to `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            warn_window: Duration::from_secs(10),
        }
    }

    /// Subscribe with a name used in logs and metrics
    pub fn subscribe(&self, name: impl Into<String>) -> mpsc::Receiver<LiveEvent> {
        let name = name.into();
        let (tx, rx) = mpsc::channel(self.capacity);
        tracing::info!(subscriber = %name, capacity = self.capacity, "Live subscriber registered");
        self.subscribers.lock().push(SubscriberEntry {
            name,
            sender: tx,
            total_sent: 0,
            total_dropped: 0,
            window_dropped: 0,
            window_start: Instant::now(),
            drop_warn_emitted: false,
        });
        rx
    }

    /// Offer `event` to every subscriber without waiting.
    ///
    /// Returns how many subscribers received it.
    pub fn publish(&self, event: LiveEvent) -> usize {
        let mut subscribers = self.subscribers.lock();
        let now = Instant::now();
        let mut delivered = 0;

        subscribers.retain_mut(|entry| match entry.sender.try_send(event.clone()) {
            Ok(()) => {
                entry.total_sent = entry.total_sent.saturating_add(1);
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                entry.record_drop(now, self.warn_window);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::info!(subscriber = %entry.name, "Live subscriber disconnected");
                false
            }
        });

        delivered
    }

    /// Push a gated batch to subscribers
    pub fn publish_reads(&self, batch: Arc<Vec<TagRead>>) -> usize {
        self.publish(LiveEvent::Reads(batch))
    }

    /// Push a status snapshot to subscribers
    pub fn publish_status(&self, snapshot: Arc<StatusSnapshot>) -> usize {
        self.publish(LiveEvent::Status(snapshot))
    }

    /// Number of live subscribers (dead ones are pruned on the next publish)
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Delivery counters for every subscriber
    pub fn metrics(&self) -> Vec<SubscriberMetricsSnapshot> {
        self.subscribers
            .lock()
            .iter()
            .map(|entry| entry.snapshot(self.capacity))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{Epc, TagRead};
    use chrono::{FixedOffset, TimeZone};

    fn batch(n: u128) -> Arc<Vec<TagRead>> {
        let at = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 1, 9, 0, 0)
            .unwrap();
        Arc::new(vec![TagRead::new(Epc::from(n), 1, 1, -50.0, at).unwrap()])
    }

    #[tokio::test]
    async fn every_subscriber_gets_each_batch() {
        let feed = LiveFeed::new(8);
        let mut a = feed.subscribe("dashboard");
        let mut b = feed.subscribe("socket");

        assert_eq!(feed.publish_reads(batch(1)), 2);

        for rx in [&mut a, &mut b] {
            match rx.recv().await {
                Some(LiveEvent::Reads(reads)) => assert_eq!(reads[0].tag_hex(), "1"),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn full_subscriber_drops_without_blocking() {
        let feed = LiveFeed::new(1);
        let mut _slow = feed.subscribe("slow");

        feed.publish_reads(batch(1));
        feed.publish_reads(batch(2));
        feed.publish_reads(batch(3));

        let metrics = feed.metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].total_sent, 1);
        assert_eq!(metrics[0].total_dropped, 2);
        assert_eq!(metrics[0].channel_occupancy, 1);
        assert!((metrics[0].drop_rate_percent - 66.666).abs() < 0.1);
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let feed = LiveFeed::new(4);
        let rx = feed.subscribe("gone");
        let _kept = feed.subscribe("kept");
        assert_eq!(feed.subscriber_count(), 2);

        drop(rx);
        assert_eq!(feed.publish_reads(batch(1)), 1);
        assert_eq!(feed.subscriber_count(), 1);
        assert_eq!(feed.metrics()[0].subscriber, "kept");
    }

    #[test]
    fn publishing_with_no_subscribers_is_fine() {
        let feed = LiveFeed::new(4);
        assert_eq!(feed.publish_reads(batch(1)), 0);
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let json = serde_json::to_value(LiveEvent::Reads(batch(255))).unwrap();
        assert_eq!(json["type"], "reads");
        assert_eq!(json["data"][0]["chip"], "255");
    }
}
