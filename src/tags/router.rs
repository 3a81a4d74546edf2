//! Distribution router.
//!
//! Decouples the gating processor from persistence and live fan-out. Batches are queued
//! on a bounded channel and a single worker hands each one, in submission order, first
//! to the store and then to the live feed.
//!
//! ```text
//! processor ──submit──→ [queue] ──→ worker ──→ TagStore::append
//!                                          └─→ LiveFeed::publish_reads
//! ```
//!
//! The two handoffs are independent: a store that has gone away does not stop the
//! broadcast, and a missing subscriber does not affect the store. A full queue makes
//! `submit` wait rather than lose a batch.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::read::TagRead;
use super::store::TagStore;
use crate::error::{AppResult, IngestError};
use crate::feed::LiveFeed;

enum RouterCommand {
    Batch(Arc<Vec<TagRead>>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the routing worker.
pub struct TagRouter {
    tx: mpsc::Sender<RouterCommand>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TagRouter {
    /// Start the worker
    pub fn spawn(store: Arc<TagStore>, feed: Arc<LiveFeed>, capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_router(rx, store, feed, cancel.clone()));

        Arc::new(Self {
            tx,
            cancel,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue one batch; waits while the queue is full
    pub async fn submit(&self, batch: Vec<TagRead>) -> AppResult<()> {
        self.tx
            .send(RouterCommand::Batch(Arc::new(batch)))
            .await
            .map_err(|_| IngestError::ChannelClosed("router"))
    }

    /// Wait until every batch submitted before this call is stored and broadcast
    pub async fn flush(&self) -> AppResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(RouterCommand::Flush(done_tx))
            .await
            .map_err(|_| IngestError::ChannelClosed("router"))?;
        done_rx
            .await
            .map_err(|_| IngestError::ChannelClosed("router"))
    }

    /// Stop after every queued batch has been handed on
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "Router task failed");
            }
        }
    }
}

async fn run_router(
    mut rx: mpsc::Receiver<RouterCommand>,
    store: Arc<TagStore>,
    feed: Arc<LiveFeed>,
    cancel: CancellationToken,
) {
    tracing::info!("Tag router started");
    loop {
        let command = tokio::select! {
            biased;
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
            _ = cancel.cancelled() => {
                while let Ok(command) = rx.try_recv() {
                    route(&store, &feed, command).await;
                }
                break;
            }
        };
        route(&store, &feed, command).await;
    }
    tracing::info!("Exiting tag router");
}

async fn route(store: &TagStore, feed: &LiveFeed, command: RouterCommand) {
    match command {
        RouterCommand::Batch(batch) => {
            tracing::debug!(count = batch.len(), "Routing batch");
            if let Err(err) = store.append(Arc::clone(&batch)).await {
                tracing::error!(count = batch.len(), error = %err, "Unable to hand batch to store");
            }
            feed.publish_reads(batch);
        }
        RouterCommand::Flush(done) => {
            if let Err(err) = store.flush().await {
                tracing::warn!(error = %err, "Store flush failed");
            }
            let _ = done.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageSettings;
    use crate::feed::LiveEvent;
    use crate::tags::Epc;
    use chrono::{FixedOffset, TimeZone};
    use std::time::Duration;

    fn batch(first: u128, len: u128) -> Vec<TagRead> {
        let at = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 1, 9, 0, 0)
            .unwrap();
        (first..first + len)
            .map(|tag| TagRead::new(Epc::from(tag), 1, 1, -50.0, at).unwrap())
            .collect()
    }

    async fn store(root: &std::path::Path) -> Arc<TagStore> {
        TagStore::open(
            &StorageSettings {
                path: root.to_path_buf(),
                retention_days: 1,
            },
            4,
        )
        .await
    }

    #[tokio::test]
    async fn batches_reach_store_and_feed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let feed = Arc::new(LiveFeed::new(16));
        let mut rx = feed.subscribe("test");
        let router = TagRouter::spawn(Arc::clone(&store), Arc::clone(&feed), 2);

        for n in 0..6u128 {
            router.submit(batch(n * 10, 2)).await.unwrap();
        }
        router.flush().await.unwrap();

        assert_eq!(store.len(), 12);
        assert_eq!(store.stats().files_written, 6);
        for n in 0..6u128 {
            match rx.recv().await {
                Some(LiveEvent::Reads(reads)) => assert_eq!(reads[0].epc(), Epc::from(n * 10)),
                other => panic!("unexpected event: {:?}", other),
            }
        }

        router.shutdown().await;
        store.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_queued_batches() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let feed = Arc::new(LiveFeed::new(16));
        let router = TagRouter::spawn(Arc::clone(&store), feed, 8);

        for n in 0..4u128 {
            router.submit(batch(n, 1)).await.unwrap();
        }
        router.shutdown().await;
        store.flush().await.unwrap();
        assert_eq!(store.len(), 4);

        assert!(matches!(
            router.submit(batch(9, 1)).await,
            Err(IngestError::ChannelClosed("router"))
        ));
        store.shutdown().await;
    }

    #[tokio::test]
    async fn broadcast_continues_when_store_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        store.shutdown().await;

        let feed = Arc::new(LiveFeed::new(4));
        let mut rx = feed.subscribe("test");
        let router = TagRouter::spawn(store, Arc::clone(&feed), 4);
        router.submit(batch(1, 3)).await.unwrap();
        router.flush().await.unwrap();

        assert!(matches!(rx.recv().await, Some(LiveEvent::Reads(reads)) if reads.len() == 3));
        router.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_makes_submit_wait_without_losing_batches() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let feed = Arc::new(LiveFeed::new(16));
        let mut rx = feed.subscribe("test");

        // Worker not running yet, so nothing leaves the single-slot queue
        let (tx, queue) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let router = Arc::new(TagRouter {
            tx,
            cancel: cancel.clone(),
            worker: Mutex::new(None),
        });

        router.submit(batch(0, 1)).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(50), router.submit(batch(5, 1)))
            .await
            .is_err());

        let waiting = tokio::spawn({
            let router = Arc::clone(&router);
            async move { router.submit(batch(10, 1)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        *router.worker.lock() = Some(tokio::spawn(run_router(
            queue,
            Arc::clone(&store),
            Arc::clone(&feed),
            cancel,
        )));
        waiting.await.unwrap().unwrap();
        router.flush().await.unwrap();

        assert_eq!(store.len(), 2);
        for tag in [0u128, 10] {
            match rx.recv().await {
                Some(LiveEvent::Reads(reads)) => assert_eq!(reads[0].epc(), Epc::from(tag)),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        router.shutdown().await;
        store.shutdown().await;
    }
}
