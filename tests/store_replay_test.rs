//! Integration tests for durable store replay.

use chrono::{FixedOffset, TimeZone};
use rfid_ingest::config::StorageSettings;
use rfid_ingest::tags::store::{batch_path, encode_batch};
use rfid_ingest::tags::{Epc, TagRead, TagStore};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

fn storage(root: &Path) -> StorageSettings {
    StorageSettings {
        path: root.to_path_buf(),
        retention_days: 180,
    }
}

fn read(tag: u128, reader: u32, millis: i64) -> TagRead {
    let at = FixedOffset::east_opt(2 * 3600)
        .unwrap()
        .with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
        .unwrap()
        + chrono::Duration::milliseconds(millis);
    TagRead::new(Epc::from(tag), reader, 1, -60.0 + (tag % 20) as f64, at).unwrap()
}

fn as_lines(reads: &[TagRead]) -> HashSet<String> {
    reads.iter().map(TagRead::to_line).collect()
}

#[tokio::test]
async fn test_replay_equals_union_of_appended_batches() {
    let dir = tempfile::tempdir().unwrap();
    let mut appended = Vec::new();

    let store = TagStore::open(&storage(dir.path()), 16).await;
    for batch_no in 0..25u128 {
        // Arrival order deliberately disagrees with timestamp order
        let batch: Vec<TagRead> = (0..4u128)
            .map(|i| read(batch_no * 10 + i, 1 + (i % 2) as u32, 100_000 - (batch_no * 10 + i) as i64))
            .collect();
        appended.extend(batch.clone());
        store.append(Arc::new(batch)).await.unwrap();
    }
    store.shutdown().await;

    let reopened = TagStore::open(&storage(dir.path()), 16).await;
    let replayed = reopened.snapshot();
    assert_eq!(replayed.len(), appended.len());
    assert_eq!(as_lines(&replayed), as_lines(&appended));
    assert!(replayed.windows(2).all(|w| w[0].timestamp() <= w[1].timestamp()));
    reopened.shutdown().await;
}

#[tokio::test]
async fn test_truncated_batch_does_not_hide_earlier_history() {
    let dir = tempfile::tempdir().unwrap();
    let earlier = vec![read(1, 1, 0), read(2, 1, 10)];
    let stamp = chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
        .unwrap()
        .and_hms_milli_opt(12, 0, 0, 0)
        .unwrap();

    let first = batch_path(dir.path(), stamp);
    std::fs::create_dir_all(first.parent().unwrap()).unwrap();
    std::fs::write(&first, encode_batch(&earlier)).unwrap();

    // A batch cut off mid-line by a power loss
    let torn = batch_path(dir.path(), stamp + chrono::Duration::milliseconds(5));
    let full = encode_batch(&[read(3, 1, 20), read(4, 1, 30)]);
    std::fs::write(&torn, &full[..full.len() - 20]).unwrap();

    let store = TagStore::open(&storage(dir.path()), 4).await;
    let tags: Vec<Epc> = store.snapshot().iter().map(TagRead::epc).collect();
    assert_eq!(tags, vec![Epc::from(1), Epc::from(2), Epc::from(3)]);
    assert_eq!(store.replay_report().skipped_lines, 1);
    assert_eq!(store.replay_report().files, 2);
    store.shutdown().await;
}

#[tokio::test]
async fn test_batch_files_follow_the_hourly_layout() {
    let dir = tempfile::tempdir().unwrap();
    let store = TagStore::open(&storage(dir.path()), 4).await;
    store.append(Arc::new(vec![read(1, 1, 0)])).await.unwrap();
    store.flush().await.unwrap();
    store.shutdown().await;

    let mut depth = 0;
    let mut current = dir.path().to_path_buf();
    loop {
        let entries: Vec<_> = std::fs::read_dir(&current)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1);
        current = entries[0].clone();
        if current.is_file() {
            break;
        }
        depth += 1;
    }
    // YYYY / MM / DD / HH / file
    assert_eq!(depth, 4);
    let name = current.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.ends_with(".dat"));
    assert_eq!(name.len(), "HH-MM-SS-mmm.dat".len());
}
