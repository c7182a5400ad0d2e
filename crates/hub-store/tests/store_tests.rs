//! Event store tests
//!
//! Tests for:
//! - Append ordering across reopen
//! - Torn tail and checksum detection
//! - Restartable replay by sequence and timestamp
//! - Snapshot-bounded compaction and archiving
//! - Durable subscriptions

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;

use hub_common::Event;
use hub_config::StoreConfig;
use hub_store::{
    CheckpointStore, EventStore, InMemoryCheckpointStore, ReplayFrom, StoreError, SubscriptionSpec,
};

fn config(dir: &std::path::Path) -> StoreConfig {
    StoreConfig {
        data_dir: dir.to_path_buf(),
        ..Default::default()
    }
}

fn event(source: &str, event_type: &str, n: u64) -> Event {
    Event::new(source, event_type, json!({ "n": n }))
}

async fn append_n(store: &EventStore, n: u64) {
    for i in 0..n {
        store.append(event("character-service", "character.updated", i)).await.unwrap();
    }
}

#[tokio::test]
async fn test_replay_after_reopen_preserves_append_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::open(&config(dir.path())).unwrap();

    let mut expected = Vec::new();
    for i in 0..20 {
        let e = event("character-service", "character.updated", i);
        expected.push(e.id.clone());
        store.append(e).await.unwrap();
    }
    let batch: Vec<Event> = (20..25).map(|i| event("character-service", "character.updated", i)).collect();
    expected.extend(batch.iter().map(|e| e.id.clone()));
    let stamped = store.append_batch(batch).await.unwrap();
    assert_eq!(stamped.first().unwrap().sequence_number, 21);
    assert_eq!(stamped.last().unwrap().sequence_number, 25);

    // Simulate a crash: no close, just drop every handle
    drop(store);

    let reopened = EventStore::open(&config(dir.path())).unwrap();
    assert_eq!(reopened.head(), 25);

    let replayed: Vec<Event> = reopened
        .replay(ReplayFrom::Beginning)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    let ids: Vec<String> = replayed.iter().map(|e| e.id.clone()).collect();
    assert_eq!(ids, expected);
    for (i, e) in replayed.iter().enumerate() {
        assert_eq!(e.sequence_number, i as u64 + 1);
    }

    assert_eq!(reopened.append(event("s", "t", 0)).await.unwrap(), 26);
}

#[tokio::test]
async fn test_torn_tail_requires_opt_in_repair() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let store = EventStore::open(&cfg).unwrap();
    append_n(&store, 3).await;
    store.close().await;
    drop(store);

    let mut file = std::fs::OpenOptions::new().append(true).open(cfg.log_path()).unwrap();
    file.write_all(b"3f2a partial reco").unwrap();
    drop(file);

    let err = EventStore::open(&cfg).err().unwrap();
    assert!(matches!(err, StoreError::Corrupted { .. }));

    let repair = StoreConfig {
        repair_torn_tail: true,
        ..cfg.clone()
    };
    let store = EventStore::open(&repair).unwrap();
    assert_eq!(store.head(), 3);
    assert_eq!(store.append(event("s", "t", 4)).await.unwrap(), 4);
    assert_eq!(store.read_range(1, 4).unwrap().len(), 4);
}

#[tokio::test]
async fn test_checksum_mismatch_halts_open() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let store = EventStore::open(&cfg).unwrap();
    append_n(&store, 3).await;
    store.close().await;
    drop(store);

    let raw = std::fs::read_to_string(cfg.log_path()).unwrap();
    let tampered = raw.replacen("\"n\":0", "\"n\":9", 1);
    assert_ne!(raw, tampered);
    std::fs::write(cfg.log_path(), tampered).unwrap();

    match EventStore::open(&cfg) {
        Err(StoreError::Corrupted { offset, reason }) => {
            assert_eq!(offset, 0);
            assert!(reason.contains("checksum"));
        }
        other => panic!("expected corruption, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_replay_is_restartable_from_position() {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::open(&config(dir.path())).unwrap();
    append_n(&store, 10).await;

    let mut replay = store.replay(ReplayFrom::Beginning).unwrap();
    let first: Vec<u64> = replay
        .by_ref()
        .take(4)
        .map(|e| e.unwrap().sequence_number)
        .collect();
    assert_eq!(first, vec![1, 2, 3, 4]);
    let position = replay.position();
    drop(replay);

    let rest: Vec<u64> = store
        .replay(ReplayFrom::Sequence(position + 1))
        .unwrap()
        .map(|e| e.unwrap().sequence_number)
        .collect();
    assert_eq!(rest, (5..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_replay_bounded_by_head_at_creation() {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::open(&config(dir.path())).unwrap();
    append_n(&store, 3).await;

    let replay = store.replay(ReplayFrom::Beginning).unwrap();
    append_n(&store, 2).await;

    assert_eq!(replay.count(), 3);
    assert_eq!(store.replay(ReplayFrom::Beginning).unwrap().count(), 5);
}

#[tokio::test]
async fn test_replay_from_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::open(&config(dir.path())).unwrap();
    append_n(&store, 3).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    let cutoff = chrono::Utc::now();
    tokio::time::sleep(Duration::from_millis(20)).await;
    append_n(&store, 2).await;

    let seqs: Vec<u64> = store
        .replay(ReplayFrom::Timestamp(cutoff))
        .unwrap()
        .map(|e| e.unwrap().sequence_number)
        .collect();
    assert_eq!(seqs, vec![4, 5]);
}

#[tokio::test]
async fn test_compaction_respects_snapshot_and_archives() {
    let dir = tempfile::tempdir().unwrap();
    let archive_dir = dir.path().join("archive");
    let cfg = StoreConfig {
        retention_secs: 0,
        archive_dir: Some(archive_dir.clone()),
        ..config(dir.path())
    };
    let store = EventStore::open(&cfg).unwrap();
    append_n(&store, 10).await;

    // Nothing is covered by a snapshot yet
    let report = store.compact(100).await.unwrap();
    assert_eq!(report.removed_events, 0);

    store.snapshot(6, json!({ "applied": 6 })).await.unwrap();
    let report = store.compact(100).await.unwrap();
    assert_eq!(report.removed_events, 6);
    assert_eq!(report.first_sequence, Some(7));
    assert_eq!(store.first_available(), 7);

    assert!(matches!(
        store.replay(ReplayFrom::Sequence(3)),
        Err(StoreError::Compacted { requested: 3, first_available: 7 })
    ));
    let archived = std::fs::read_to_string(archive_dir.join("hub-1-6.jsonl")).unwrap();
    assert_eq!(archived.lines().count(), 6);

    store.close().await;
    drop(store);

    let reopened = EventStore::open(&cfg).unwrap();
    assert_eq!(reopened.head(), 10);
    assert_eq!(reopened.latest_snapshot().unwrap().sequence, 6);
    let seqs: Vec<u64> = reopened
        .replay(ReplayFrom::Beginning)
        .unwrap()
        .map(|e| e.unwrap().sequence_number)
        .collect();
    assert_eq!(seqs, (7..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_appends_after_compaction_land_in_new_log() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StoreConfig {
        retention_secs: 0,
        ..config(dir.path())
    };
    let store = EventStore::open(&cfg).unwrap();
    append_n(&store, 6).await;
    store.snapshot(4, json!({})).await.unwrap();
    store.compact(u64::MAX).await.unwrap();
    assert!(!cfg.log_path().with_extension("wal.compact").exists());

    append_n(&store, 2).await;
    assert_eq!(store.head(), 8);
    let seqs: Vec<u64> = store.read_range(5, 8).unwrap().iter().map(|e| e.sequence_number).collect();
    assert_eq!(seqs, vec![5, 6, 7, 8]);
    assert!(store.is_writable());
    store.close().await;
    drop(store);

    let reopened = EventStore::open(&cfg).unwrap();
    let seqs: Vec<u64> = reopened
        .replay(ReplayFrom::Beginning)
        .unwrap()
        .map(|e| e.unwrap().sequence_number)
        .collect();
    assert_eq!(seqs, (5..=8).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_retention_blocks_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::open(&config(dir.path())).unwrap();
    append_n(&store, 4).await;
    store.snapshot(4, json!({})).await.unwrap();

    let report = store.compact(u64::MAX).await.unwrap();
    assert_eq!(report.removed_records, 0);
    assert_eq!(store.first_available(), 1);
}

#[tokio::test]
async fn test_sequence_not_reused_after_full_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StoreConfig {
        retention_secs: 0,
        ..config(dir.path())
    };
    let store = EventStore::open(&cfg).unwrap();
    append_n(&store, 5).await;
    store.snapshot(5, json!({})).await.unwrap();
    store.compact(u64::MAX).await.unwrap();
    store.close().await;
    drop(store);

    let reopened = EventStore::open(&cfg).unwrap();
    assert_eq!(reopened.head(), 5);
    assert_eq!(reopened.append(event("s", "t", 6)).await.unwrap(), 6);
}

#[tokio::test]
async fn test_snapshot_beyond_head_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::open(&config(dir.path())).unwrap();
    append_n(&store, 2).await;
    assert!(matches!(
        store.snapshot(3, json!({})).await,
        Err(StoreError::InvalidSnapshot(_))
    ));
}

#[tokio::test]
async fn test_live_notification_only_after_durable() {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::open(&config(dir.path())).unwrap();
    let mut live = store.live();

    store.append(event("s", "character.created", 1)).await.unwrap();
    let notified = live.recv().await.unwrap();
    assert!(notified.sequence_number <= store.head());
    assert_eq!(store.read_range(notified.sequence_number, notified.sequence_number).unwrap().len(), 1);
}

#[tokio::test]
async fn test_durable_subscription_resumes_after_ack() {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::open(&config(dir.path())).unwrap();
    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());

    store.append(event("s", "character.created", 1)).await.unwrap();
    store.append(event("s", "campaign.started", 2)).await.unwrap();

    let spec = SubscriptionSpec::new("campaign-service", vec!["character.*".to_string()]).durable();
    let mut sub = store.subscribe(spec.clone(), Some(checkpoints.clone())).await.unwrap();

    store.append(event("s", "character.deleted", 3)).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), sub.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(first.event_type, "character.created");
    assert_eq!(first.sequence_number, 1);
    sub.ack(first.sequence_number).await.unwrap();

    let second = tokio::time::timeout(Duration::from_secs(2), sub.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(second.event_type, "character.deleted");
    assert_eq!(second.sequence_number, 3);
    drop(sub);

    assert_eq!(checkpoints.get_checkpoint(&spec.checkpoint_key()).await.unwrap(), Some(1));

    // Reconnect: the unacknowledged event is delivered again, the acked one is not
    let mut sub = store.subscribe(spec, Some(checkpoints)).await.unwrap();
    let again = tokio::time::timeout(Duration::from_secs(2), sub.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(again.sequence_number, 3);
}

#[tokio::test]
async fn test_live_subscription_skips_history() {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::open(&config(dir.path())).unwrap();
    store.append(event("s", "image.rendered", 1)).await.unwrap();

    let mut sub = store
        .subscribe(SubscriptionSpec::new("gallery", vec!["image.**".to_string()]), None)
        .await
        .unwrap();
    store.append(event("s", "image.render.failed", 2)).await.unwrap();

    let next = tokio::time::timeout(Duration::from_secs(2), sub.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(next.sequence_number, 2);
}

#[tokio::test]
async fn test_append_after_close_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::open(&config(dir.path())).unwrap();
    store.close().await;
    assert!(!store.is_writable());
    assert!(matches!(store.append(event("s", "t", 1)).await, Err(StoreError::Closed)));
}
