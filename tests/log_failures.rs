mod common;

use std::{sync::Arc, time::Duration};

use common::{mem_options, value, Gates};
use tonbo_ingest::{Checkpoint, Db, MutableOptions, Severity, WriteOptions};

#[tokio::test(flavor = "multi_thread")]
async fn failed_append_fails_the_whole_group() {
    let (options, storage) = mem_options();
    let gates = Gates::new();
    gates.hold(Checkpoint::LeaderBeforeAdmission);
    let db = Arc::new(Db::open(options.checkpoints(gates.clone())).await.unwrap());

    let mut tasks = Vec::new();
    for i in 0..5 {
        let db = db.clone();
        tasks.push(tokio::spawn(async move {
            db.put(format!("key{i}"), "v", WriteOptions::default().sync(true))
                .await
        }));
        if i == 0 {
            gates
                .wait_blocked(Checkpoint::LeaderBeforeAdmission, 1)
                .await;
        }
    }
    gates
        .wait_seen(Checkpoint::WriterJoined { leader: false }, 4)
        .await;
    storage.set_active(false);
    gates.release(Checkpoint::LeaderBeforeAdmission);

    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.severity(), Some(Severity::Recoverable));
    }
    assert_eq!(gates.count(Checkpoint::WriterJoined { leader: true }), 1);
    assert_eq!(gates.count(Checkpoint::GroupFormed { size: 5 }), 1);
    assert_eq!(db.visible_sequence(), 0);
    assert!(db.get(b"key0").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn recoverable_failure_is_read_only_until_resume() {
    let (options, storage) = mem_options();
    let db = Db::open(options).await.unwrap();

    db.put("a", "1", WriteOptions::default()).await.unwrap();
    storage.set_active(false);
    let err = db
        .put("b", "2", WriteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.severity(), Some(Severity::Recoverable));

    // Read-only, even after the medium comes back.
    storage.set_active(true);
    let err = db
        .put("c", "3", WriteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.severity(), Some(Severity::Recoverable));
    assert!(db.background_error().is_some());

    let segments_before = storage.segment_ids().await.len();
    db.resume().await.unwrap();
    assert!(db.background_error().is_none());
    assert_eq!(storage.segment_ids().await.len(), segments_before + 1);

    db.put("d", "4", WriteOptions::default().sync(true))
        .await
        .unwrap();
    assert_eq!(db.get(b"a"), Some("1".into()));
    assert_eq!(db.get(b"b"), None);
    assert_eq!(db.get(b"d"), Some("4".into()));
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_fails_while_medium_is_down() {
    let (options, storage) = mem_options();
    let db = Db::open(options).await.unwrap();

    storage.set_active(false);
    db.put("a", "1", WriteOptions::default())
        .await
        .unwrap_err();
    assert!(db.resume().await.is_err());
    assert!(db.background_error().is_some());

    storage.set_active(true);
    db.resume().await.unwrap();
    db.put("a", "1", WriteOptions::default()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_memtable_switch_is_fatal() {
    let (options, storage) = mem_options();
    let db = Db::open(
        options
            .manual_log_flush(true)
            .log_buffer_max_bytes(1 << 20)
            .mutable_options(MutableOptions::default().write_buffer_size(64)),
    )
    .await
    .unwrap();

    db.put("a", value(128), WriteOptions::default())
        .await
        .unwrap();
    assert!(!db.log_is_buffer_empty());

    storage.set_active(false);
    let err = db
        .put("b", value(128), WriteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.severity(), Some(Severity::Fatal));

    storage.set_active(true);
    let err = db.resume().await.unwrap_err();
    assert_eq!(err.severity(), Some(Severity::Fatal));
    let err = db
        .put("c", "3", WriteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.severity(), Some(Severity::Fatal));
}

#[tokio::test(flavor = "multi_thread")]
async fn manual_flush_buffers_until_flushed() {
    let (options, storage) = mem_options();
    let db = Db::open(options.manual_log_flush(true)).await.unwrap();

    db.put("a", "1", WriteOptions::default()).await.unwrap();
    db.put("b", "2", WriteOptions::default()).await.unwrap();
    assert!(!db.log_is_buffer_empty());
    assert_eq!(storage.total_bytes().await, 0);
    assert_eq!(db.log_bytes_written(), 0);

    db.flush_log(false).await.unwrap();
    assert!(db.log_is_buffer_empty());
    assert!(storage.total_bytes().await > 0);
    assert_eq!(db.log_bytes_written(), storage.total_bytes().await as u64);

    // A synced write goes straight out.
    db.put("c", "3", WriteOptions::default().sync(true))
        .await
        .unwrap();
    assert!(db.log_is_buffer_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn lock_log_writes_out_buffer_and_blocks_appends() {
    let (options, storage) = mem_options();
    let db = Arc::new(Db::open(options.manual_log_flush(true)).await.unwrap());

    db.put("a", "1", WriteOptions::default()).await.unwrap();
    assert!(!db.log_is_buffer_empty());

    db.lock_log().await.unwrap();
    assert!(db.log_is_buffer_empty());
    let written = storage.total_bytes().await;
    assert!(written > 0);

    let writer = {
        let db = db.clone();
        tokio::spawn(async move { db.put("b", "2", WriteOptions::default().sync(true)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!writer.is_finished());
    assert_eq!(storage.total_bytes().await, written);

    db.unlock_log().unwrap();
    writer.await.unwrap().unwrap();
    assert!(storage.total_bytes().await > written);

    let err = db.unlock_log().unwrap_err();
    assert!(err.is_invalid_request());
}

#[tokio::test(flavor = "multi_thread")]
async fn nested_log_lock_needs_matching_unlocks() {
    let (options, _storage) = mem_options();
    let db = Db::open(options).await.unwrap();

    db.lock_log().await.unwrap();
    db.lock_log().await.unwrap();
    db.unlock_log().unwrap();
    db.unlock_log().unwrap();
    assert!(db.unlock_log().is_err());
    db.put("a", "1", WriteOptions::default()).await.unwrap();
}
