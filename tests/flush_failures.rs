mod common;

use std::{sync::Arc, time::Duration};

use common::mem_options;
use tonbo_ingest::{
    Db, FlushOptions, InMemoryTables, MutableOptions, Severity, WriteError, WriteOptions,
};

const FLUSH_DEADLINE: Duration = Duration::from_secs(3);

fn assert_flush_failed(err: &WriteError) {
    assert_eq!(err.severity(), Some(Severity::Recoverable));
    assert!(
        matches!(err, WriteError::Io { action: "flush memtable", .. }),
        "unexpected error {err}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn flush_wait_succeeds_after_failed_flush() {
    let (options, _storage) = mem_options();
    let sink = Arc::new(InMemoryTables::new());
    let db = Db::open(
        options
            .table_sink(sink.clone())
            .mutable_options(MutableOptions::default().max_write_buffer_number(3)),
    )
    .await
    .unwrap();

    db.put("a", "1", WriteOptions::default()).await.unwrap();
    sink.set_failing(true);
    let err = db.flush(FlushOptions::default()).await.unwrap_err();
    assert_flush_failed(&err);
    assert_eq!(db.super_version().immutables.len(), 1);

    sink.set_failing(false);
    db.put("b", "2", WriteOptions::default()).await.unwrap();
    tokio::time::timeout(FLUSH_DEADLINE, db.flush(FlushOptions::default()))
        .await
        .expect("flush wait did not finish")
        .unwrap();

    let sv = db.super_version();
    assert!(sv.immutables.is_empty());
    assert_eq!(sv.version.level0().len(), 2);
    assert!(sv.mutable.is_empty());
    assert_eq!(db.get(b"a"), Some("1".into()));
    assert_eq!(db.get(b"b"), Some("2".into()));
}

#[tokio::test(flavor = "multi_thread")]
async fn flush_without_new_writes_retries_failed_memtable() {
    let (options, _storage) = mem_options();
    let sink = Arc::new(InMemoryTables::new());
    let db = Db::open(options.table_sink(sink.clone())).await.unwrap();

    db.put("a", "1", WriteOptions::default()).await.unwrap();
    sink.set_failing(true);
    assert_flush_failed(&db.flush(FlushOptions::default()).await.unwrap_err());

    // Still failing: the retry reports the new attempt.
    assert_flush_failed(&db.flush(FlushOptions::default()).await.unwrap_err());

    sink.set_failing(false);
    tokio::time::timeout(FLUSH_DEADLINE, db.flush(FlushOptions::default()))
        .await
        .expect("flush wait did not finish")
        .unwrap();
    let sv = db.super_version();
    assert!(sv.immutables.is_empty());
    assert_eq!(sv.version.level0().len(), 1);
}
