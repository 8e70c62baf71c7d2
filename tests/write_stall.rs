mod common;

use std::{sync::Arc, time::Duration};

use common::{mem_options, put_and_flush, Gates};
use tonbo_ingest::{
    stall::StallCause, Checkpoint, Db, FlushOptions, MetadataEvent, MutableOptions,
    StallCondition, WriteError, WriteOptions,
};

#[tokio::test(flavor = "multi_thread")]
async fn disabling_stalls_releases_blocked_writer() {
    let (options, _storage) = mem_options();
    let gates = Gates::new();
    let db = Arc::new(Db::open(options.checkpoints(gates.clone())).await.unwrap());
    db.pause_background_work().await;

    let stall_ok = FlushOptions::default().wait(false).allow_write_stall(true);
    for key in ["a", "b"] {
        db.put(key, "v", WriteOptions::default()).await.unwrap();
        db.flush(stall_ok).await.unwrap();
    }
    assert!(db.is_write_stopped());
    assert_eq!(
        db.write_condition(),
        StallCondition::Stopped {
            cause: StallCause::MemtableLimit
        }
    );

    let writer = {
        let db = db.clone();
        tokio::spawn(async move { db.put("c", "v", WriteOptions::default()).await })
    };
    gates.wait_seen(Checkpoint::StallBegin, 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!writer.is_finished());

    let seq = db.metadata_update_seq();
    db.set_options(&[("disable_write_stall", "true")])
        .await
        .unwrap();
    writer.await.unwrap().unwrap();
    assert_eq!(db.metadata_update_seq(), seq);
    assert!(!db.is_write_stopped());
    assert_eq!(db.get(b"c"), Some("v".into()));

    // Back on: the backlog is still there.
    db.set_options(&[("disable_write_stall", "false")])
        .await
        .unwrap();
    assert!(db.is_write_stopped());
    let err = db
        .put("d", "v", WriteOptions::default().no_slowdown(true))
        .await
        .unwrap_err();
    assert!(matches!(err, WriteError::Incomplete(_)));

    // Raising the hard limit also admits writers, and is persisted.
    db.set_options(&[("max_write_buffer_number", "4")])
        .await
        .unwrap();
    assert_eq!(db.metadata_update_seq(), seq + 1);
    assert!(matches!(
        db.metadata_records().last().map(|r| &r.event),
        Some(MetadataEvent::OptionsChanged { names }) if names == &["max_write_buffer_number"]
    ));
    db.put("d", "v", WriteOptions::default().no_slowdown(true))
        .await
        .unwrap();

    db.continue_background_work();
    db.wait_for_background_work().await;
    assert!(db.super_version().immutables.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_options_change_nothing() {
    let (options, _storage) = mem_options();
    let db = Db::open(options).await.unwrap();
    let seq = db.metadata_update_seq();

    let err = db
        .set_options(&[("max_write_buffer_number", "6"), ("no_such_option", "1")])
        .await
        .unwrap_err();
    assert!(err.is_invalid_request());
    let err = db
        .set_options(&[("level0_stop_writes_trigger", "many")])
        .await
        .unwrap_err();
    assert!(err.is_invalid_request());
    let err = db
        .set_options(&[
            ("level0_slowdown_writes_trigger", "10"),
            ("level0_stop_writes_trigger", "5"),
        ])
        .await
        .unwrap_err();
    assert!(err.is_invalid_request());
    assert!(db.set_options(&[]).await.is_err());

    assert_eq!(db.options().max_write_buffer_number, 2);
    assert_eq!(db.options().level0_stop_writes_trigger, 36);
    assert_eq!(db.metadata_update_seq(), seq);
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_compaction_snapshot_does_not_stall() {
    let (options, _storage) = mem_options();
    let gates = Gates::new();
    gates.hold(Checkpoint::CompactionJobBeforeInstall);
    let db = Db::open(
        options.checkpoints(gates.clone()).mutable_options(
            MutableOptions::default()
                .level0_slowdown_writes_trigger(2)
                .level0_stop_writes_trigger(2)
                .level0_file_num_compaction_trigger(2),
        ),
    )
    .await
    .unwrap();

    put_and_flush(&db, "a").await;
    put_and_flush(&db, "b").await;
    assert_eq!(
        db.write_condition(),
        StallCondition::Stopped {
            cause: StallCause::Level0Limit
        }
    );
    // The compaction captured its options while stalls were still on.
    gates
        .wait_blocked(Checkpoint::CompactionJobBeforeInstall, 1)
        .await;

    db.set_options(&[("disable_write_stall", "true")])
        .await
        .unwrap();
    assert_eq!(db.write_condition(), StallCondition::Normal);
    db.put("c", "v", WriteOptions::default().no_slowdown(true))
        .await
        .unwrap();

    gates.release(Checkpoint::CompactionJobBeforeInstall);
    gates.wait_seen(Checkpoint::CompactionInstalled, 1).await;

    let sv = db.super_version();
    assert!(!sv.options.disable_write_stall);
    assert!(db.options().disable_write_stall);
    assert_eq!(sv.version.level0().len(), 0);
    assert_eq!(sv.version.level1().len(), 1);
    assert_eq!(db.write_condition(), StallCondition::Normal);
    db.put("d", "v", WriteOptions::default().no_slowdown(true))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn level0_stop_holds_writers_until_compaction() {
    let (options, _storage) = mem_options();
    let gates = Gates::new();
    let db = Arc::new(
        Db::open(
            options.checkpoints(gates.clone()).mutable_options(
                MutableOptions::default()
                    .level0_slowdown_writes_trigger(4)
                    .level0_stop_writes_trigger(4)
                    .level0_file_num_compaction_trigger(4)
                    .disable_auto_compactions(true),
            ),
        )
        .await
        .unwrap(),
    );

    for key in ["a", "b", "c", "d"] {
        put_and_flush(&db, key).await;
    }
    assert!(db.is_write_stopped());

    let mut patient = Vec::new();
    let mut eager = Vec::new();
    for i in 0..8 {
        let db = db.clone();
        let no_slowdown = fastrand::bool();
        let task = tokio::spawn(async move {
            db.put(
                format!("key{i}"),
                "v",
                WriteOptions::default().no_slowdown(no_slowdown),
            )
            .await
        });
        if no_slowdown {
            eager.push(task);
        } else {
            patient.push(task);
        }
        if fastrand::bool() {
            tokio::task::yield_now().await;
        }
    }
    for task in eager {
        match task.await.unwrap() {
            Err(WriteError::Incomplete(_)) => {}
            other => panic!("no-slowdown writer got {other:?}"),
        }
    }
    if !patient.is_empty() {
        gates.wait_seen(Checkpoint::StallBegin, 1).await;
        assert!(patient.iter().all(|task| !task.is_finished()));
    }

    db.set_options(&[("disable_auto_compactions", "false")])
        .await
        .unwrap();
    for task in patient {
        task.await.unwrap().unwrap();
    }
    db.wait_for_background_work().await;

    assert!(!db.is_write_stopped());
    assert_eq!(db.super_version().version.level0().len(), 0);
    assert!(db
        .metadata_records()
        .iter()
        .any(|record| matches!(record.event, MetadataEvent::CompactionInstalled { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn stalling_leader_ejects_queued_no_slowdown_writer() {
    let (options, _storage) = mem_options();
    let gates = Gates::new();
    let db = Arc::new(Db::open(options.checkpoints(gates.clone())).await.unwrap());
    db.pause_background_work().await;

    let stall_ok = FlushOptions::default().wait(false).allow_write_stall(true);
    for key in ["a", "b"] {
        db.put(key, "v", WriteOptions::default()).await.unwrap();
        db.flush(stall_ok).await.unwrap();
    }
    assert!(db.is_write_stopped());
    let rejected_before = db.stall_metrics().rejected;

    gates.hold(Checkpoint::LeaderBeforeAdmission);
    gates.hold(Checkpoint::StallBegin);
    let leader = {
        let db = db.clone();
        tokio::spawn(async move { db.put("patient", "v", WriteOptions::default()).await })
    };
    gates
        .wait_blocked(Checkpoint::LeaderBeforeAdmission, 1)
        .await;
    let eager = {
        let db = db.clone();
        tokio::spawn(async move {
            db.put("eager", "v", WriteOptions::default().no_slowdown(true))
                .await
        })
    };
    // Queued behind the leader before the stall begins.
    gates
        .wait_seen(Checkpoint::WriterJoined { leader: false }, 1)
        .await;
    gates.release(Checkpoint::LeaderBeforeAdmission);

    gates.wait_blocked(Checkpoint::StallBegin, 1).await;
    match eager.await.unwrap() {
        Err(WriteError::Incomplete(_)) => {}
        other => panic!("no-slowdown writer got {other:?}"),
    }
    assert_eq!(db.stall_metrics().rejected, rejected_before + 1);
    assert!(!leader.is_finished());

    let formed_alone = gates.count(Checkpoint::GroupFormed { size: 1 });
    gates.release(Checkpoint::StallBegin);
    db.set_options(&[("disable_write_stall", "true")])
        .await
        .unwrap();
    leader.await.unwrap().unwrap();

    assert_eq!(
        gates.count(Checkpoint::GroupFormed { size: 1 }),
        formed_alone + 1
    );
    assert_eq!(gates.count(Checkpoint::GroupFormed { size: 2 }), 0);
    assert_eq!(db.get(b"patient"), Some("v".into()));
    assert_eq!(db.get(b"eager"), None);

    db.continue_background_work();
    db.wait_for_background_work().await;
}

#[tokio::test(start_paused = true)]
async fn delayed_writes_still_complete() {
    let (options, _storage) = mem_options();
    let db = Db::open(
        options.mutable_options(
            MutableOptions::default()
                .level0_slowdown_writes_trigger(1)
                .level0_stop_writes_trigger(8)
                .level0_file_num_compaction_trigger(8),
        ),
    )
    .await
    .unwrap();

    put_and_flush(&db, "a").await;
    assert!(matches!(
        db.write_condition(),
        StallCondition::Delayed {
            cause: StallCause::Level0Limit,
            ..
        }
    ));

    let err = db
        .put("b", "v", WriteOptions::default().no_slowdown(true))
        .await
        .unwrap_err();
    assert!(err.is_incomplete());
    db.put("b", "v", WriteOptions::default()).await.unwrap();
    assert_eq!(db.get(b"b"), Some("v".into()));

    let metrics = db.stall_metrics();
    assert!(metrics.delays >= 1);
    assert!(metrics.rejected >= 1);
}
