//! Background worker running memtable flushes and level-0 compactions.
//!
//! Jobs arrive over an unbounded channel and run one at a time. Every job
//! passes through the pause gate: `running` is raised before `paused` is
//! checked, and `pause` raises `paused` before checking `running`, so once
//! `pause` returns no job is in flight and none will start.

use std::{
    collections::BTreeMap,
    io,
    pin::pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, Weak,
    },
};

use tokio::sync::Notify;

use super::DbInner;
use crate::{
    checkpoint::Checkpoint,
    error::{Severity, WriteError, WriteResult},
    manifest::MetadataEvent,
    observability::{log_error, log_info, log_warn},
    ondisk::{TableId, TableMeta},
    stall::trigger::report_load,
    version::{SuperVersion, VersionEdit},
    write::FlushOptions,
};

/// Flush failures of memtables that are still pending.
#[derive(Debug, Default)]
struct FlushFailures {
    /// Failures recorded so far.
    count: u64,
    /// Latest failure per memtable id, stamped with `count` at the time.
    pending: BTreeMap<u64, (u64, Arc<io::Error>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Job {
    Flush,
    Compaction,
}

pub(crate) struct Background {
    sender: flume::Sender<Job>,
    paused: AtomicUsize,
    running: AtomicBool,
    outstanding: AtomicUsize,
    changed: Notify,
    compaction_scheduled: AtomicBool,
    closed: AtomicBool,
    /// Id of the oldest memtable not yet flushed and reported.
    flushed_below: AtomicU64,
    failures: Mutex<FlushFailures>,
    installed: Notify,
}

impl Background {
    pub(crate) fn new() -> (Self, flume::Receiver<Job>) {
        let (sender, jobs) = flume::unbounded();
        let background = Background {
            sender,
            paused: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
            changed: Notify::new(),
            compaction_scheduled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            flushed_below: AtomicU64::new(0),
            failures: Mutex::new(FlushFailures::default()),
            installed: Notify::new(),
        };
        (background, jobs)
    }

    pub(crate) fn schedule(&self, job: Job) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(job).is_err() {
            self.finish_job();
        }
    }

    /// Stop background work. Nests; each call needs a matching `resume`.
    pub(crate) async fn pause(&self) {
        let depth = self.paused.fetch_add(1, Ordering::SeqCst) + 1;
        loop {
            let mut changed = pin!(self.changed.notified());
            changed.as_mut().enable();
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            changed.await;
        }
        log_info!(component = "background", event = "paused", depth);
    }

    pub(crate) fn resume(&self) {
        let previous = self
            .paused
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match previous {
            Ok(depth) => {
                log_info!(component = "background", event = "resumed", depth = depth - 1);
                self.changed.notify_waiters();
            }
            Err(_) => {
                log_warn!(component = "background", event = "resume_without_pause");
            }
        }
    }

    /// Wait until the job queue is empty and nothing is running.
    ///
    /// Never returns while paused with jobs outstanding.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let mut changed = pin!(self.changed.notified());
            changed.as_mut().enable();
            if self.outstanding.load(Ordering::SeqCst) == 0 || self.closed.load(Ordering::SeqCst)
            {
                return;
            }
            changed.await;
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
        self.installed.notify_waiters();
    }

    /// Pass the pause gate. Returns false once closed.
    async fn enter(&self) -> bool {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return false;
            }
            self.running.store(true, Ordering::SeqCst);
            if self.paused.load(Ordering::SeqCst) == 0 {
                return true;
            }
            self.running.store(false, Ordering::SeqCst);
            self.changed.notify_waiters();

            let mut changed = pin!(self.changed.notified());
            changed.as_mut().enable();
            if self.paused.load(Ordering::SeqCst) == 0 || self.closed.load(Ordering::SeqCst) {
                continue;
            }
            changed.await;
        }
    }

    fn leave(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    fn record_failure(&self, memtable: u64, err: io::Error) {
        let mut failures = self.failures.lock().expect("failures poisoned");
        failures.count += 1;
        let stamp = failures.count;
        failures.pending.insert(memtable, (stamp, Arc::new(err)));
    }

    fn failure_count(&self) -> u64 {
        self.failures.lock().expect("failures poisoned").count
    }

    fn finish_job(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }
}

pub(crate) async fn background_loop(db: Weak<DbInner>, jobs: flume::Receiver<Job>) {
    while let Ok(job) = jobs.recv_async().await {
        let Some(inner) = db.upgrade() else {
            break;
        };
        let background = &inner.background;
        if background.enter().await {
            match job {
                Job::Flush => run_flush(&inner).await,
                Job::Compaction => run_compaction(&inner).await,
            }
            background.leave();
        } else if job == Job::Compaction {
            background.compaction_scheduled.store(false, Ordering::SeqCst);
        }
        background.finish_job();
    }
    log_info!(component = "background", event = "worker_stopped");
}

/// Flush pending memtables oldest first until none is left or one fails.
///
/// A failed memtable stays pending and blocks the younger ones; the next
/// flush job starts over with it.
async fn run_flush(inner: &DbInner) {
    let snapshot = inner.store.live();
    inner.checkpoints.reach(Checkpoint::FlushJobStart).await;

    while let Some(memtable) = inner.super_version.load().immutables.first().cloned() {
        let id = TableId(inner.next_table_id.fetch_add(1, Ordering::SeqCst));
        let table = match inner.table_sink.write_table(id, memtable.entries()).await {
            Ok(table) => table,
            Err(err) => {
                log_error!(
                    component = "background",
                    event = "flush_failed",
                    memtable = memtable.id(),
                    table = %id,
                    error = %err,
                );
                inner.background.record_failure(memtable.id(), err);
                inner.background.installed.notify_waiters();
                return;
            }
        };

        let installed = inner.super_version.install(|sv| SuperVersion {
            immutables: sv
                .immutables
                .iter()
                .filter(|m| m.id() != memtable.id())
                .cloned()
                .collect(),
            version: Arc::new(sv.version.apply_edits(vec![VersionEdit::Add {
                level: 0,
                table: table.clone(),
            }])),
            options: snapshot.clone(),
            ..sv.clone()
        });
        inner
            .background
            .failures
            .lock()
            .expect("failures poisoned")
            .pending
            .remove(&memtable.id());
        inner.metadata.record(MetadataEvent::FlushInstalled {
            memtable: memtable.id(),
            table: table.id,
        });
        report_load(&inner.controller, &installed, "flush");
        let retired = inner.log.retire_before(installed.oldest_log_segment()).await;
        log_info!(
            component = "background",
            event = "flush_installed",
            memtable = memtable.id(),
            table = %table.id,
            entries = table.entries,
            l0_files = installed.version.level0().len(),
            segments_retired = retired,
        );

        let oldest_pending = installed
            .immutables
            .first()
            .map_or(installed.mutable.id(), |m| m.id());
        inner
            .background
            .flushed_below
            .fetch_max(oldest_pending, Ordering::SeqCst);
        inner.checkpoints.reach(Checkpoint::FlushJobInstalled).await;
        inner.background.installed.notify_waiters();
        inner.maybe_schedule_compaction(&installed);
    }
}

async fn run_compaction(inner: &DbInner) {
    let snapshot = inner.store.live();
    inner.checkpoints.reach(Checkpoint::CompactionJobStart).await;

    let inputs: Vec<TableMeta> = inner.super_version.load().version.level0().to_vec();
    if snapshot.disable_auto_compactions
        || inputs.len() < snapshot.level0_file_num_compaction_trigger
    {
        inner
            .background
            .compaction_scheduled
            .store(false, Ordering::SeqCst);
        return;
    }

    let output = TableId(inner.next_table_id.fetch_add(1, Ordering::SeqCst));
    let table = match inner.table_sink.merge_tables(inputs.clone(), output).await {
        Ok(table) => table,
        Err(err) => {
            log_error!(
                component = "background",
                event = "compaction_failed",
                inputs = inputs.len(),
                table = %output,
                error = %err,
            );
            inner
                .background
                .compaction_scheduled
                .store(false, Ordering::SeqCst);
            return;
        }
    };
    inner
        .checkpoints
        .reach(Checkpoint::CompactionJobBeforeInstall)
        .await;

    let mut edits: Vec<VersionEdit> = inputs
        .iter()
        .map(|input| VersionEdit::Remove {
            level: 0,
            id: input.id,
        })
        .collect();
    edits.push(VersionEdit::Add {
        level: 1,
        table: table.clone(),
    });
    let installed = inner.super_version.install(|sv| SuperVersion {
        version: Arc::new(sv.version.apply_edits(edits)),
        options: snapshot.clone(),
        ..sv.clone()
    });
    inner.metadata.record(MetadataEvent::CompactionInstalled {
        inputs: inputs.iter().map(|input| input.id).collect(),
        outputs: vec![table.id],
    });
    report_load(&inner.controller, &installed, "compaction");
    log_info!(
        component = "background",
        event = "compaction_installed",
        inputs = inputs.len(),
        table = %table.id,
        l0_files = installed.version.level0().len(),
    );
    inner.checkpoints.reach(Checkpoint::CompactionInstalled).await;

    inner
        .background
        .compaction_scheduled
        .store(false, Ordering::SeqCst);
    inner.maybe_schedule_compaction(&installed);
}

impl DbInner {
    pub(crate) fn schedule_flush(&self) {
        self.background.schedule(Job::Flush);
    }

    pub(crate) fn maybe_schedule_compaction(&self, sv: &SuperVersion) {
        let live = self.store.live();
        if live.disable_auto_compactions
            || sv.version.level0().len() < live.level0_file_num_compaction_trigger
        {
            return;
        }
        if !self
            .background
            .compaction_scheduled
            .swap(true, Ordering::SeqCst)
        {
            self.background.schedule(Job::Compaction);
        }
    }

    pub(crate) async fn flush(&self, options: FlushOptions) -> WriteResult<()> {
        self.errors.check()?;
        let leadership = self.enter_unbatched().await?;
        let sv = self.super_version.load();

        let failures_seen = self.background.failure_count();
        if sv.mutable.is_empty() {
            leadership.hand_off();
            let Some(newest) = sv.immutables.last() else {
                return Ok(());
            };
            // Pick up memtables whose last flush attempt failed.
            self.schedule_flush();
            return if options.wait {
                self.wait_flushed(newest.id(), failures_seen).await
            } else {
                Ok(())
            };
        }

        let live = self.store.live();
        if !options.allow_write_stall
            && !live.disable_write_stall
            && sv.immutables.len() + 1 >= live.max_write_buffer_number
        {
            leadership.hand_off();
            return Err(WriteError::Incomplete("flush would stall writes"));
        }

        let sealed = sv.mutable.id();
        let switched = self.switch_memtable(&leadership, Severity::Fatal).await;
        leadership.hand_off();
        switched?;

        if options.wait {
            self.wait_flushed(sealed, failures_seen).await
        } else {
            Ok(())
        }
    }

    /// Wait until memtable `id` is no longer pending flush.
    ///
    /// Fails when a flush attempt recorded after `failures_seen` failed on
    /// `id` or on an older memtable in front of it.
    async fn wait_flushed(&self, id: u64, failures_seen: u64) -> WriteResult<()> {
        loop {
            let mut installed = pin!(self.background.installed.notified());
            installed.as_mut().enable();

            let failed = self
                .background
                .failures
                .lock()
                .expect("failures poisoned")
                .pending
                .range(..=id)
                .find(|(_, (stamp, _))| *stamp > failures_seen)
                .map(|(_, (_, source))| source.clone());
            if let Some(source) = failed {
                return Err(WriteError::Io {
                    severity: Severity::Recoverable,
                    action: "flush memtable",
                    source,
                });
            }
            if self.background.flushed_below.load(Ordering::SeqCst) > id {
                return Ok(());
            }
            if self.background.closed.load(Ordering::SeqCst) {
                return Err(WriteError::ShutdownInProgress);
            }
            installed.await;
        }
    }

    pub(crate) async fn set_options(&self, pairs: &[(&str, &str)]) -> WriteResult<()> {
        self.check_open()?;
        self.store
            .set(pairs, &self.metadata, &self.controller)
            .await?;
        self.maybe_schedule_compaction(&self.super_version.load());
        Ok(())
    }
}
