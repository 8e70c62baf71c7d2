//! Engine facade wiring the write queue, admission control, the log and the
//! background worker together.

mod flush;
mod write;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use bytes::Bytes;
#[cfg(feature = "tokio")]
use fusio::impls::disk::TokioFs;
use fusio::{impls::mem::fs::InMemoryFs, path::Path};

pub(crate) use self::flush::Background;
use crate::{
    checkpoint::Checkpoints,
    config::{MutableOptions, OptionsStore},
    error::{ErrorState, WriteError, WriteResult},
    executor::Executor,
    inmem::MemTable,
    manifest::{MetadataLog, MetadataRecord},
    observability::log_info,
    ondisk::TableSink,
    option::{DbOptions, LogLocation},
    stall::{trigger::TriggerFactory, FreezeTrigger, StallCondition, StallMetrics, WriteController},
    version::{SuperVersion, SuperVersionCell, SuperVersionRef},
    wal::{LogConfig, LogMetricsSnapshot, LogStorage, LogWriter},
    write::{
        queue::WriteQueue, sequencer::ApplySequencer, FlushOptions, WriteBatch, WriteMode,
        WriteOptions,
    },
};

pub(crate) struct DbInner {
    pub(crate) write_mode: WriteMode,
    pub(crate) queue: WriteQueue,
    pub(crate) sequencer: ApplySequencer,
    pub(crate) controller: WriteController,
    pub(crate) store: OptionsStore,
    pub(crate) metadata: MetadataLog,
    pub(crate) log: LogWriter,
    pub(crate) super_version: SuperVersionCell,
    pub(crate) trigger: Arc<dyn FreezeTrigger>,
    pub(crate) errors: ErrorState,
    pub(crate) checkpoints: Checkpoints,
    pub(crate) table_sink: Arc<dyn TableSink>,
    pub(crate) background: Background,
    pub(crate) visible_seq: AtomicU64,
    pub(crate) next_memtable_id: AtomicU64,
    pub(crate) next_table_id: AtomicU64,
    pub(crate) closed: AtomicBool,
}

impl DbInner {
    pub(crate) fn check_open(&self) -> WriteResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(WriteError::ShutdownInProgress)
        } else {
            Ok(())
        }
    }
}

/// Handle to an open engine.
pub struct Db {
    inner: Arc<DbInner>,
}

impl Db {
    /// Open on the current tokio runtime.
    #[cfg(feature = "tokio")]
    pub async fn open(options: DbOptions) -> WriteResult<Self> {
        Self::open_with_executor(options, crate::executor::tokio::TokioExecutor::current()).await
    }

    pub async fn open_with_executor<E>(options: DbOptions, executor: E) -> WriteResult<Self>
    where
        E: Executor,
    {
        options.mutable.validate()?;
        let storage = resolve_storage(&options.log_location).await?;
        let log = LogWriter::open(LogConfig {
            storage,
            manual_flush: options.manual_log_flush,
            buffer_max_bytes: options.log_buffer_max_bytes,
        })
        .await?;

        let live = Arc::new(options.mutable.clone());
        let memtable = Arc::new(MemTable::new(0, log.active_segment()));
        let (background, jobs) = Background::new();

        let inner = Arc::new(DbInner {
            write_mode: options.write_mode,
            queue: WriteQueue::new(1),
            sequencer: ApplySequencer::default(),
            controller: WriteController::new(&live, options.delay_policy.clone()),
            store: OptionsStore::new(options.mutable.clone()),
            metadata: MetadataLog::new(options.metadata_observer.clone()),
            log,
            super_version: SuperVersionCell::new(SuperVersion {
                number: 0,
                mutable: memtable,
                immutables: Vec::new(),
                version: Arc::default(),
                options: live,
            }),
            trigger: TriggerFactory::create(options.freeze_trigger),
            errors: ErrorState::default(),
            checkpoints: Checkpoints::new(options.checkpoints.clone()),
            table_sink: options.table_sink.clone(),
            background,
            visible_seq: AtomicU64::new(0),
            next_memtable_id: AtomicU64::new(1),
            next_table_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        executor.spawn(flush::background_loop(Arc::downgrade(&inner), jobs));
        log_info!(
            component = "db",
            event = "db_opened",
            write_mode = ?options.write_mode,
            manual_log_flush = options.manual_log_flush,
        );
        Ok(Db { inner })
    }

    /// Commit `batch` with the requested durability.
    pub async fn write(&self, batch: WriteBatch, options: WriteOptions) -> WriteResult<()> {
        self.inner.write(batch, options).await
    }

    pub async fn put(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        options: WriteOptions,
    ) -> WriteResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch, options).await
    }

    pub async fn delete(&self, key: impl Into<Bytes>, options: WriteOptions) -> WriteResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch, options).await
    }

    /// Newest value of `key` in the memtables.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let sv = self.inner.super_version.load();
        std::iter::once(&sv.mutable)
            .chain(sv.immutables.iter().rev())
            .find_map(|memtable| memtable.get(key))
            .flatten()
    }

    /// Switch the memtable and schedule its flush.
    pub async fn flush(&self, options: FlushOptions) -> WriteResult<()> {
        self.inner.flush(options).await
    }

    /// Apply `name=value` pairs to the live options, all or nothing.
    pub async fn set_options(&self, pairs: &[(&str, &str)]) -> WriteResult<()> {
        self.inner.set_options(pairs).await
    }

    pub fn options(&self) -> Arc<MutableOptions> {
        self.inner.store.live()
    }

    pub async fn flush_log(&self, sync: bool) -> WriteResult<()> {
        let result = self.inner.log.flush(sync).await;
        if let Err(err) = &result {
            self.inner.errors.record(err);
        }
        result
    }

    pub async fn sync_log(&self) -> WriteResult<()> {
        self.flush_log(true).await
    }

    /// Start a new log segment without switching the memtable.
    pub async fn rotate_log(&self) -> WriteResult<()> {
        self.inner.rotate_log().await
    }

    pub async fn lock_log(&self) -> WriteResult<()> {
        self.inner.log.lock().await
    }

    pub fn unlock_log(&self) -> WriteResult<()> {
        self.inner.log.unlock()
    }

    pub fn log_is_buffer_empty(&self) -> bool {
        self.inner.log.is_buffer_empty()
    }

    pub async fn pause_background_work(&self) {
        self.inner.background.pause().await;
    }

    pub fn continue_background_work(&self) {
        self.inner.background.resume();
    }

    /// Wait until every scheduled flush and compaction has finished.
    pub async fn wait_for_background_work(&self) {
        self.inner.background.wait_idle().await;
    }

    /// Leave read-only mode after a recoverable log failure.
    pub async fn resume(&self) -> WriteResult<()> {
        self.inner.resume().await
    }

    /// Engine error currently blocking writes, if any.
    pub fn background_error(&self) -> Option<WriteError> {
        self.inner.errors.current()
    }

    pub fn log_bytes_written(&self) -> u64 {
        self.inner.log.metrics().bytes_written()
    }

    pub fn log_metrics(&self) -> LogMetricsSnapshot {
        self.inner.log.metrics().snapshot()
    }

    pub fn is_write_stopped(&self) -> bool {
        self.inner.controller.is_stopped()
    }

    pub fn write_condition(&self) -> StallCondition {
        self.inner.controller.condition()
    }

    pub fn stall_metrics(&self) -> StallMetrics {
        self.inner.controller.metrics()
    }

    pub fn metadata_update_seq(&self) -> u64 {
        self.inner.metadata.update_seq()
    }

    pub fn metadata_records(&self) -> Vec<MetadataRecord> {
        self.inner.metadata.records()
    }

    /// Highest sequence number visible to readers.
    pub fn visible_sequence(&self) -> u64 {
        self.inner.visible_seq.load(Ordering::SeqCst)
    }

    pub fn super_version(&self) -> SuperVersionRef {
        self.inner.super_version.load()
    }

    /// Stop admitting writers, release stalled ones and write out the log
    /// buffer.
    pub async fn close(self) -> WriteResult<()> {
        self.inner.shutdown();
        self.inner.log.flush(false).await
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl DbInner {
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.controller.shutdown();
        self.background.close();
        log_info!(component = "db", event = "db_closed");
    }
}

async fn resolve_storage(location: &LogLocation) -> WriteResult<LogStorage> {
    match location {
        LogLocation::Storage(storage) => Ok(storage.clone()),
        LogLocation::Memory => {
            let root = Path::parse("wal").map_err(|err| {
                WriteError::InvalidRequest(format!("invalid log root: {err}"))
            })?;
            Ok(LogStorage::new(Arc::new(InMemoryFs::new()), root))
        }
        #[cfg(feature = "tokio")]
        LogLocation::Dir(dir) => {
            tokio::fs::create_dir_all(dir).await.map_err(|err| {
                WriteError::io(crate::error::Severity::Fatal, "create log directory", err)
            })?;
            let root = Path::from_filesystem_path(dir).map_err(|err| {
                WriteError::InvalidRequest(format!(
                    "invalid log directory {}: {err}",
                    dir.display()
                ))
            })?;
            Ok(LogStorage::new(Arc::new(TokioFs), root))
        }
        #[cfg(not(feature = "tokio"))]
        LogLocation::Dir(_) => Err(WriteError::InvalidRequest(
            "log directories need the `tokio` feature".into(),
        )),
    }
}
