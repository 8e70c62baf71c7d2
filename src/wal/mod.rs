//! Durable log writer.
//!
//! Every committed write group is framed into one record and appended to the
//! active segment. In manual-flush mode records without a sync request stay in
//! an in-memory buffer until [`LogWriter::flush`], a rotation, an external
//! lock, or the buffer limit writes them out.

use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_lock::{Mutex as AsyncMutex, MutexGuardArc};
use ulid::{Generator, Ulid};

use crate::{
    error::{Severity, WriteError, WriteResult},
    observability::{log_debug, log_info, log_warn},
};

pub mod mem;
pub mod metrics;
pub mod record;
pub mod storage;

pub use mem::{FaultyFs, MemLogStorage};
pub use metrics::{LogMetrics, LogMetricsSnapshot};
pub use storage::{LogSegment, LogStorage};

/// Identifier of a log segment. Ids grow strictly with creation order.
pub type SegmentId = Ulid;

/// Configuration of the log writer.
#[derive(Clone)]
pub struct LogConfig {
    pub storage: LogStorage,
    /// Buffer records without a sync request until flushed explicitly.
    pub manual_flush: bool,
    /// Buffered bytes at which the buffer is written out regardless.
    pub buffer_max_bytes: usize,
}

impl LogConfig {
    pub fn new(storage: LogStorage) -> Self {
        Self {
            storage,
            manual_flush: false,
            buffer_max_bytes: 1024 * 1024,
        }
    }
}

impl fmt::Debug for LogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogConfig")
            .field("root", &self.storage.root().to_string())
            .field("manual_flush", &self.manual_flush)
            .field("buffer_max_bytes", &self.buffer_max_bytes)
            .finish_non_exhaustive()
    }
}

struct ActiveSegment {
    segment: LogSegment,
    appended: u64,
    synced: u64,
}

impl ActiveSegment {
    fn new(segment: LogSegment) -> Self {
        Self {
            segment,
            appended: 0,
            synced: 0,
        }
    }
}

struct LogState {
    ids: Generator,
    active: ActiveSegment,
    /// Older segments still referenced by unflushed memtables.
    retained: BTreeSet<SegmentId>,
    buffer: Vec<u8>,
}

struct ExternalLock {
    _guard: MutexGuardArc<LogState>,
    depth: usize,
}

pub struct LogWriter {
    state: Arc<AsyncMutex<LogState>>,
    external: Mutex<Option<ExternalLock>>,
    storage: LogStorage,
    manual_flush: bool,
    buffer_max_bytes: usize,
    buffered: AtomicUsize,
    active_id: Mutex<SegmentId>,
    metrics: LogMetrics,
}

impl LogWriter {
    /// Create the writer and its first segment.
    pub async fn open(config: LogConfig) -> WriteResult<Self> {
        let mut ids = Generator::new();
        let id = next_id(&mut ids, Severity::Fatal)?;
        config
            .storage
            .ensure_dir()
            .await
            .map_err(|err| WriteError::io(Severity::Fatal, "create log directory", err))?;
        let segment = config
            .storage
            .create(id)
            .await
            .map_err(|err| WriteError::io(Severity::Fatal, "create log segment", err))?;
        log_info!(
            component = "wal",
            event = "log_opened",
            segment = %id,
            path = %segment.path(),
        );

        Ok(Self {
            state: Arc::new(AsyncMutex::new(LogState {
                ids,
                active: ActiveSegment::new(segment),
                retained: BTreeSet::new(),
                buffer: Vec::new(),
            })),
            external: Mutex::new(None),
            storage: config.storage,
            manual_flush: config.manual_flush,
            buffer_max_bytes: config.buffer_max_bytes,
            buffered: AtomicUsize::new(0),
            active_id: Mutex::new(id),
            metrics: LogMetrics::default(),
        })
    }

    /// Append one framed record.
    pub async fn append(&self, payload: &[u8], sync: bool) -> WriteResult<()> {
        let mut state = self.state.lock().await;
        record::encode_into(payload, &mut state.buffer)
            .map_err(|err| WriteError::InvalidRequest(err.to_string()))?;
        self.metrics.record_append();

        if self.manual_flush && !sync {
            let buffered = state.buffer.len();
            self.buffered.store(buffered, Ordering::SeqCst);
            if buffered >= self.buffer_max_bytes {
                self.write_out(&mut state, Severity::Recoverable, "write out log buffer")
                    .await?;
            }
            return Ok(());
        }

        self.write_out(&mut state, Severity::Recoverable, "append log record")
            .await?;
        if sync {
            self.sync_active(&mut state, Severity::Recoverable, "sync log")
                .await?;
        }
        Ok(())
    }

    /// Write out buffered records, syncing the segment when asked to.
    pub async fn flush(&self, sync: bool) -> WriteResult<()> {
        let mut state = self.state.lock().await;
        self.write_out(&mut state, Severity::Recoverable, "flush log")
            .await?;
        if sync {
            self.sync_active(&mut state, Severity::Recoverable, "sync log")
                .await?;
        }
        Ok(())
    }

    /// Seal the active segment and start a new one.
    ///
    /// Failures carry `severity`; the memtable switch passes `Fatal`.
    pub async fn rotate(&self, severity: Severity) -> WriteResult<SegmentId> {
        let mut state = self.state.lock().await;
        self.write_out(&mut state, severity, "write out log buffer before rotation")
            .await?;
        self.sync_active(&mut state, severity, "sync log before rotation")
            .await?;

        let id = next_id(&mut state.ids, severity)?;
        let segment = self
            .storage
            .create(id)
            .await
            .map_err(|err| WriteError::io(severity, "create log segment", err))?;
        let mut old = std::mem::replace(&mut state.active, ActiveSegment::new(segment));
        let sealed = old.segment.id();
        state.retained.insert(sealed);
        *self.active_id.lock().expect("log id poisoned") = id;
        self.metrics.record_rotation();
        if let Err(err) = old.segment.close().await {
            log_warn!(
                component = "wal",
                event = "log_close_failed",
                segment = %sealed,
                error = %err,
            );
        }

        log_info!(
            component = "wal",
            event = "log_rotated",
            sealed = %sealed,
            sealed_bytes = old.appended,
            segment = %id,
        );
        Ok(id)
    }

    /// Take the log for exclusive external use. Buffered records are written
    /// out and synced first; appends wait until the matching unlock.
    pub async fn lock(&self) -> WriteResult<()> {
        {
            let mut external = self.external.lock().expect("log lock poisoned");
            if let Some(held) = external.as_mut() {
                held.depth += 1;
                return Ok(());
            }
        }

        let mut guard = self.state.lock_arc().await;
        self.write_out(&mut guard, Severity::Recoverable, "flush log before lock")
            .await?;
        self.sync_active(&mut guard, Severity::Recoverable, "sync log before lock")
            .await?;

        let mut external = self.external.lock().expect("log lock poisoned");
        match external.as_mut() {
            Some(held) => held.depth += 1,
            None => {
                *external = Some(ExternalLock {
                    _guard: guard,
                    depth: 1,
                })
            }
        }
        log_debug!(component = "wal", event = "log_locked");
        Ok(())
    }

    pub fn unlock(&self) -> WriteResult<()> {
        let mut external = self.external.lock().expect("log lock poisoned");
        match external.as_mut() {
            None => Err(WriteError::InvalidRequest(
                "unlock of a log that is not locked".into(),
            )),
            Some(held) if held.depth > 1 => {
                held.depth -= 1;
                Ok(())
            }
            Some(_) => {
                *external = None;
                log_debug!(component = "wal", event = "log_unlocked");
                Ok(())
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.external.lock().expect("log lock poisoned").is_some()
    }

    /// Delete every retained segment older than `id`.
    pub async fn retire_before(&self, id: SegmentId) -> usize {
        let mut state = self.state.lock().await;
        let doomed: Vec<SegmentId> = state.retained.range(..id).copied().collect();
        let mut retired = 0;
        for segment in doomed {
            match self.storage.remove(segment).await {
                Ok(()) => {
                    state.retained.remove(&segment);
                    retired += 1;
                }
                Err(err) => {
                    log_warn!(
                        component = "wal",
                        event = "log_retire_failed",
                        segment = %segment,
                        error = %err,
                    );
                }
            }
        }
        if retired > 0 {
            self.metrics.record_retired(retired as u64);
            log_debug!(
                component = "wal",
                event = "log_segments_retired",
                retired,
                floor = %id,
            );
        }
        retired
    }

    pub fn active_segment(&self) -> SegmentId {
        *self.active_id.lock().expect("log id poisoned")
    }

    /// Live segments, oldest first, the active one last.
    pub async fn segments(&self) -> Vec<SegmentId> {
        let state = self.state.lock().await;
        state
            .retained
            .iter()
            .copied()
            .chain(std::iter::once(state.active.segment.id()))
            .collect()
    }

    pub fn is_buffer_empty(&self) -> bool {
        self.buffered.load(Ordering::SeqCst) == 0
    }

    pub fn metrics(&self) -> &LogMetrics {
        &self.metrics
    }

    /// Hand the buffer to the medium. The buffer is empty afterwards even when
    /// the write fails.
    async fn write_out(
        &self,
        state: &mut LogState,
        severity: Severity,
        action: &'static str,
    ) -> WriteResult<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        let bytes = std::mem::take(&mut state.buffer);
        let len = bytes.len() as u64;
        self.buffered.store(0, Ordering::SeqCst);
        state
            .active
            .segment
            .write_all(bytes)
            .await
            .map_err(|err| WriteError::io(severity, action, err))?;
        state.active.appended += len;
        self.metrics.record_write(len);
        Ok(())
    }

    async fn sync_active(
        &self,
        state: &mut LogState,
        severity: Severity,
        action: &'static str,
    ) -> WriteResult<()> {
        if state.active.synced == state.active.appended {
            return Ok(());
        }
        state
            .active
            .segment
            .sync()
            .await
            .map_err(|err| WriteError::io(severity, action, err))?;
        state.active.synced = state.active.appended;
        self.metrics.record_sync();
        Ok(())
    }
}

fn next_id(ids: &mut Generator, severity: Severity) -> WriteResult<SegmentId> {
    ids.generate().map_err(|err| {
        WriteError::io(
            severity,
            "allocate log segment id",
            std::io::Error::other(err.to_string()),
        )
    })
}

impl fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogWriter")
            .field("active", &self.active_segment())
            .field("manual_flush", &self.manual_flush)
            .field("buffered", &self.buffered.load(Ordering::SeqCst))
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn mem() -> MemLogStorage {
        MemLogStorage::new().expect("mem log")
    }

    async fn writer(mem: &MemLogStorage, manual_flush: bool) -> LogWriter {
        let mut config = LogConfig::new(mem.storage());
        config.manual_flush = manual_flush;
        LogWriter::open(config).await.expect("open")
    }

    #[tokio::test]
    async fn append_frames_and_syncs() {
        let mem = mem();
        let log = writer(&mem, false).await;

        log.append(b"one", false).await.expect("append");
        log.append(b"two", true).await.expect("append");

        let image = mem.segment(log.active_segment()).await.expect("segment");
        let records = record::decode_all(&image).expect("decode");
        assert_eq!(records.len(), 2);
        assert_eq!(&records[1][..], b"two");

        let metrics = log.metrics().snapshot();
        assert_eq!(metrics.physical_writes, 2);
        assert_eq!(metrics.syncs, 1);
        assert_eq!(metrics.bytes_written, image.len() as u64);
        assert_eq!(mem.fs().write_count(), 2);
    }

    #[tokio::test]
    async fn manual_flush_buffers_until_flushed() {
        let mem = mem();
        let log = writer(&mem, true).await;

        log.append(b"buffered", false).await.expect("append");
        assert!(!log.is_buffer_empty());
        assert_eq!(mem.total_bytes().await, 0);

        log.flush(false).await.expect("flush");
        assert!(log.is_buffer_empty());
        assert_eq!(mem.total_bytes().await, record::RECORD_HEADER_SIZE + 8);

        // A sync request bypasses the buffer.
        log.append(b"durable", true).await.expect("append");
        assert!(log.is_buffer_empty());
        assert_eq!(log.metrics().snapshot().syncs, 1);
    }

    #[tokio::test]
    async fn buffer_limit_writes_out() {
        let mem = mem();
        let mut config = LogConfig::new(mem.storage());
        config.manual_flush = true;
        config.buffer_max_bytes = 32;
        let log = LogWriter::open(config).await.expect("open");

        log.append(&[0u8; 10], false).await.expect("append");
        assert!(!log.is_buffer_empty());
        log.append(&[0u8; 10], false).await.expect("append");
        assert!(log.is_buffer_empty());
        assert_eq!(mem.total_bytes().await, 36);
    }

    #[tokio::test]
    async fn rotation_failure_carries_severity_and_clears_buffer() {
        let mem = mem();
        let log = writer(&mem, true).await;
        log.append(b"pending", false).await.expect("append");

        mem.set_active(false);
        let err = log.rotate(Severity::Fatal).await.expect_err("medium down");
        assert_eq!(err.severity(), Some(Severity::Fatal));
        assert!(log.is_buffer_empty());

        mem.set_active(true);
        let first = log.active_segment();
        let second = log.rotate(Severity::Recoverable).await.expect("rotate");
        assert!(second > first);
        assert_eq!(log.segments().await, vec![first, second]);
        assert_eq!(mem.segment_ids().await, vec![first, second]);
    }

    #[tokio::test]
    async fn retire_before_removes_older_segments() {
        let mem = mem();
        let log = writer(&mem, false).await;
        let first = log.active_segment();
        let second = log.rotate(Severity::Fatal).await.expect("rotate");
        let third = log.rotate(Severity::Fatal).await.expect("rotate");

        assert_eq!(log.retire_before(third).await, 2);
        assert_eq!(mem.segment_ids().await, vec![third]);
        assert!(mem.segment(first).await.is_none());
        assert!(mem.segment(second).await.is_none());
        assert_eq!(log.metrics().snapshot().segments_retired, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lock_flushes_and_blocks_appends() {
        let mem = mem();
        let log = Arc::new(writer(&mem, true).await);
        log.append(b"value", false).await.expect("append");

        log.lock().await.expect("lock");
        assert!(log.is_buffer_empty());
        assert_eq!(log.metrics().snapshot().syncs, 1);
        log.lock().await.expect("re-entrant lock");

        let blocked = tokio::spawn({
            let log = log.clone();
            async move { log.append(b"later", false).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!blocked.is_finished());

        log.unlock().expect("unlock");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!blocked.is_finished());
        log.unlock().expect("unlock");

        blocked.await.expect("join").expect("append");
        assert!(log.unlock().expect_err("not locked").is_invalid_request());
    }
}
