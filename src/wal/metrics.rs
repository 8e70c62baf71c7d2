//! Counters for the durable log writer.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`LogMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogMetricsSnapshot {
    /// Framed bytes written to segments.
    pub bytes_written: u64,
    /// Records appended, buffered ones included.
    pub records: u64,
    /// Write calls issued to the medium.
    pub physical_writes: u64,
    /// Sync calls issued to the medium.
    pub syncs: u64,
    pub rotations: u64,
    pub segments_retired: u64,
}

#[derive(Debug, Default)]
pub struct LogMetrics {
    bytes_written: AtomicU64,
    records: AtomicU64,
    physical_writes: AtomicU64,
    syncs: AtomicU64,
    rotations: AtomicU64,
    segments_retired: AtomicU64,
}

impl LogMetrics {
    pub(crate) fn record_write(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.physical_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_append(&self) {
        self.records.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sync(&self) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rotation(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retired(&self, segments: u64) {
        self.segments_retired.fetch_add(segments, Ordering::Relaxed);
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> LogMetricsSnapshot {
        LogMetricsSnapshot {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            physical_writes: self.physical_writes.load(Ordering::Relaxed),
            syncs: self.syncs.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            segments_retired: self.segments_retired.load(Ordering::Relaxed),
        }
    }
}
