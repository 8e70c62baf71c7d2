use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use crate::{observability::log_debug, ondisk::TableId};

/// Metadata-affecting engine events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataEvent {
    /// Persisted mutable options changed.
    OptionsChanged { names: Vec<String> },
    /// An immutable memtable was flushed into a level-0 table.
    FlushInstalled { memtable: u64, table: TableId },
    /// Level-0 tables were merged into level 1.
    CompactionInstalled {
        inputs: Vec<TableId>,
        outputs: Vec<TableId>,
    },
}

impl fmt::Display for MetadataEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataEvent::OptionsChanged { names } => {
                write!(f, "options changed: {}", names.join(","))
            }
            MetadataEvent::FlushInstalled { memtable, table } => {
                write!(f, "memtable {memtable} flushed to {table}")
            }
            MetadataEvent::CompactionInstalled { inputs, outputs } => {
                write!(f, "compacted {} tables into {}", inputs.len(), outputs.len())
            }
        }
    }
}

/// Receives every metadata record, e.g. to replicate it.
///
/// The returned token is stored next to the record.
pub trait MetadataObserver: Send + Sync {
    fn on_record(&self, event: &MetadataEvent) -> String;
}

#[derive(Debug, Clone)]
pub struct MetadataRecord {
    pub seq: u64,
    pub event: MetadataEvent,
    pub token: Option<String>,
}

/// Records kept by [`MetadataLog`]; older ones are dropped.
pub(crate) const MAX_RETAINED_RECORDS: usize = 1024;

/// In-memory metadata log with a monotonic update sequence.
///
/// Only the newest [`MAX_RETAINED_RECORDS`] records are kept. The sequence
/// keeps counting past dropped records.
pub(crate) struct MetadataLog {
    seq: AtomicU64,
    records: Mutex<VecDeque<MetadataRecord>>,
    observer: Option<Arc<dyn MetadataObserver>>,
}

impl MetadataLog {
    pub(crate) fn new(observer: Option<Arc<dyn MetadataObserver>>) -> Self {
        Self {
            seq: AtomicU64::new(0),
            records: Mutex::new(VecDeque::new()),
            observer,
        }
    }

    /// Append `event`, bumping the update sequence by one.
    pub(crate) fn record(&self, event: MetadataEvent) -> u64 {
        let mut records = self.records.lock().expect("metadata log poisoned");
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self
            .observer
            .as_ref()
            .map(|observer| observer.on_record(&event));
        log_debug!(
            component = "manifest",
            event = "metadata_recorded",
            seq,
            record = %event,
        );
        if records.len() == MAX_RETAINED_RECORDS {
            records.pop_front();
        }
        records.push_back(MetadataRecord { seq, event, token });
        seq
    }

    pub(crate) fn update_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    pub(crate) fn records(&self) -> Vec<MetadataRecord> {
        let records = self.records.lock().expect("metadata log poisoned");
        records.iter().cloned().collect()
    }
}

impl fmt::Debug for MetadataLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataLog")
            .field("seq", &self.update_seq())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}
