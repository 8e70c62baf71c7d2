use std::{
    cmp::Reverse,
    ops::Bound,
    sync::atomic::{AtomicUsize, Ordering},
};

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;

use crate::{
    wal::SegmentId,
    write::{BatchOp, WriteBatch},
};

/// User key with the sequence that wrote it. Newer versions of a key sort
/// first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct InternalKey {
    pub user_key: Bytes,
    pub seq: Reverse<u64>,
}

impl InternalKey {
    pub fn new(user_key: Bytes, seq: u64) -> Self {
        Self {
            user_key,
            seq: Reverse(seq),
        }
    }
}

/// Skiplist memtable. `None` values are tombstones.
#[derive(Debug)]
pub struct MemTable {
    id: u64,
    data: SkipMap<InternalKey, Option<Bytes>>,
    approx_bytes: AtomicUsize,
    log_segment: SegmentId,
}

impl MemTable {
    pub(crate) fn new(id: u64, log_segment: SegmentId) -> Self {
        Self {
            id,
            data: SkipMap::new(),
            approx_bytes: AtomicUsize::new(0),
            log_segment,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Segment that was active when this memtable was created.
    pub fn log_segment(&self) -> SegmentId {
        self.log_segment
    }

    /// Apply `batch`, the first operation at `first_seq`.
    pub(crate) fn apply(&self, batch: &WriteBatch, first_seq: u64) {
        for (offset, op) in batch.ops().iter().enumerate() {
            let seq = first_seq + offset as u64;
            match op {
                BatchOp::Put { key, value } => {
                    self.data
                        .insert(InternalKey::new(key.clone(), seq), Some(value.clone()));
                }
                BatchOp::Delete { key } => {
                    self.data.insert(InternalKey::new(key.clone(), seq), None);
                }
            }
        }
        self.approx_bytes
            .fetch_add(batch.approx_bytes(), Ordering::Relaxed);
    }

    /// Latest version of `key`: `Some(None)` for a tombstone.
    pub fn get(&self, key: &[u8]) -> Option<Option<Bytes>> {
        let lookup = InternalKey::new(Bytes::copy_from_slice(key), u64::MAX);
        self.data
            .range((Bound::Included(lookup), Bound::Unbounded))
            .next()
            .and_then(|entry| {
                if entry.key().user_key == key {
                    Some(entry.value().clone())
                } else {
                    None
                }
            })
    }

    /// Every version, in key order.
    pub fn entries(&self) -> Vec<(InternalKey, Option<Bytes>)> {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn approx_bytes(&self) -> usize {
        self.approx_bytes.load(Ordering::Relaxed)
    }
}
