//! Table versions and the super version read by the write path.

use std::sync::{Arc, RwLock};

use crate::{
    config::ConfigSnapshot,
    inmem::MemTable,
    ondisk::{TableId, TableMeta},
    wal::SegmentId,
};

pub(crate) const MAX_LEVEL: usize = 2;

pub type VersionRef = Arc<Version>;
pub type SuperVersionRef = Arc<SuperVersion>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum VersionEdit {
    Add { level: u8, table: TableMeta },
    Remove { level: u8, id: TableId },
}

/// Flushed tables per level. Level 0 is ordered oldest first.
#[derive(Debug, Clone, Default)]
pub struct Version {
    pub(crate) level_slice: [Vec<TableMeta>; MAX_LEVEL],
}

impl Version {
    pub fn level0(&self) -> &[TableMeta] {
        &self.level_slice[0]
    }

    pub fn level1(&self) -> &[TableMeta] {
        &self.level_slice[1]
    }

    pub(crate) fn apply_edits(&self, edits: Vec<VersionEdit>) -> Version {
        let mut next = self.clone();
        for edit in edits {
            match edit {
                VersionEdit::Add { level, table } => {
                    next.level_slice[level as usize].push(table);
                }
                VersionEdit::Remove { level, id } => {
                    if let Some(i) = next.level_slice[level as usize]
                        .iter()
                        .position(|table| table.id == id)
                    {
                        next.level_slice[level as usize].remove(i);
                    }
                }
            }
        }
        next
    }
}

/// Memtables plus table version, swapped as one unit.
///
/// `options` is the snapshot captured by whoever installed this super version
/// and may be older than the live options.
#[derive(Debug, Clone)]
pub struct SuperVersion {
    pub number: u64,
    pub mutable: Arc<MemTable>,
    /// Oldest first.
    pub immutables: Vec<Arc<MemTable>>,
    pub version: VersionRef,
    pub options: ConfigSnapshot,
}

impl SuperVersion {
    /// Log segment holding the oldest unflushed data.
    pub fn oldest_log_segment(&self) -> SegmentId {
        self.immutables
            .first()
            .map_or(self.mutable.log_segment(), |memtable| memtable.log_segment())
    }
}

/// Holder of the current super version.
#[derive(Debug)]
pub(crate) struct SuperVersionCell {
    current: RwLock<SuperVersionRef>,
}

impl SuperVersionCell {
    pub(crate) fn new(initial: SuperVersion) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub(crate) fn load(&self) -> SuperVersionRef {
        self.current.read().expect("super version poisoned").clone()
    }

    /// Install the super version built by `f` from the current one.
    pub(crate) fn install(
        &self,
        f: impl FnOnce(&SuperVersion) -> SuperVersion,
    ) -> SuperVersionRef {
        let mut current = self.current.write().expect("super version poisoned");
        let mut next = f(&current);
        next.number = current.number + 1;
        let next = Arc::new(next);
        *current = next.clone();
        next
    }
}
