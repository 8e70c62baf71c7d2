//! Table output of flushes and compactions.
//!
//! The table format and the merge algorithm live behind [`TableSink`]. The
//! engine only needs table ids and their metadata to build versions.

use std::{
    collections::HashMap,
    fmt, io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use bytes::Bytes;
use futures_util::{future::BoxFuture, FutureExt};

use crate::inmem::InternalKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(pub u64);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    pub id: TableId,
    pub entries: usize,
    pub bytes: usize,
}

pub type TableEntries = Vec<(InternalKey, Option<Bytes>)>;

pub trait TableSink: Send + Sync {
    /// Persist the sorted `entries` of a flushed memtable.
    fn write_table(
        &self,
        id: TableId,
        entries: TableEntries,
    ) -> BoxFuture<'_, io::Result<TableMeta>>;

    /// Merge `inputs` into one table called `output`.
    fn merge_tables(
        &self,
        inputs: Vec<TableMeta>,
        output: TableId,
    ) -> BoxFuture<'_, io::Result<TableMeta>>;
}

/// Tables kept in memory, with an injectable failure switch.
#[derive(Debug, Default)]
pub struct InMemoryTables {
    tables: Mutex<HashMap<TableId, TableEntries>>,
    failing: AtomicBool,
}

impl InMemoryTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn table(&self, id: TableId) -> Option<TableEntries> {
        self.tables
            .lock()
            .expect("tables poisoned")
            .get(&id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.tables.lock().expect("tables poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(io::Error::other("table sink is failing"))
        } else {
            Ok(())
        }
    }
}

fn meta_of(id: TableId, entries: &TableEntries) -> TableMeta {
    let bytes = entries
        .iter()
        .map(|(key, value)| key.user_key.len() + value.as_ref().map_or(0, Bytes::len))
        .sum();
    TableMeta {
        id,
        entries: entries.len(),
        bytes,
    }
}

impl TableSink for InMemoryTables {
    fn write_table(
        &self,
        id: TableId,
        entries: TableEntries,
    ) -> BoxFuture<'_, io::Result<TableMeta>> {
        async move {
            self.check()?;
            let meta = meta_of(id, &entries);
            self.tables
                .lock()
                .expect("tables poisoned")
                .insert(id, entries);
            Ok(meta)
        }
        .boxed()
    }

    fn merge_tables(
        &self,
        inputs: Vec<TableMeta>,
        output: TableId,
    ) -> BoxFuture<'_, io::Result<TableMeta>> {
        async move {
            self.check()?;
            let mut tables = self.tables.lock().expect("tables poisoned");
            let mut merged = TableEntries::new();
            for input in &inputs {
                let entries = tables.remove(&input.id).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, format!("{} missing", input.id))
                })?;
                merged.extend(entries);
            }
            merged.sort_by(|a, b| a.0.cmp(&b.0));
            merged.dedup_by(|a, b| a.0 == b.0);
            let meta = meta_of(output, &merged);
            tables.insert(output, merged);
            Ok(meta)
        }
        .boxed()
    }
}
