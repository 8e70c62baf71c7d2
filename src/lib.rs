//! Concurrent write path of an LSM storage engine.
//!
//! Writers submit [`WriteBatch`]es to a [`Db`]. Concurrent writers are merged
//! into groups by a FIFO queue; the group leader runs admission control,
//! appends one record to the log and applies the group to the memtable.
//! Admission follows the flush and compaction backlog: writers are delayed
//! once the backlog crosses the soft thresholds and stopped at the hard ones.
//! Thresholds live in [`MutableOptions`] and can be changed while writers are
//! blocked.

mod observability;

pub mod checkpoint;
pub mod config;
mod db;
pub mod error;
pub mod executor;
pub mod inmem;
pub mod manifest;
pub mod ondisk;
pub mod option;
pub mod stall;
pub mod version;
pub mod wal;
pub mod write;

pub use crate::{
    checkpoint::{Checkpoint, CheckpointObserver},
    config::{ConfigSnapshot, MutableOptions, OptionsError},
    db::Db,
    error::{Severity, WriteError, WriteResult},
    manifest::{MetadataEvent, MetadataObserver, MetadataRecord},
    ondisk::{InMemoryTables, TableId, TableMeta, TableSink},
    option::{DbOptions, LogLocation},
    stall::{DelayPolicy, StallCondition, StallMetrics, TriggerType},
    wal::{FaultyFs, LogStorage, MemLogStorage},
    write::{FlushOptions, WriteBatch, WriteMode, WriteOptions},
};
