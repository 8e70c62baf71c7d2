//! Group commit: the writer queue, write batches and the apply sequencer.

pub mod batch;
pub(crate) mod queue;
pub(crate) mod sequencer;

pub use batch::{BatchDecodeError, BatchOp, WriteBatch};

use crate::error::{WriteError, WriteResult};

/// How a formed group is committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// One leader logs, applies and releases its group before the next
    /// leader starts.
    #[default]
    Sequential,
    /// The next leader may log while earlier groups are still applying.
    Pipelined,
}

/// Per-write durability and admission requirements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Sync the log before acknowledging.
    pub sync: bool,
    /// Do not write the batch to the log.
    pub skip_log: bool,
    /// Fail with `Incomplete` instead of waiting out a stall.
    pub no_slowdown: bool,
}

impl WriteOptions {
    pub fn sync(self, sync: bool) -> Self {
        WriteOptions { sync, ..self }
    }

    pub fn skip_log(self, skip_log: bool) -> Self {
        WriteOptions { skip_log, ..self }
    }

    pub fn no_slowdown(self, no_slowdown: bool) -> Self {
        WriteOptions {
            no_slowdown,
            ..self
        }
    }

    pub(crate) fn validate(&self) -> WriteResult<()> {
        if self.sync && self.skip_log {
            return Err(WriteError::InvalidRequest(
                "sync is not allowed for writes that skip the log".into(),
            ));
        }
        Ok(())
    }
}

/// Manual memtable flush request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOptions {
    /// Wait until the flush is installed.
    pub wait: bool,
    /// Switch the memtable even when that stops writes.
    pub allow_write_stall: bool,
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self {
            wait: true,
            allow_write_stall: false,
        }
    }
}

impl FlushOptions {
    pub fn wait(self, wait: bool) -> Self {
        FlushOptions { wait, ..self }
    }

    pub fn allow_write_stall(self, allow_write_stall: bool) -> Self {
        FlushOptions {
            allow_write_stall,
            ..self
        }
    }
}
