//! Named points on the write and background paths where an observer may
//! suspend the engine. Tests use them to force interleavings.

use std::sync::Arc;

use futures_util::future::BoxFuture;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// A writer entered the queue. `leader` is true when it leads.
    WriterJoined { leader: bool },
    /// The leader is about to evaluate admission.
    LeaderBeforeAdmission,
    /// The leader marked the queue stalled.
    StallBegin,
    /// The leader finished waiting out a stall.
    StallEnd,
    /// A group was formed with `size` members.
    GroupFormed { size: usize },
    FlushJobStart,
    FlushJobInstalled,
    CompactionJobStart,
    CompactionJobBeforeInstall,
    CompactionInstalled,
}

pub trait CheckpointObserver: Send + Sync {
    fn reached(&self, checkpoint: Checkpoint) -> BoxFuture<'_, ()>;
}

#[derive(Clone, Default)]
pub(crate) struct Checkpoints {
    observer: Option<Arc<dyn CheckpointObserver>>,
}

impl Checkpoints {
    pub(crate) fn new(observer: Option<Arc<dyn CheckpointObserver>>) -> Self {
        Self { observer }
    }

    pub(crate) async fn reach(&self, checkpoint: Checkpoint) {
        if let Some(observer) = &self.observer {
            observer.reached(checkpoint).await;
        }
    }
}
