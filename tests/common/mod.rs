//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::{
    pin::pin,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use futures_util::{future::BoxFuture, FutureExt};
use tokio::sync::Notify;
use tonbo_ingest::{Checkpoint, CheckpointObserver, Db, DbOptions, MemLogStorage};

#[derive(Default)]
struct GateState {
    seen: Vec<Checkpoint>,
    held: Vec<Checkpoint>,
    blocked: Vec<Checkpoint>,
}

/// Checkpoint observer that records every checkpoint and can hold tasks at
/// chosen ones until released.
#[derive(Default)]
pub struct Gates {
    state: Mutex<GateState>,
    changed: Notify,
}

impl Gates {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn hold(&self, checkpoint: Checkpoint) {
        self.state.lock().unwrap().held.push(checkpoint);
    }

    pub fn release(&self, checkpoint: Checkpoint) {
        self.state.lock().unwrap().held.retain(|c| *c != checkpoint);
        self.changed.notify_waiters();
    }

    pub fn count(&self, checkpoint: Checkpoint) -> usize {
        let state = self.state.lock().unwrap();
        state.seen.iter().filter(|c| **c == checkpoint).count()
    }

    /// Wait until `checkpoint` has been reached `n` times.
    pub async fn wait_seen(&self, checkpoint: Checkpoint, n: usize) {
        self.wait_for(|state| state.seen.iter().filter(|c| **c == checkpoint).count() >= n)
            .await;
    }

    /// Wait until `n` tasks are held at `checkpoint`.
    pub async fn wait_blocked(&self, checkpoint: Checkpoint, n: usize) {
        self.wait_for(|state| state.blocked.iter().filter(|c| **c == checkpoint).count() >= n)
            .await;
    }

    async fn wait_for(&self, mut done: impl FnMut(&GateState) -> bool) {
        loop {
            let mut changed = pin!(self.changed.notified());
            changed.as_mut().enable();
            if done(&self.state.lock().unwrap()) {
                return;
            }
            changed.await;
        }
    }
}

impl CheckpointObserver for Gates {
    fn reached(&self, checkpoint: Checkpoint) -> BoxFuture<'_, ()> {
        async move {
            self.state.lock().unwrap().seen.push(checkpoint);
            self.changed.notify_waiters();

            let mut blocked = false;
            loop {
                let mut changed = pin!(self.changed.notified());
                changed.as_mut().enable();
                let newly_blocked = {
                    let mut state = self.state.lock().unwrap();
                    if !state.held.contains(&checkpoint) {
                        if blocked {
                            if let Some(i) = state.blocked.iter().position(|c| *c == checkpoint) {
                                state.blocked.remove(i);
                            }
                        }
                        break;
                    }
                    if blocked {
                        false
                    } else {
                        state.blocked.push(checkpoint);
                        blocked = true;
                        true
                    }
                };
                if newly_blocked {
                    self.changed.notify_waiters();
                }
                changed.await;
            }
        }
        .boxed()
    }
}

/// Options over a fresh in-memory log, returning the medium for inspection.
pub fn mem_options() -> (DbOptions, MemLogStorage) {
    let storage = MemLogStorage::new().unwrap();
    let options = DbOptions::default().log_storage(storage.storage());
    (options, storage)
}

pub fn value(len: usize) -> Bytes {
    Bytes::from(vec![b'v'; len])
}

/// Put `key` and flush it into a level-0 table.
pub async fn put_and_flush(db: &Db, key: &str) {
    db.put(key.to_string(), "value", Default::default())
        .await
        .unwrap();
    db.flush(Default::default()).await.unwrap();
}
