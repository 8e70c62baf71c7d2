//! Apply ordering for write groups.
//!
//! Groups are numbered at formation time. Group `n` applies only after every
//! group before it has finished or has been abandoned, so visibility follows
//! formation order even when several leaders are in flight.

use std::{collections::BTreeSet, pin::pin, sync::Mutex};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct SequencerState {
    next: u64,
    /// Finished out of turn; skipped once `next` reaches them.
    abandoned: BTreeSet<u64>,
}

#[derive(Debug, Default)]
pub(crate) struct ApplySequencer {
    state: Mutex<SequencerState>,
    turn: Notify,
}

impl ApplySequencer {
    pub(crate) fn ticket(&self, index: u64) -> ApplyTicket<'_> {
        ApplyTicket {
            sequencer: self,
            index,
        }
    }

    /// Index of the next group allowed to apply.
    pub(crate) fn next(&self) -> u64 {
        self.state.lock().expect("sequencer poisoned").next
    }

    /// Wait until every group numbered below `formed` has finished.
    pub(crate) async fn wait_drained(&self, formed: u64) {
        loop {
            let mut notified = pin!(self.turn.notified());
            notified.as_mut().enable();
            if self.next() >= formed {
                return;
            }
            notified.await;
        }
    }

    fn finish(&self, index: u64) {
        {
            let mut state = self.state.lock().expect("sequencer poisoned");
            if state.next == index {
                state.next += 1;
                loop {
                    let next = state.next;
                    if !state.abandoned.remove(&next) {
                        break;
                    }
                    state.next += 1;
                }
            } else if index > state.next {
                state.abandoned.insert(index);
            }
        }
        self.turn.notify_waiters();
    }
}

/// A group's place in the apply order. Dropping the ticket releases the turn.
#[derive(Debug)]
pub(crate) struct ApplyTicket<'a> {
    sequencer: &'a ApplySequencer,
    index: u64,
}

impl ApplyTicket<'_> {
    #[cfg(test)]
    fn index(&self) -> u64 {
        self.index
    }

    pub(crate) async fn wait_turn(&self) {
        loop {
            let mut notified = pin!(self.sequencer.turn.notified());
            notified.as_mut().enable();
            if self.sequencer.next() == self.index {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for ApplyTicket<'_> {
    fn drop(&mut self) {
        self.sequencer.finish(self.index);
    }
}
