//! FIFO writer queue with leader hand-off and group formation.
//!
//! Exactly one writer leads at a time. Everyone else waits in `pending`
//! holding the receiving half of a oneshot; the leader either completes them
//! as part of its group or, when it is done, hands leadership to the head of
//! the queue. The queue lock is only held for bookkeeping.

use std::{
    collections::VecDeque,
    mem,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use tokio::sync::oneshot;

use super::{
    batch::{WriteBatch, GROUP_MEMBER_HEADER},
    WriteOptions,
};
use crate::{
    error::{WriteError, WriteResult},
    wal::record::MAX_RECORD_PAYLOAD,
};

/// A batch as carried through the queue, encoded once at submission.
#[derive(Debug)]
pub(crate) struct BatchPayload {
    pub(crate) batch: WriteBatch,
    pub(crate) encoded: Bytes,
    pub(crate) options: WriteOptions,
}

impl BatchPayload {
    pub(crate) fn new(batch: WriteBatch, options: WriteOptions) -> WriteResult<Self> {
        let encoded = batch
            .encode()
            .map_err(|err| WriteError::InvalidRequest(err.to_string()))?;
        Ok(Self {
            batch,
            encoded,
            options,
        })
    }

    /// Bytes this batch adds to a group's log payload.
    fn group_bytes(&self) -> usize {
        if self.options.skip_log {
            0
        } else {
            GROUP_MEMBER_HEADER + self.encoded.len()
        }
    }
}

#[derive(Debug)]
pub(crate) enum Payload {
    Batch(BatchPayload),
    /// Control writer wanting the queue to itself.
    Exclusive,
}

impl Payload {
    fn no_slowdown(&self) -> bool {
        matches!(self, Payload::Batch(p) if p.options.no_slowdown)
    }

    pub(crate) fn into_batch(self) -> Option<BatchPayload> {
        match self {
            Payload::Batch(payload) => Some(payload),
            Payload::Exclusive => None,
        }
    }
}

pub(crate) enum Handoff {
    Lead(Leader),
    Done(WriteResult<()>),
}

struct Writer {
    payload: Payload,
    reply: oneshot::Sender<Handoff>,
}

#[derive(Default)]
struct QueueState {
    busy: bool,
    stalled: bool,
    pending: VecDeque<Writer>,
    next_group: u64,
    next_seq: u64,
}

pub(crate) enum Join {
    Lead(Leader),
    Wait(oneshot::Receiver<Handoff>),
    Rejected(WriteError),
}

/// The current leader and the payload it brought.
pub(crate) struct Leader {
    pub(crate) payload: Payload,
    pub(crate) leadership: Leadership,
}

/// Right to lead. Passed to the next writer when released or dropped.
pub(crate) struct Leadership {
    state: Arc<Mutex<QueueState>>,
    released: bool,
}

impl Leadership {
    pub(crate) fn hand_off(mut self) {
        self.released = true;
        hand_off(&self.state);
    }
}

impl Drop for Leadership {
    fn drop(&mut self) {
        if !self.released {
            hand_off(&self.state);
        }
    }
}

fn hand_off(shared: &Arc<Mutex<QueueState>>) {
    let mut state = shared.lock().expect("write queue poisoned");
    while let Some(writer) = state.pending.pop_front() {
        let leader = Leader {
            payload: writer.payload,
            leadership: Leadership {
                state: shared.clone(),
                released: false,
            },
        };
        match writer.reply.send(Handoff::Lead(leader)) {
            Ok(()) => return,
            Err(Handoff::Lead(mut unclaimed)) => {
                // The waiter went away; this leadership must not re-enter.
                unclaimed.leadership.released = true;
            }
            Err(Handoff::Done(_)) => {}
        }
    }
    state.busy = false;
}

/// Clears the stall flag when dropped.
pub(crate) struct StallGuard {
    state: Arc<Mutex<QueueState>>,
}

impl Drop for StallGuard {
    fn drop(&mut self) {
        self.state.lock().expect("write queue poisoned").stalled = false;
    }
}

/// One member of a formed group.
#[derive(Debug)]
pub(crate) struct GroupMember {
    pub(crate) batch: WriteBatch,
    pub(crate) encoded: Bytes,
    pub(crate) options: WriteOptions,
    pub(crate) first_seq: u64,
}

/// The leader's batch plus every batch queued at formation time.
pub(crate) struct WriteGroup {
    pub(crate) index: u64,
    /// Arrival order; the leader first.
    pub(crate) members: Vec<GroupMember>,
    pub(crate) last_seq: u64,
    followers: Vec<oneshot::Sender<Handoff>>,
}

impl WriteGroup {
    pub(crate) fn size(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn needs_sync(&self) -> bool {
        self.members.iter().any(|m| m.options.sync)
    }

    /// Members whose batch goes to the log.
    pub(crate) fn logged(&self) -> impl Iterator<Item = &GroupMember> {
        self.members.iter().filter(|m| !m.options.skip_log)
    }

    pub(crate) fn entries(&self) -> usize {
        self.members.iter().map(|m| m.batch.len()).sum()
    }

    /// Release every follower with `result`.
    pub(crate) fn complete(&mut self, result: &WriteResult<()>) {
        for follower in self.followers.drain(..) {
            let _ = follower.send(Handoff::Done(result.clone()));
        }
    }
}

impl Drop for WriteGroup {
    fn drop(&mut self) {
        self.complete(&Err(WriteError::Aborted));
    }
}

pub(crate) struct WriteQueue {
    state: Arc<Mutex<QueueState>>,
    max_group_bytes: usize,
}

impl WriteQueue {
    /// `first_seq` is the sequence number handed to the first entry.
    pub(crate) fn new(first_seq: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                next_seq: first_seq,
                ..QueueState::default()
            })),
            max_group_bytes: MAX_RECORD_PAYLOAD,
        }
    }

    #[cfg(test)]
    fn with_max_group_bytes(first_seq: u64, max_group_bytes: usize) -> Self {
        Self {
            max_group_bytes,
            ..Self::new(first_seq)
        }
    }

    pub(crate) fn join(&self, payload: Payload) -> Join {
        let mut state = self.state.lock().expect("write queue poisoned");
        if !state.busy {
            state.busy = true;
            return Join::Lead(Leader {
                payload,
                leadership: Leadership {
                    state: self.state.clone(),
                    released: false,
                },
            });
        }
        if state.stalled && payload.no_slowdown() {
            return Join::Rejected(WriteError::Incomplete("write stall"));
        }
        let (reply, rx) = oneshot::channel();
        state.pending.push_back(Writer { payload, reply });
        Join::Wait(rx)
    }

    /// Mark the queue stalled and fail every queued no-slowdown writer.
    ///
    /// Returns the guard that lifts the stall and the number of writers
    /// ejected.
    pub(crate) fn begin_stall(&self) -> (StallGuard, usize) {
        let mut state = self.state.lock().expect("write queue poisoned");
        state.stalled = true;
        let pending = mem::take(&mut state.pending);
        let mut ejected = 0;
        for writer in pending {
            if writer.payload.no_slowdown() {
                let _ = writer
                    .reply
                    .send(Handoff::Done(Err(WriteError::Incomplete("write stall"))));
                ejected += 1;
            } else {
                state.pending.push_back(writer);
            }
        }
        (
            StallGuard {
                state: self.state.clone(),
            },
            ejected,
        )
    }

    /// Close a group around `leader`. Writers up to the first exclusive one
    /// join, in arrival order, while the log payload stays within one record.
    pub(crate) fn form_group(&self, leader: BatchPayload) -> WriteGroup {
        let mut state = self.state.lock().expect("write queue poisoned");
        let mut group_bytes = leader.group_bytes();
        let mut payloads = vec![leader];
        let mut followers = Vec::new();
        while let Some(Writer {
            payload: Payload::Batch(next),
            ..
        }) = state.pending.front()
        {
            if group_bytes + next.group_bytes() > self.max_group_bytes {
                break;
            }
            group_bytes += next.group_bytes();
            if let Some(Writer {
                payload: Payload::Batch(payload),
                reply,
            }) = state.pending.pop_front()
            {
                payloads.push(payload);
                followers.push(reply);
            }
        }

        let index = state.next_group;
        state.next_group += 1;
        let mut members = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let first_seq = state.next_seq;
            state.next_seq += payload.batch.len() as u64;
            members.push(GroupMember {
                batch: payload.batch,
                encoded: payload.encoded,
                options: payload.options,
                first_seq,
            });
        }
        WriteGroup {
            index,
            members,
            last_seq: state.next_seq - 1,
            followers,
        }
    }

    /// Number of groups formed so far.
    pub(crate) fn formed(&self) -> u64 {
        self.state.lock().expect("write queue poisoned").next_group
    }

    /// Encoded bytes of the writers a group formed now would take.
    pub(crate) fn pending_bytes(&self) -> usize {
        let state = self.state.lock().expect("write queue poisoned");
        state
            .pending
            .iter()
            .map_while(|writer| match &writer.payload {
                Payload::Batch(payload) => Some(payload.encoded.len()),
                Payload::Exclusive => None,
            })
            .sum()
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.state.lock().expect("write queue poisoned").pending.len()
    }

    #[cfg(test)]
    fn is_stalled(&self) -> bool {
        self.state.lock().expect("write queue poisoned").stalled
    }
}
