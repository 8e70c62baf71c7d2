use std::sync::{atomic::Ordering, Arc};

use super::DbInner;
use crate::{
    checkpoint::Checkpoint,
    error::{Severity, WriteError, WriteResult},
    inmem::MemTable,
    observability::{log_debug, log_info},
    stall::{trigger::report_load, StallCondition},
    version::{SuperVersion, SuperVersionRef},
    write::{
        batch::{self, WriteBatch},
        queue::{BatchPayload, Handoff, Join, Leadership, Payload, WriteGroup},
        WriteMode, WriteOptions,
    },
};

impl DbInner {
    pub(crate) async fn write(&self, batch: WriteBatch, options: WriteOptions) -> WriteResult<()> {
        options.validate()?;
        self.check_open()?;
        self.errors.check()?;

        let payload = Payload::Batch(BatchPayload::new(batch, options)?);
        let leader = match self.queue.join(payload) {
            Join::Lead(leader) => {
                self.checkpoints
                    .reach(Checkpoint::WriterJoined { leader: true })
                    .await;
                leader
            }
            Join::Rejected(err) => {
                self.controller.record_rejected(1);
                return Err(err);
            }
            Join::Wait(rx) => {
                self.checkpoints
                    .reach(Checkpoint::WriterJoined { leader: false })
                    .await;
                match rx.await {
                    Ok(Handoff::Lead(leader)) => leader,
                    Ok(Handoff::Done(result)) => return result,
                    Err(_) => return Err(WriteError::Aborted),
                }
            }
        };

        let Some(payload) = leader.payload.into_batch() else {
            return Err(WriteError::Aborted);
        };
        self.lead(payload, leader.leadership).await
    }

    /// Run a group as its leader: admission, formation, log, apply.
    async fn lead(&self, payload: BatchPayload, leadership: Leadership) -> WriteResult<()> {
        self.check_open()?;
        self.errors.check()?;
        self.checkpoints.reach(Checkpoint::LeaderBeforeAdmission).await;

        if self.trigger.is_exceeded(&self.store.live()) {
            self.sequencer.wait_drained(self.queue.formed()).await;
            self.switch_memtable(&leadership, Severity::Fatal).await?;
        }

        if self.controller.condition() != StallCondition::Normal {
            self.wait_out_stall(&payload).await?;
        }

        let mut group = self.queue.form_group(payload);
        // Taken before the first await so a dropped leader still frees its turn.
        let ticket = self.sequencer.ticket(group.index);
        self.checkpoints
            .reach(Checkpoint::GroupFormed { size: group.size() })
            .await;

        let logged = self.append_group(&group).await;
        if let Err(err) = &logged {
            self.errors.record(err);
        }

        let result = match self.write_mode {
            WriteMode::Sequential => {
                let result = logged.map(|()| self.apply_group(&group));
                drop(ticket);
                group.complete(&result);
                leadership.hand_off();
                result
            }
            WriteMode::Pipelined => {
                leadership.hand_off();
                ticket.wait_turn().await;
                let result = logged.map(|()| self.apply_group(&group));
                drop(ticket);
                group.complete(&result);
                result
            }
        };
        if let Err(err) = &result {
            log_debug!(
                component = "write",
                event = "group_failed",
                group = group.index,
                size = group.size(),
                error = %err,
            );
        }
        result
    }

    async fn wait_out_stall(&self, payload: &BatchPayload) -> WriteResult<()> {
        if payload.options.no_slowdown {
            self.controller.record_rejected(1);
            return Err(WriteError::Incomplete("write stall"));
        }

        let group_bytes = payload.encoded.len() + self.queue.pending_bytes();
        let (stall, ejected) = self.queue.begin_stall();
        self.controller.record_rejected(ejected);
        log_debug!(
            component = "write",
            event = "stall_begin",
            condition = ?self.controller.condition(),
            ejected,
        );
        self.checkpoints.reach(Checkpoint::StallBegin).await;

        let admitted = self.controller.wait_until_admitted(group_bytes).await;
        drop(stall);
        self.checkpoints.reach(Checkpoint::StallEnd).await;
        log_debug!(component = "write", event = "stall_end", admitted = admitted.is_ok());
        admitted?;

        self.errors.check()
    }

    async fn append_group(&self, group: &WriteGroup) -> WriteResult<()> {
        let members: Vec<_> = group
            .logged()
            .map(|member| (member.first_seq, &member.encoded))
            .collect();
        if members.is_empty() {
            return Ok(());
        }
        let payload = batch::encode_group(members);
        self.log.append(&payload, group.needs_sync()).await
    }

    fn apply_group(&self, group: &WriteGroup) {
        let sv = self.super_version.load();
        let mut bytes = 0;
        for member in &group.members {
            sv.mutable.apply(&member.batch, member.first_seq);
            bytes += member.batch.approx_bytes();
        }
        self.trigger.record(group.entries(), bytes);
        self.visible_seq.fetch_max(group.last_seq, Ordering::SeqCst);
    }

    /// Take the queue for a control operation.
    ///
    /// In pipelined mode this also waits until every formed group has been
    /// applied, so the memtable is quiescent when the leadership is returned.
    pub(crate) async fn enter_unbatched(&self) -> WriteResult<Leadership> {
        self.check_open()?;
        let leadership = match self.queue.join(Payload::Exclusive) {
            Join::Lead(leader) => leader.leadership,
            Join::Rejected(err) => return Err(err),
            Join::Wait(rx) => match rx.await {
                Ok(Handoff::Lead(leader)) => leader.leadership,
                Ok(Handoff::Done(result)) => {
                    result?;
                    return Err(WriteError::Aborted);
                }
                Err(_) => return Err(WriteError::Aborted),
            },
        };
        if self.write_mode == WriteMode::Pipelined {
            self.sequencer.wait_drained(self.queue.formed()).await;
        }
        Ok(leadership)
    }

    /// Seal the mutable memtable onto a fresh log segment.
    ///
    /// Requires leadership. A failure is recorded with `severity`.
    pub(crate) async fn switch_memtable(
        &self,
        _leadership: &Leadership,
        severity: Severity,
    ) -> WriteResult<SuperVersionRef> {
        let current = self.super_version.load();
        if current.mutable.is_empty() {
            return Ok(current);
        }

        let segment = match self.log.rotate(severity).await {
            Ok(segment) => segment,
            Err(err) => {
                self.errors.record(&err);
                return Err(err);
            }
        };
        let id = self.next_memtable_id.fetch_add(1, Ordering::SeqCst);
        let memtable = Arc::new(MemTable::new(id, segment));
        let options = self.store.live();
        let installed = self.super_version.install(|sv| {
            let mut immutables = sv.immutables.clone();
            immutables.push(sv.mutable.clone());
            SuperVersion {
                number: sv.number,
                mutable: memtable,
                immutables,
                version: sv.version.clone(),
                options,
            }
        });
        self.trigger.reset();
        report_load(&self.controller, &installed, "memtable_switch");
        log_info!(
            component = "write",
            event = "memtable_switched",
            sealed = current.mutable.id(),
            sealed_entries = current.mutable.len(),
            memtable = id,
            segment = %segment,
            pending_flush = installed.immutables.len(),
        );
        self.schedule_flush();
        Ok(installed)
    }

    pub(crate) async fn rotate_log(&self) -> WriteResult<()> {
        self.errors.check()?;
        let leadership = self.enter_unbatched().await?;
        let result = self.log.rotate(Severity::Fatal).await;
        leadership.hand_off();
        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                self.errors.record(&err);
                Err(err)
            }
        }
    }

    pub(crate) async fn resume(&self) -> WriteResult<()> {
        match self.errors.current() {
            None => return Ok(()),
            Some(err) if err.severity() == Some(Severity::Fatal) => return Err(err),
            Some(_) => {}
        }
        let leadership = self.enter_unbatched().await?;
        let rotated = self.log.rotate(Severity::Recoverable).await;
        let result = rotated.and_then(|_| self.errors.clear_recoverable());
        leadership.hand_off();
        if result.is_ok() {
            log_info!(component = "write", event = "engine_resumed");
        }
        result
    }
}
