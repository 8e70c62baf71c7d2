use std::{
    fmt,
    pin::pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tokio::sync::Notify;

use super::policy::{DelayContext, DelayPolicy};
use crate::{
    config::MutableOptions,
    error::{WriteError, WriteResult},
    observability::{log_debug, log_info},
};

/// Load signals reported by the engine after switches, flushes and
/// compactions. Jobs never report thresholds or a decision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadMetrics {
    /// Immutable memtables waiting to be flushed.
    pub pending_flush: usize,
    /// Tables in level 0.
    pub l0_files: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StallCause {
    MemtableLimit,
    Level0Limit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StallCondition {
    Normal,
    Delayed { cause: StallCause, excess: u64 },
    Stopped { cause: StallCause },
}

/// Thresholds taken from the live options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StallThresholds {
    pub max_write_buffers: usize,
    pub slowdown_write_buffers: Option<usize>,
    pub l0_slowdown: usize,
    pub l0_stop: usize,
}

impl From<&MutableOptions> for StallThresholds {
    fn from(options: &MutableOptions) -> Self {
        Self {
            max_write_buffers: options.max_write_buffer_number,
            slowdown_write_buffers: options.slowdown_write_buffers(),
            l0_slowdown: options.level0_slowdown_writes_trigger,
            l0_stop: options.level0_stop_writes_trigger,
        }
    }
}

impl StallThresholds {
    pub fn evaluate(&self, load: &LoadMetrics) -> StallCondition {
        if load.pending_flush >= self.max_write_buffers {
            return StallCondition::Stopped {
                cause: StallCause::MemtableLimit,
            };
        }
        if load.l0_files >= self.l0_stop {
            return StallCondition::Stopped {
                cause: StallCause::Level0Limit,
            };
        }

        let memtable_excess = self
            .slowdown_write_buffers
            .filter(|soft| load.pending_flush >= *soft)
            .map(|soft| (load.pending_flush - soft + 1) as u64);
        let l0_excess = (load.l0_files >= self.l0_slowdown)
            .then(|| (load.l0_files - self.l0_slowdown + 1) as u64);

        match (memtable_excess, l0_excess) {
            (None, None) => StallCondition::Normal,
            (Some(m), Some(l)) if l > m => StallCondition::Delayed {
                cause: StallCause::Level0Limit,
                excess: l,
            },
            (Some(m), _) => StallCondition::Delayed {
                cause: StallCause::MemtableLimit,
                excess: m,
            },
            (None, Some(l)) => StallCondition::Delayed {
                cause: StallCause::Level0Limit,
                excess: l,
            },
        }
    }
}

/// Snapshot of controller counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StallMetrics {
    /// Groups that had to wait for a stop to clear.
    pub stops: u64,
    /// Groups that were delayed.
    pub delays: u64,
    /// Writers refused with `Incomplete`.
    pub rejected: u64,
}

#[derive(Debug)]
struct AdmissionState {
    stall_disabled: bool,
    load: LoadMetrics,
    thresholds: StallThresholds,
    condition: StallCondition,
    closed: bool,
}

impl AdmissionState {
    fn recompute(&mut self) {
        self.condition = if self.stall_disabled {
            StallCondition::Normal
        } else {
            self.thresholds.evaluate(&self.load)
        };
    }
}

/// Admission controller shared by the write path and the background worker.
pub struct WriteController {
    state: Mutex<AdmissionState>,
    wake: Notify,
    policy: Arc<dyn DelayPolicy>,
    stops: AtomicU64,
    delays: AtomicU64,
    rejected: AtomicU64,
}

impl WriteController {
    pub fn new(options: &MutableOptions, policy: Arc<dyn DelayPolicy>) -> Self {
        let mut state = AdmissionState {
            stall_disabled: options.disable_write_stall,
            load: LoadMetrics::default(),
            thresholds: options.into(),
            condition: StallCondition::Normal,
            closed: false,
        };
        state.recompute();
        Self {
            state: Mutex::new(state),
            wake: Notify::new(),
            policy,
            stops: AtomicU64::new(0),
            delays: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn condition(&self) -> StallCondition {
        self.state.lock().expect("controller poisoned").condition
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.condition(), StallCondition::Stopped { .. })
    }

    pub fn is_delayed(&self) -> bool {
        matches!(self.condition(), StallCondition::Delayed { .. })
    }

    pub fn load(&self) -> LoadMetrics {
        self.state.lock().expect("controller poisoned").load
    }

    pub fn metrics(&self) -> StallMetrics {
        StallMetrics {
            stops: self.stops.load(Ordering::Relaxed),
            delays: self.delays.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn update_load(&self, load: LoadMetrics) {
        self.transition(|state| state.load = load);
    }

    /// Adopt the thresholds and the stall toggle of `options`.
    pub fn reconfigure(&self, options: &MutableOptions) {
        self.transition(|state| {
            state.thresholds = options.into();
            state.stall_disabled = options.disable_write_stall;
        });
    }

    /// Release every waiter with `ShutdownInProgress`.
    pub fn shutdown(&self) {
        self.transition(|state| state.closed = true);
    }

    pub(crate) fn record_rejected(&self, writers: usize) {
        self.rejected.fetch_add(writers as u64, Ordering::Relaxed);
    }

    fn transition(&self, f: impl FnOnce(&mut AdmissionState)) {
        let (before, after) = {
            let mut state = self.state.lock().expect("controller poisoned");
            let before = state.condition;
            f(&mut state);
            state.recompute();
            (before, state.condition)
        };
        if before != after {
            log_info!(
                component = "stall",
                event = "condition_changed",
                from = ?before,
                to = ?after,
            );
        }
        self.wake.notify_waiters();
    }

    /// Wait until a group of `group_bytes` may be written.
    ///
    /// A delayed group waits once; a wake during the delay re-evaluates. A
    /// stopped group waits for a wake that lifts the stop.
    pub(crate) async fn wait_until_admitted(&self, group_bytes: usize) -> WriteResult<()> {
        let mut delayed = false;
        let mut stopped = false;
        loop {
            let mut notified = pin!(self.wake.notified());
            notified.as_mut().enable();

            let (condition, closed) = {
                let state = self.state.lock().expect("controller poisoned");
                (state.condition, state.closed)
            };
            if closed {
                return Err(WriteError::ShutdownInProgress);
            }
            match condition {
                StallCondition::Normal => return Ok(()),
                StallCondition::Delayed { excess, .. } => {
                    if delayed {
                        return Ok(());
                    }
                    delayed = true;
                    self.delays.fetch_add(1, Ordering::Relaxed);
                    let delay = self.policy.delay(&DelayContext {
                        excess,
                        group_bytes,
                    });
                    if delay.is_zero() {
                        return Ok(());
                    }
                    log_debug!(
                        component = "stall",
                        event = "write_delayed",
                        delay_us = delay.as_micros() as u64,
                        excess,
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => return Ok(()),
                        _ = notified => {}
                    }
                }
                StallCondition::Stopped { cause } => {
                    if !stopped {
                        stopped = true;
                        self.stops.fetch_add(1, Ordering::Relaxed);
                        log_debug!(
                            component = "stall",
                            event = "write_stopped",
                            cause = ?cause,
                        );
                    }
                    notified.await;
                }
            }
        }
    }
}

impl fmt::Debug for WriteController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteController")
            .field("state", &*self.state.lock().expect("controller poisoned"))
            .finish()
    }
}
