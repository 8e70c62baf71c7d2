//! Memtable freeze triggers and the load report fed to the controller.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use super::controller::{LoadMetrics, WriteController};
use crate::{config::MutableOptions, observability::log_debug, version::SuperVersion};

/// Decides when the mutable memtable is full.
pub trait FreezeTrigger: Send + Sync {
    /// Account for a batch applied to the mutable memtable.
    fn record(&self, entries: usize, bytes: usize);

    fn is_exceeded(&self, options: &MutableOptions) -> bool;

    fn reset(&self);
}

/// Fires once `write_buffer_size` bytes have been applied. The limit is read
/// from the live options on every check.
#[derive(Debug, Default)]
pub struct WriteBufferSizeTrigger {
    current_size: AtomicUsize,
}

impl FreezeTrigger for WriteBufferSizeTrigger {
    fn record(&self, _entries: usize, bytes: usize) {
        self.current_size.fetch_add(bytes, Ordering::SeqCst);
    }

    fn is_exceeded(&self, options: &MutableOptions) -> bool {
        self.current_size.load(Ordering::SeqCst) >= options.write_buffer_size
    }

    fn reset(&self) {
        self.current_size.store(0, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct SizeOfMemTrigger {
    threshold: usize,
    current_size: AtomicUsize,
}

impl SizeOfMemTrigger {
    pub fn new(max_size: usize) -> Self {
        Self {
            threshold: max_size,
            current_size: AtomicUsize::new(0),
        }
    }
}

impl FreezeTrigger for SizeOfMemTrigger {
    fn record(&self, _entries: usize, bytes: usize) {
        self.current_size.fetch_add(bytes, Ordering::SeqCst);
    }

    fn is_exceeded(&self, _: &MutableOptions) -> bool {
        self.current_size.load(Ordering::SeqCst) >= self.threshold
    }

    fn reset(&self) {
        self.current_size.store(0, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct LengthTrigger {
    threshold: usize,
    count: AtomicUsize,
}

impl LengthTrigger {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            count: AtomicUsize::new(0),
        }
    }
}

impl FreezeTrigger for LengthTrigger {
    fn record(&self, entries: usize, _bytes: usize) {
        self.count.fetch_add(entries, Ordering::SeqCst);
    }

    fn is_exceeded(&self, _: &MutableOptions) -> bool {
        self.count.load(Ordering::SeqCst) >= self.threshold
    }

    fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub enum TriggerType {
    /// Follow the live `write_buffer_size`.
    #[default]
    WriteBufferSize,
    SizeOfMem(usize),
    Length(usize),
}

pub(crate) struct TriggerFactory;

impl TriggerFactory {
    pub fn create(trigger_type: TriggerType) -> Arc<dyn FreezeTrigger> {
        match trigger_type {
            TriggerType::WriteBufferSize => Arc::new(WriteBufferSizeTrigger::default()),
            TriggerType::SizeOfMem(threshold) => Arc::new(SizeOfMemTrigger::new(threshold)),
            TriggerType::Length(threshold) => Arc::new(LengthTrigger::new(threshold)),
        }
    }
}

/// Load signals of an installed super version.
pub(crate) fn load_of(sv: &SuperVersion) -> LoadMetrics {
    LoadMetrics {
        pending_flush: sv.immutables.len(),
        l0_files: sv.version.level0().len(),
    }
}

/// Recompute the load of `sv` and hand it to the controller.
pub(crate) fn report_load(controller: &WriteController, sv: &SuperVersion, reason: &'static str) {
    let load = load_of(sv);
    log_debug!(
        component = "stall",
        event = "load_reported",
        reason,
        pending_flush = load.pending_flush,
        l0_files = load.l0_files,
    );
    controller.update_load(load);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_of_mem_trigger() {
        let options = MutableOptions::default();
        let trigger = SizeOfMemTrigger::new(21);

        trigger.record(1, 20);
        assert!(
            !trigger.is_exceeded(&options),
            "Trigger should not be exceeded after 20 bytes"
        );
        trigger.record(1, 1);
        assert!(trigger.is_exceeded(&options));

        trigger.reset();
        assert!(
            !trigger.is_exceeded(&options),
            "Trigger should not be exceeded after reset"
        );
    }

    #[test]
    fn test_length_trigger() {
        let options = MutableOptions::default();
        let trigger = LengthTrigger::new(3);

        trigger.record(2, 1 << 20);
        assert!(!trigger.is_exceeded(&options));
        trigger.record(1, 0);
        assert!(trigger.is_exceeded(&options));

        trigger.reset();
        assert!(!trigger.is_exceeded(&options));
    }

    #[test]
    fn write_buffer_size_trigger_follows_live_options() {
        let trigger = TriggerFactory::create(TriggerType::WriteBufferSize);
        trigger.record(1, 1000);

        assert!(!trigger.is_exceeded(&MutableOptions::default()));
        assert!(trigger.is_exceeded(&MutableOptions::default().write_buffer_size(1000)));
    }
}
