//! Live, reconfigurable tunables.
//!
//! The current value is an immutable [`MutableOptions`] behind an `Arc` that
//! is swapped as a whole. Readers clone the `Arc` and never observe a half
//! applied update. Background jobs hold on to the `Arc` they started with; that
//! copy is a [`ConfigSnapshot`] and may go stale.

use std::{
    fmt,
    sync::{Arc, RwLock},
};

use thiserror::Error;

use crate::{
    error::WriteError,
    manifest::{MetadataEvent, MetadataLog},
    observability::log_info,
    stall::controller::WriteController,
};

/// Options captured by a background job when it started.
pub type ConfigSnapshot = Arc<MutableOptions>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OptionsError {
    #[error("no options given")]
    Empty,
    #[error("unknown option `{0}`")]
    Unknown(String),
    #[error("invalid value `{value}` for option `{name}`")]
    InvalidValue { name: String, value: String },
    #[error("invalid options: {0}")]
    Invalid(String),
}

impl From<OptionsError> for WriteError {
    fn from(err: OptionsError) -> Self {
        WriteError::InvalidRequest(err.to_string())
    }
}

/// Whether a change has to be recorded in the metadata log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionScope {
    /// Affects this process only.
    Runtime,
    /// Part of the durable engine configuration.
    Persisted,
}

/// Tunables that may change while the engine runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableOptions {
    /// Short-circuits every admission decision to normal.
    pub disable_write_stall: bool,
    /// Pending flushes at which writes stop.
    pub max_write_buffer_number: usize,
    /// Pending flushes at which writes are delayed. `None` picks
    /// `max_write_buffer_number - 1` when that leaves room for a normal
    /// range (more than three buffers); otherwise there is no soft limit.
    pub slowdown_write_buffer_number: Option<usize>,
    pub level0_slowdown_writes_trigger: usize,
    pub level0_stop_writes_trigger: usize,
    pub level0_file_num_compaction_trigger: usize,
    /// Approximate memtable size that triggers a switch.
    pub write_buffer_size: usize,
    pub disable_auto_compactions: bool,
}

impl Default for MutableOptions {
    fn default() -> Self {
        Self {
            disable_write_stall: false,
            max_write_buffer_number: 2,
            slowdown_write_buffer_number: None,
            level0_slowdown_writes_trigger: 20,
            level0_stop_writes_trigger: 36,
            level0_file_num_compaction_trigger: 4,
            write_buffer_size: 64 * 1024 * 1024,
            disable_auto_compactions: false,
        }
    }
}

impl MutableOptions {
    pub fn disable_write_stall(self, disable_write_stall: bool) -> Self {
        MutableOptions {
            disable_write_stall,
            ..self
        }
    }

    pub fn max_write_buffer_number(self, max_write_buffer_number: usize) -> Self {
        MutableOptions {
            max_write_buffer_number,
            ..self
        }
    }

    pub fn slowdown_write_buffer_number(self, slowdown_write_buffer_number: usize) -> Self {
        MutableOptions {
            slowdown_write_buffer_number: Some(slowdown_write_buffer_number),
            ..self
        }
    }

    pub fn level0_slowdown_writes_trigger(self, level0_slowdown_writes_trigger: usize) -> Self {
        MutableOptions {
            level0_slowdown_writes_trigger,
            ..self
        }
    }

    pub fn level0_stop_writes_trigger(self, level0_stop_writes_trigger: usize) -> Self {
        MutableOptions {
            level0_stop_writes_trigger,
            ..self
        }
    }

    pub fn level0_file_num_compaction_trigger(
        self,
        level0_file_num_compaction_trigger: usize,
    ) -> Self {
        MutableOptions {
            level0_file_num_compaction_trigger,
            ..self
        }
    }

    pub fn write_buffer_size(self, write_buffer_size: usize) -> Self {
        MutableOptions {
            write_buffer_size,
            ..self
        }
    }

    pub fn disable_auto_compactions(self, disable_auto_compactions: bool) -> Self {
        MutableOptions {
            disable_auto_compactions,
            ..self
        }
    }

    /// Effective soft limit on pending flushes, if any.
    pub fn slowdown_write_buffers(&self) -> Option<usize> {
        match self.slowdown_write_buffer_number {
            Some(n) if n < self.max_write_buffer_number => Some(n),
            Some(_) => None,
            None if self.max_write_buffer_number > 3 => Some(self.max_write_buffer_number - 1),
            None => None,
        }
    }

    /// Parse `value` into the field called `name`.
    pub fn apply(&mut self, name: &str, value: &str) -> Result<OptionScope, OptionsError> {
        let invalid = || OptionsError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        };
        let value = value.trim();
        match name {
            "disable_write_stall" => {
                self.disable_write_stall = parse_bool(value).ok_or_else(invalid)?;
                return Ok(OptionScope::Runtime);
            }
            "max_write_buffer_number" => {
                self.max_write_buffer_number = value.parse().map_err(|_| invalid())?;
            }
            "slowdown_write_buffer_number" => {
                self.slowdown_write_buffer_number = match value {
                    "auto" | "0" => None,
                    _ => Some(value.parse().map_err(|_| invalid())?),
                };
            }
            "level0_slowdown_writes_trigger" => {
                self.level0_slowdown_writes_trigger = value.parse().map_err(|_| invalid())?;
            }
            "level0_stop_writes_trigger" => {
                self.level0_stop_writes_trigger = value.parse().map_err(|_| invalid())?;
            }
            "level0_file_num_compaction_trigger" => {
                self.level0_file_num_compaction_trigger = value.parse().map_err(|_| invalid())?;
            }
            "write_buffer_size" => {
                self.write_buffer_size = value.parse().map_err(|_| invalid())?;
            }
            "disable_auto_compactions" => {
                self.disable_auto_compactions = parse_bool(value).ok_or_else(invalid)?;
            }
            _ => return Err(OptionsError::Unknown(name.to_string())),
        }
        Ok(OptionScope::Persisted)
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.max_write_buffer_number < 2 {
            return Err(OptionsError::Invalid(
                "max_write_buffer_number must be at least 2".into(),
            ));
        }
        if self.level0_slowdown_writes_trigger > self.level0_stop_writes_trigger {
            return Err(OptionsError::Invalid(format!(
                "level0_slowdown_writes_trigger ({}) exceeds level0_stop_writes_trigger ({})",
                self.level0_slowdown_writes_trigger, self.level0_stop_writes_trigger
            )));
        }
        if self.level0_stop_writes_trigger == 0 || self.level0_file_num_compaction_trigger == 0 {
            return Err(OptionsError::Invalid(
                "level0 triggers must be positive".into(),
            ));
        }
        if self.write_buffer_size == 0 {
            return Err(OptionsError::Invalid("write_buffer_size must be positive".into()));
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Holds the live options and serialises updates to them.
pub(crate) struct OptionsStore {
    live: RwLock<Arc<MutableOptions>>,
    update: async_lock::Mutex<()>,
}

impl OptionsStore {
    pub(crate) fn new(initial: MutableOptions) -> Self {
        Self {
            live: RwLock::new(Arc::new(initial)),
            update: async_lock::Mutex::new(()),
        }
    }

    pub(crate) fn live(&self) -> Arc<MutableOptions> {
        self.live.read().expect("options lock poisoned").clone()
    }

    /// Apply every pair or none of them.
    ///
    /// A persisted option in `pairs` produces exactly one metadata record.
    /// The controller is reconfigured after the swap, which wakes any writer
    /// blocked on the old thresholds.
    pub(crate) async fn set(
        &self,
        pairs: &[(&str, &str)],
        metadata: &MetadataLog,
        controller: &WriteController,
    ) -> Result<Arc<MutableOptions>, OptionsError> {
        if pairs.is_empty() {
            return Err(OptionsError::Empty);
        }
        let _update = self.update.lock().await;

        let mut next = MutableOptions::clone(&self.live());
        let mut persisted = Vec::new();
        for (name, value) in pairs {
            if next.apply(name, value)? == OptionScope::Persisted
                && !persisted.iter().any(|n| n == name)
            {
                persisted.push(name.to_string());
            }
        }
        next.validate()?;

        if !persisted.is_empty() {
            metadata.record(MetadataEvent::OptionsChanged {
                names: persisted.clone(),
            });
        }

        let next = Arc::new(next);
        *self.live.write().expect("options lock poisoned") = next.clone();
        controller.reconfigure(&next);

        log_info!(
            component = "config",
            event = "options_updated",
            options = ?pairs,
            persisted = persisted.len(),
        );
        Ok(next)
    }
}

impl fmt::Debug for OptionsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionsStore")
            .field("live", &self.live())
            .finish()
    }
}
