use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    checkpoint::CheckpointObserver,
    config::MutableOptions,
    manifest::MetadataObserver,
    ondisk::{InMemoryTables, TableSink},
    stall::{policy, DelayPolicy, TriggerType},
    wal::LogStorage,
    write::WriteMode,
};

/// Where log segments live.
#[derive(Clone, Default)]
pub enum LogLocation {
    /// A fresh in-memory filesystem, gone with the engine.
    #[default]
    Memory,
    /// A local directory, one file per segment.
    Dir(PathBuf),
    /// Any fusio filesystem.
    Storage(LogStorage),
}

impl fmt::Debug for LogLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLocation::Memory => f.write_str("Memory"),
            LogLocation::Dir(path) => f.debug_tuple("Dir").field(path).finish(),
            LogLocation::Storage(storage) => f
                .debug_tuple("Storage")
                .field(&storage.root().to_string())
                .finish(),
        }
    }
}

/// Settings fixed for the lifetime of a [`crate::Db`], plus the initial
/// mutable options.
#[derive(Clone)]
pub struct DbOptions {
    pub(crate) write_mode: WriteMode,
    pub(crate) manual_log_flush: bool,
    pub(crate) log_buffer_max_bytes: usize,
    pub(crate) log_location: LogLocation,
    pub(crate) mutable: MutableOptions,
    pub(crate) delay_policy: Arc<dyn DelayPolicy>,
    pub(crate) freeze_trigger: TriggerType,
    pub(crate) table_sink: Arc<dyn TableSink>,
    pub(crate) metadata_observer: Option<Arc<dyn MetadataObserver>>,
    pub(crate) checkpoints: Option<Arc<dyn CheckpointObserver>>,
}

impl Default for DbOptions {
    fn default() -> Self {
        DbOptions {
            write_mode: WriteMode::default(),
            manual_log_flush: false,
            log_buffer_max_bytes: 1024 * 1024,
            log_location: LogLocation::default(),
            mutable: MutableOptions::default(),
            delay_policy: policy::default_policy(),
            freeze_trigger: TriggerType::default(),
            table_sink: Arc::new(InMemoryTables::new()),
            metadata_observer: None,
            checkpoints: None,
        }
    }
}

impl From<PathBuf> for DbOptions {
    /// Log segments under `path/wal`.
    fn from(path: PathBuf) -> Self {
        DbOptions {
            log_location: LogLocation::Dir(path.join("wal")),
            ..DbOptions::default()
        }
    }
}

impl From<&Path> for DbOptions {
    fn from(path: &Path) -> Self {
        DbOptions::from(path.to_path_buf())
    }
}

impl DbOptions {
    pub fn write_mode(self, write_mode: WriteMode) -> Self {
        DbOptions { write_mode, ..self }
    }

    pub fn manual_log_flush(self, manual_log_flush: bool) -> Self {
        DbOptions {
            manual_log_flush,
            ..self
        }
    }

    pub fn log_buffer_max_bytes(self, log_buffer_max_bytes: usize) -> Self {
        DbOptions {
            log_buffer_max_bytes,
            ..self
        }
    }

    pub fn log_storage(self, storage: LogStorage) -> Self {
        DbOptions {
            log_location: LogLocation::Storage(storage),
            ..self
        }
    }

    pub fn log_dir(self, dir: impl Into<PathBuf>) -> Self {
        DbOptions {
            log_location: LogLocation::Dir(dir.into()),
            ..self
        }
    }

    pub fn mutable_options(self, mutable: MutableOptions) -> Self {
        DbOptions { mutable, ..self }
    }

    pub fn delay_policy(self, delay_policy: Arc<dyn DelayPolicy>) -> Self {
        DbOptions {
            delay_policy,
            ..self
        }
    }

    pub fn freeze_trigger(self, freeze_trigger: TriggerType) -> Self {
        DbOptions {
            freeze_trigger,
            ..self
        }
    }

    pub fn table_sink(self, table_sink: Arc<dyn TableSink>) -> Self {
        DbOptions { table_sink, ..self }
    }

    pub fn metadata_observer(self, observer: Arc<dyn MetadataObserver>) -> Self {
        DbOptions {
            metadata_observer: Some(observer),
            ..self
        }
    }

    pub fn checkpoints(self, observer: Arc<dyn CheckpointObserver>) -> Self {
        DbOptions {
            checkpoints: Some(observer),
            ..self
        }
    }
}

impl fmt::Debug for DbOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbOptions")
            .field("write_mode", &self.write_mode)
            .field("manual_log_flush", &self.manual_log_flush)
            .field("log_buffer_max_bytes", &self.log_buffer_max_bytes)
            .field("log_location", &self.log_location)
            .field("mutable", &self.mutable)
            .field("freeze_trigger", &self.freeze_trigger)
            .field("metadata_observer", &self.metadata_observer.is_some())
            .field("checkpoints", &self.checkpoints.is_some())
            .finish_non_exhaustive()
    }
}
