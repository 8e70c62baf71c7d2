//! In-memory durability medium with fault injection.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use fusio::{
    dynamic::MaybeSend,
    error::Error as FusioError,
    fs::{FileMeta, FileSystemTag, Fs, OpenOptions},
    impls::mem::fs::InMemoryFs,
    path::Path,
    IoBuf, IoBufMut, Read, Write,
};
use futures_util::stream::Stream;

use super::{storage::LogStorage, SegmentId};

#[derive(Debug, Default)]
struct Switch {
    inactive: AtomicBool,
    writes: AtomicU64,
    flushes: AtomicU64,
}

impl Switch {
    fn check(&self) -> Result<(), FusioError> {
        if self.inactive.load(Ordering::SeqCst) {
            Err(FusioError::Io(io::Error::other("log medium is inactive")))
        } else {
            Ok(())
        }
    }
}

/// [`InMemoryFs`] behind an active/inactive switch.
///
/// While inactive, every open, write, flush and remove fails. Clones share
/// the same files and the same switch.
#[derive(Clone)]
pub struct FaultyFs {
    inner: Arc<InMemoryFs>,
    switch: Arc<Switch>,
}

impl Default for FaultyFs {
    fn default() -> Self {
        Self {
            inner: Arc::new(InMemoryFs::new()),
            switch: Arc::default(),
        }
    }
}

impl FaultyFs {
    pub fn set_active(&self, active: bool) {
        self.switch.inactive.store(!active, Ordering::SeqCst);
    }

    /// Successful write calls.
    pub fn write_count(&self) -> u64 {
        self.switch.writes.load(Ordering::SeqCst)
    }

    /// Successful flush calls.
    pub fn flush_count(&self) -> u64 {
        self.switch.flushes.load(Ordering::SeqCst)
    }
}

pub struct FaultyFile {
    inner: <InMemoryFs as Fs>::File,
    switch: Arc<Switch>,
}

impl Read for FaultyFile {
    async fn read_exact_at<B: IoBufMut>(
        &mut self,
        buf: B,
        pos: u64,
    ) -> (Result<(), FusioError>, B) {
        self.inner.read_exact_at(buf, pos).await
    }

    async fn read_to_end_at(
        &mut self,
        buf: Vec<u8>,
        pos: u64,
    ) -> (Result<(), FusioError>, Vec<u8>) {
        self.inner.read_to_end_at(buf, pos).await
    }

    async fn size(&self) -> Result<u64, FusioError> {
        self.inner.size().await
    }
}

impl Write for FaultyFile {
    async fn write_all<B: IoBuf>(&mut self, buf: B) -> (Result<(), FusioError>, B) {
        if let Err(err) = self.switch.check() {
            return (Err(err), buf);
        }
        let (result, buf) = self.inner.write_all(buf).await;
        if result.is_ok() {
            self.switch.writes.fetch_add(1, Ordering::SeqCst);
        }
        (result, buf)
    }

    async fn flush(&mut self) -> Result<(), FusioError> {
        self.switch.check()?;
        self.inner.flush().await?;
        self.switch.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), FusioError> {
        self.inner.close().await
    }
}

impl fusio::durability::FileCommit for FaultyFile {
    async fn commit(&mut self) -> Result<(), FusioError> {
        self.inner.commit().await
    }
}

impl Fs for FaultyFs {
    type File = FaultyFile;

    fn file_system(&self) -> FileSystemTag {
        self.inner.file_system()
    }

    async fn open_options(
        &self,
        path: &Path,
        options: OpenOptions,
    ) -> Result<Self::File, FusioError> {
        self.switch.check()?;
        let file = self.inner.open_options(path, options).await?;
        Ok(FaultyFile {
            inner: file,
            switch: self.switch.clone(),
        })
    }

    async fn create_dir_all(path: &Path) -> Result<(), FusioError> {
        InMemoryFs::create_dir_all(path).await
    }

    async fn list(
        &self,
        path: &Path,
    ) -> Result<impl Stream<Item = Result<FileMeta, FusioError>> + MaybeSend, FusioError> {
        self.inner.list(path).await
    }

    async fn remove(&self, path: &Path) -> Result<(), FusioError> {
        self.switch.check()?;
        self.inner.remove(path).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<(), FusioError> {
        self.switch.check()?;
        self.inner.copy(from, to).await
    }

    async fn link(&self, from: &Path, to: &Path) -> Result<(), FusioError> {
        self.switch.check()?;
        self.inner.link(from, to).await
    }
}

/// Log segments on a [`FaultyFs`], with helpers to inspect them.
#[derive(Clone)]
pub struct MemLogStorage {
    fs: FaultyFs,
    storage: LogStorage,
}

impl MemLogStorage {
    pub fn new() -> io::Result<Self> {
        let fs = FaultyFs::default();
        let root = Path::parse("wal").map_err(|err| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("invalid log root: {err}"))
        })?;
        let storage = LogStorage::new(Arc::new(fs.clone()), root);
        Ok(Self { fs, storage })
    }

    pub fn storage(&self) -> LogStorage {
        self.storage.clone()
    }

    pub fn fs(&self) -> &FaultyFs {
        &self.fs
    }

    pub fn set_active(&self, active: bool) {
        self.fs.set_active(active);
    }

    pub async fn segment_ids(&self) -> Vec<SegmentId> {
        self.storage.list().await.unwrap_or_default()
    }

    pub async fn segment(&self, id: SegmentId) -> Option<Vec<u8>> {
        self.storage.read(id).await.ok()
    }

    /// Total bytes over all live segments.
    pub async fn total_bytes(&self) -> usize {
        let mut total = 0;
        for id in self.segment_ids().await {
            total += self.segment(id).await.map_or(0, |image| image.len());
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;

    #[tokio::test]
    async fn inactive_medium_fails_io() {
        let mem = MemLogStorage::new().expect("mem log");
        let storage = mem.storage();
        storage.ensure_dir().await.expect("ensure dir");
        let id = Ulid::new();
        let mut segment = storage.create(id).await.expect("create");
        segment.write_all(b"abc".to_vec()).await.expect("write");

        mem.set_active(false);
        assert!(segment.write_all(b"def".to_vec()).await.is_err());
        assert!(segment.sync().await.is_err());
        assert!(storage.create(Ulid::new()).await.is_err());
        assert!(storage.remove(id).await.is_err());

        mem.set_active(true);
        segment.sync().await.expect("sync");
        assert_eq!(mem.segment(id).await.as_deref(), Some(&b"abc"[..]));
        assert_eq!(mem.segment_ids().await, vec![id]);
        assert_eq!(mem.fs().write_count(), 1);
        assert_eq!(mem.fs().flush_count(), 2);
    }
}
