//! Log segments on a fusio filesystem.

use std::{io, sync::Arc};

use fusio::{
    dynamic::fs::DynFile,
    error::Error as FusioError,
    fs::{FileSystemTag, OpenOptions},
    path::{Path, PathPart},
    DynFs, Read, Write,
};
use futures_util::StreamExt;
use ulid::Ulid;

use super::SegmentId;

const SEGMENT_SUFFIX: &str = ".wal";

/// Segments stored as `{id}.wal` under one root of a filesystem.
#[derive(Clone)]
pub struct LogStorage {
    fs: Arc<dyn DynFs>,
    root: Path,
}

impl LogStorage {
    pub fn new(fs: Arc<dyn DynFs>, root: Path) -> Self {
        Self { fs, root }
    }

    pub fn fs(&self) -> &Arc<dyn DynFs> {
        &self.fs
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_dir(&self) -> io::Result<()> {
        self.fs.create_dir_all(&self.root).await.map_err(medium_err)
    }

    pub fn segment_path(&self, id: SegmentId) -> io::Result<Path> {
        let filename = format!("{id}{SEGMENT_SUFFIX}");
        let part = PathPart::parse(&filename).map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid log segment name {filename}: {err}"),
            )
        })?;
        Ok(self.root.child(part))
    }

    /// Create an empty segment opened for appends.
    pub async fn create(&self, id: SegmentId) -> io::Result<LogSegment> {
        let path = self.segment_path(id)?;
        let file = self
            .fs
            .open_options(&path, Self::write_options())
            .await
            .map_err(medium_err)?;
        Ok(LogSegment {
            id,
            path,
            file,
            fs_tag: self.fs.file_system(),
        })
    }

    pub async fn remove(&self, id: SegmentId) -> io::Result<()> {
        let path = self.segment_path(id)?;
        self.fs.remove(&path).await.map_err(medium_err)
    }

    /// Full image of a segment.
    pub async fn read(&self, id: SegmentId) -> io::Result<Vec<u8>> {
        let path = self.segment_path(id)?;
        let mut file = self
            .fs
            .open_options(&path, Self::read_options())
            .await
            .map_err(medium_err)?;
        let (result, image) = file.read_to_end_at(Vec::new(), 0).await;
        result.map_err(medium_err)?;
        Ok(image)
    }

    /// Ids of the segments under the root, oldest first.
    pub async fn list(&self) -> io::Result<Vec<SegmentId>> {
        let mut ids = Vec::new();
        let mut stream = match self.fs.list(&self.root).await {
            Ok(stream) => stream,
            Err(FusioError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(ids);
            }
            Err(err) => return Err(medium_err(err)),
        };
        while let Some(meta) = stream.next().await {
            let meta = meta.map_err(medium_err)?;
            if let Some(id) = segment_id(meta.path.filename()) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn write_options() -> OpenOptions {
        OpenOptions::default()
            .read(false)
            .write(true)
            .create(true)
            .truncate(false)
    }

    fn read_options() -> OpenOptions {
        OpenOptions::default().read(true).write(false)
    }
}

/// One open segment.
pub struct LogSegment {
    id: SegmentId,
    path: Path,
    file: Box<dyn DynFile>,
    fs_tag: FileSystemTag,
}

impl LogSegment {
    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `buf` and hand it to the filesystem.
    pub async fn write_all(&mut self, buf: Vec<u8>) -> io::Result<()> {
        let (result, _buf) = self.file.write_all(buf).await;
        result.map_err(medium_err)?;
        self.file.flush().await.map_err(medium_err)
    }

    /// Make everything written so far durable.
    pub async fn sync(&mut self) -> io::Result<()> {
        self.file.flush().await.map_err(medium_err)?;
        match self.fs_tag {
            FileSystemTag::Local => self.sync_local().await,
            FileSystemTag::Memory => Ok(()),
            tag => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("log backend {tag:?} does not support durability sync"),
            )),
        }
    }

    pub async fn close(&mut self) -> io::Result<()> {
        self.file.close().await.map_err(medium_err)
    }

    #[cfg(feature = "tokio")]
    async fn sync_local(&self) -> io::Result<()> {
        let local = fusio::path::path_to_local(&self.path).map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("failed to resolve log segment path {}: {err}", self.path),
            )
        })?;
        tokio::fs::OpenOptions::new()
            .write(true)
            .open(&local)
            .await?
            .sync_data()
            .await
    }

    #[cfg(not(feature = "tokio"))]
    async fn sync_local(&self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "syncing local log segments needs the `tokio` feature",
        ))
    }
}

fn segment_id(filename: Option<&str>) -> Option<Ulid> {
    let stem = filename?.strip_suffix(SEGMENT_SUFFIX)?;
    Ulid::from_string(stem).ok()
}

pub(crate) fn medium_err(err: FusioError) -> io::Error {
    match err {
        FusioError::Io(err) => err,
        other => io::Error::other(other.to_string()),
    }
}
