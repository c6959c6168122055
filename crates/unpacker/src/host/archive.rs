//! Archive blobs and their retain/restore tokens.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// A randomly readable archive blob.
#[async_trait]
pub trait ArchiveSource: Send + Sync + std::fmt::Debug {
    /// Full display path, used as the volume id
    fn display_path(&self) -> &str;

    /// Short name shown to the user
    fn name(&self) -> &str;

    /// Size of the blob in bytes
    fn size(&self) -> u64;

    /// Read up to `length` bytes starting at `offset`.
    async fn read_at(&self, offset: u64, length: u64) -> io::Result<Vec<u8>>;
}

/// Retains live archive references across process restarts.
#[async_trait]
pub trait EntryRetainer: Send + Sync {
    /// Produce an opaque token that can later be restored.
    fn retain(&self, source: &Arc<dyn ArchiveSource>) -> String;

    /// Turn a token back into a live archive reference.
    async fn restore(&self, token: &str) -> io::Result<Arc<dyn ArchiveSource>>;
}

/// An archive held entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryArchive {
    display_path: String,
    name: String,
    data: Arc<Vec<u8>>,
}

impl MemoryArchive {
    /// Create an archive from bytes. The name is the last path component.
    pub fn new(display_path: impl Into<String>, data: Vec<u8>) -> Self {
        let display_path = display_path.into();
        let name = display_path
            .rsplit('/')
            .next()
            .unwrap_or(&display_path)
            .to_string();
        Self {
            display_path,
            name,
            data: Arc::new(data),
        }
    }
}

#[async_trait]
impl ArchiveSource for MemoryArchive {
    fn display_path(&self) -> &str {
        &self.display_path
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_at(&self, offset: u64, length: u64) -> io::Result<Vec<u8>> {
        let len = self.data.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        let end = start
            .saturating_add(usize::try_from(length).unwrap_or(usize::MAX))
            .min(len);
        Ok(self.data[start..end].to_vec())
    }
}

/// An archive on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileArchive {
    path: PathBuf,
    display_path: String,
    name: String,
    size: u64,
}

impl FileArchive {
    /// Open an archive file, capturing its size.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a file: {}", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            display_path: path.to_string_lossy().into_owned(),
            name,
            size: metadata.len(),
            path,
        })
    }

    /// Path on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ArchiveSource for FileArchive {
    fn display_path(&self) -> &str {
        &self.display_path
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, offset: u64, length: u64) -> io::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buffer = Vec::new();
        file.take(length).read_to_end(&mut buffer).await?;
        Ok(buffer)
    }
}

/// Retains archives by their filesystem path.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathRetainer;

#[async_trait]
impl EntryRetainer for PathRetainer {
    fn retain(&self, source: &Arc<dyn ArchiveSource>) -> String {
        source.display_path().to_string()
    }

    async fn restore(&self, token: &str) -> io::Result<Arc<dyn ArchiveSource>> {
        Ok(Arc::new(FileArchive::open(token).await?))
    }
}

/// Retains archives in a process-local table.
///
/// Useful when archives do not live on disk. Tokens only survive as long as
/// this retainer does; [`forget`](Self::forget) drops one to make its
/// restore fail.
#[derive(Debug, Default)]
pub struct MemoryRetainer {
    entries: Mutex<HashMap<String, Arc<dyn ArchiveSource>>>,
}

impl MemoryRetainer {
    /// Create an empty retainer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a retained archive.
    pub fn forget(&self, token: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
    }
}

#[async_trait]
impl EntryRetainer for MemoryRetainer {
    fn retain(&self, source: &Arc<dyn ArchiveSource>) -> String {
        let token = source.display_path().to_string();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.clone(), Arc::clone(source));
        token
    }

    async fn restore(&self, token: &str) -> io::Result<Arc<dyn ArchiveSource>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no entry for {token}"))
            })
    }
}
