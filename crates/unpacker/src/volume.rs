//! One mounted archive.
//!
//! A [`Volume`] answers path-level file system events from its metadata tree
//! and forwards everything that needs file data to its [`Decompressor`].
//! The tree is fetched once by [`Volume::initialize`]; until then every path
//! operation fails.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use serde::{Deserialize, Serialize};

use crate::decompressor::{Decompressor, ReadStream};
use crate::error::ProviderError;
use crate::host::ArchiveSource;
use crate::metadata::{EntryInfo, EntryMetadata, correct_metadata};
use crate::request::RequestId;

/// How a file is to be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenMode {
    /// Read-only access, the only mode archives support
    Read,
    /// Write access
    Write,
}

/// Arguments of an open-file event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFileOptions {
    /// Id of the open request, which becomes the handle
    pub request_id: RequestId,
    /// Absolute path inside the archive
    pub file_path: String,
    /// Requested access
    pub mode: OpenMode,
    /// Whether the host asked to create the file
    pub create: bool,
}

impl OpenFileOptions {
    /// Options for opening `file_path` read-only.
    pub fn read(request_id: RequestId, file_path: impl Into<String>) -> Self {
        Self {
            request_id,
            file_path: file_path.into(),
            mode: OpenMode::Read,
            create: false,
        }
    }
}

/// A handle the host holds on a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenedFile {
    /// Path that was opened
    pub file_path: String,
}

/// A mounted archive.
pub struct Volume {
    file_system_id: String,
    entry: Arc<dyn ArchiveSource>,
    decompressor: Arc<Decompressor>,
    metadata: OnceLock<EntryMetadata>,
    opened_files: Mutex<BTreeMap<RequestId, OpenedFile>>,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("file_system_id", &self.file_system_id)
            .field("ready", &self.is_ready())
            .field("opened_files", &self.opened().len())
            .finish_non_exhaustive()
    }
}

impl Volume {
    pub(crate) fn new(
        file_system_id: impl Into<String>,
        entry: Arc<dyn ArchiveSource>,
        decompressor: Arc<Decompressor>,
    ) -> Self {
        Self {
            file_system_id: file_system_id.into(),
            entry,
            decompressor,
            metadata: OnceLock::new(),
            opened_files: Mutex::new(BTreeMap::new()),
        }
    }

    fn opened(&self) -> MutexGuard<'_, BTreeMap<RequestId, OpenedFile>> {
        self.opened_files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The volume id.
    pub fn file_system_id(&self) -> &str {
        &self.file_system_id
    }

    /// The archive this volume serves.
    pub fn entry(&self) -> &Arc<dyn ArchiveSource> {
        &self.entry
    }

    pub(crate) fn decompressor(&self) -> &Arc<Decompressor> {
        &self.decompressor
    }

    /// Whether the metadata tree has been read.
    pub fn is_ready(&self) -> bool {
        self.metadata.get().is_some()
    }

    /// Whether any request is pending or any file is open.
    pub fn is_in_use(&self) -> bool {
        self.decompressor.has_requests_in_progress()
    }

    /// Snapshot of the open handles.
    pub fn opened_files(&self) -> BTreeMap<RequestId, OpenedFile> {
        self.opened().clone()
    }

    /// The remembered passphrase, if any.
    pub fn passphrase(&self) -> Option<String> {
        self.decompressor.passphrases().cached()
    }

    /// Read and publish the metadata tree.
    pub async fn initialize(&self, request_id: RequestId) -> Result<(), ProviderError> {
        let raw = self.decompressor.read_metadata(request_id).await?;
        let metadata = correct_metadata(&raw).map_err(|e| {
            tracing::error!(
                file_system_id = %self.file_system_id,
                error = %e,
                "invalid metadata from engine"
            );
            ProviderError::Failed
        })?;

        if self.metadata.set(metadata).is_err() {
            tracing::warn!(file_system_id = %self.file_system_id, "volume already initialized");
        } else {
            tracing::info!(file_system_id = %self.file_system_id, "volume ready");
        }
        Ok(())
    }

    fn tree(&self) -> Result<&EntryMetadata, ProviderError> {
        self.metadata.get().ok_or_else(|| {
            tracing::error!(file_system_id = %self.file_system_id, "volume used before it was ready");
            ProviderError::InvalidOperation
        })
    }

    fn lookup(&self, path: &str) -> Result<&EntryMetadata, ProviderError> {
        self.tree()?.resolve(path).ok_or(ProviderError::NotFound)
    }

    /// Metadata of the entry at `path`.
    pub fn get_metadata(&self, path: &str) -> Result<EntryInfo, ProviderError> {
        self.lookup(path).map(EntryInfo::from)
    }

    /// Immediate children of the directory at `path`, in the order the
    /// engine reported them.
    pub fn list_directory(&self, path: &str) -> Result<Vec<EntryInfo>, ProviderError> {
        let entry = self.lookup(path)?;
        if !entry.is_directory {
            return Err(ProviderError::NotADirectory);
        }
        Ok(entry.children().map(EntryInfo::from).collect())
    }

    /// Open a file read-only. The request id becomes the handle.
    pub async fn open_file(&self, options: OpenFileOptions) -> Result<(), ProviderError> {
        if options.mode != OpenMode::Read || options.create {
            tracing::warn!(
                file_system_id = %self.file_system_id,
                path = %options.file_path,
                mode = ?options.mode,
                create = options.create,
                "archives are read-only"
            );
            return Err(ProviderError::InvalidOperation);
        }

        let index = {
            let entry = self.lookup(&options.file_path)?;
            entry.index.ok_or_else(|| {
                tracing::warn!(
                    file_system_id = %self.file_system_id,
                    path = %options.file_path,
                    "entry has no header index"
                );
                ProviderError::InvalidOperation
            })?
        };

        self.decompressor
            .open_file(options.request_id, index)
            .await?;
        self.opened().insert(
            options.request_id,
            OpenedFile {
                file_path: options.file_path,
            },
        );
        Ok(())
    }

    /// Close the handle created by `open_request_id`.
    pub async fn close_file(
        &self,
        request_id: RequestId,
        open_request_id: RequestId,
    ) -> Result<(), ProviderError> {
        if !self.opened().contains_key(&open_request_id) {
            tracing::warn!(
                file_system_id = %self.file_system_id,
                open_request_id,
                "close of a file that is not open"
            );
            return Err(ProviderError::InvalidOperation);
        }

        self.decompressor
            .close_file(request_id, open_request_id)
            .await?;
        self.opened().remove(&open_request_id);
        Ok(())
    }

    /// Read up to `length` bytes at `offset` from an open file.
    ///
    /// Reads past the end of the file or of zero length finish immediately
    /// with no data; anything else is clamped to the file size.
    pub fn read_file(
        &self,
        request_id: RequestId,
        open_request_id: RequestId,
        offset: u64,
        length: u64,
    ) -> Result<ReadStream, ProviderError> {
        let path = match self.opened().get(&open_request_id) {
            Some(opened) => opened.file_path.clone(),
            None => {
                tracing::warn!(
                    file_system_id = %self.file_system_id,
                    open_request_id,
                    "read from a file that is not open"
                );
                return Err(ProviderError::InvalidOperation);
            }
        };

        let size = self.lookup(&path)?.size;
        if offset >= size || length == 0 {
            return Ok(ReadStream::empty());
        }
        let length = length.min(size - offset);
        self.decompressor
            .read_file(request_id, open_request_id, offset, length)
    }

    /// Re-open handles from a previous session under their original ids.
    pub async fn restore_opened_files(
        &self,
        opened_files: BTreeMap<RequestId, OpenedFile>,
    ) -> Result<(), ProviderError> {
        for (request_id, opened) in opened_files {
            tracing::debug!(
                file_system_id = %self.file_system_id,
                request_id,
                path = %opened.file_path,
                "re-opening file"
            );
            self.open_file(OpenFileOptions::read(request_id, opened.file_path))
                .await?;
        }
        Ok(())
    }

    /// Drop every pending request and release the volume in the engine.
    pub(crate) fn shutdown(&self) {
        self.decompressor.abandon_all();
        self.opened().clear();
        self.decompressor.close_volume();
    }
}
