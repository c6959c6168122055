//! Request channel between one volume and the engine.
//!
//! [`Decompressor`] owns the requests a volume has in flight. Each request is
//! registered under its caller-chosen id before anything goes on the wire,
//! and engine messages are routed back to it by id:
//!
//! - terminal responses complete the request and drop its record, except
//!   that an opened file keeps its record until the matching close, and a
//!   read keeps its record until the engine says no more data follows;
//! - chunk reads and passphrase prompts are sub-requests that reuse the id
//!   of an outer open/read and are answered directly, leaving the record
//!   alone.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::engine::EnginePeer;
use crate::error::ProviderError;
use crate::host::ArchiveSource;
use crate::metadata::RawEntry;
use crate::passphrase::PassphraseManager;
use crate::request::{EngineMessage, NO_REQUEST_ID, Operation, Request, RequestId, Response, SubRequest};

/// Notifications a volume raises for its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum VolumeEvent {
    /// A passphrase was remembered and should be persisted
    PassphraseRemembered(String),
    /// The volume cannot continue and must be force-unmounted
    Irrecoverable(String),
}

/// One piece of file data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    /// Decompressed bytes
    pub data: Vec<u8>,
    /// Whether more chunks follow
    pub has_more_data: bool,
}

/// Streamed result of a file read.
///
/// Yields chunks until one arrives with `has_more_data == false`. If the
/// volume is torn down mid-read the stream yields an error instead.
#[derive(Debug)]
pub struct ReadStream {
    inner: UnboundedReceiverStream<Result<FileChunk, ProviderError>>,
}

impl ReadStream {
    fn new(rx: mpsc::UnboundedReceiver<Result<FileChunk, ProviderError>>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    /// A finished read with no data.
    pub fn empty() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(FileChunk {
            data: Vec::new(),
            has_more_data: false,
        }));
        Self::new(rx)
    }

    /// Drain the stream into one buffer.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>, ProviderError> {
        let mut data = Vec::new();
        while let Some(chunk) = self.next().await {
            let chunk = chunk?;
            data.extend_from_slice(&chunk.data);
            if !chunk.has_more_data {
                return Ok(data);
            }
        }
        tracing::error!("read ended before the last chunk");
        Err(ProviderError::Failed)
    }
}

impl Stream for ReadStream {
    type Item = Result<FileChunk, ProviderError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

enum Completion {
    /// Waiting for a single terminal response
    Waiting(oneshot::Sender<Result<Response, ProviderError>>),
    /// Open acknowledged; kept alive for chunk reads until close
    Opened,
    /// Read in progress
    Streaming(mpsc::UnboundedSender<Result<FileChunk, ProviderError>>),
}

/// Drops the record of a single-shot request whose caller stopped waiting,
/// whether it timed out or its future was dropped.
struct WaitGuard<'a> {
    decompressor: &'a Decompressor,
    request_id: RequestId,
    armed: bool,
}

impl WaitGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut requests = self.decompressor.requests();
        let waiting = matches!(
            requests.get(&self.request_id),
            Some(PendingRequest {
                completion: Completion::Waiting(_),
                ..
            })
        );
        if waiting {
            requests.remove(&self.request_id);
            tracing::debug!(
                file_system_id = %self.decompressor.file_system_id,
                request_id = self.request_id,
                "caller went away, dropping request"
            );
        }
    }
}

struct PendingRequest {
    operation: Operation,
    completion: Completion,
}

impl PendingRequest {
    fn fail(self) {
        match self.completion {
            Completion::Waiting(tx) => {
                let _ = tx.send(Err(ProviderError::Failed));
            }
            Completion::Streaming(tx) => {
                let _ = tx.send(Err(ProviderError::Failed));
            }
            Completion::Opened => {}
        }
    }
}

/// Request channel for one archive.
pub struct Decompressor {
    file_system_id: String,
    engine: Arc<dyn EnginePeer>,
    archive: Arc<dyn ArchiveSource>,
    passphrases: Arc<PassphraseManager>,
    events: mpsc::UnboundedSender<VolumeEvent>,
    encoding: String,
    timeout: Option<Duration>,
    requests: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl std::fmt::Debug for Decompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decompressor")
            .field("file_system_id", &self.file_system_id)
            .field("in_progress", &self.requests().len())
            .finish_non_exhaustive()
    }
}

impl Decompressor {
    pub(crate) fn new(
        file_system_id: impl Into<String>,
        engine: Arc<dyn EnginePeer>,
        archive: Arc<dyn ArchiveSource>,
        passphrases: Arc<PassphraseManager>,
        events: mpsc::UnboundedSender<VolumeEvent>,
        encoding: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            file_system_id: file_system_id.into(),
            engine,
            archive,
            passphrases,
            events,
            encoding: encoding.into(),
            timeout,
            requests: Mutex::new(HashMap::new()),
        }
    }

    fn requests(&self) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Passphrase state for this archive.
    pub fn passphrases(&self) -> &Arc<PassphraseManager> {
        &self.passphrases
    }

    /// Whether any request is awaiting the engine, open files included.
    pub fn has_requests_in_progress(&self) -> bool {
        !self.requests().is_empty()
    }

    /// Whether `request_id` has a live record.
    pub fn is_pending(&self, request_id: RequestId) -> bool {
        self.requests().contains_key(&request_id)
    }

    /// Register a request and put it on the wire.
    fn add_request(
        &self,
        request_id: RequestId,
        completion: Completion,
        request: Request,
    ) -> Result<(), ProviderError> {
        let operation = request.operation();
        {
            let mut requests = self.requests();
            if requests.contains_key(&request_id) {
                tracing::error!(
                    file_system_id = %self.file_system_id,
                    request_id,
                    "there is already a request with this id"
                );
                return Err(ProviderError::InvalidOperation);
            }
            requests.insert(
                request_id,
                PendingRequest {
                    operation,
                    completion,
                },
            );
        }

        let message = request.encode(&self.file_system_id, request_id);
        if let Err(e) = self.engine.send(message) {
            self.requests().remove(&request_id);
            return Err(e.into());
        }
        tracing::debug!(
            file_system_id = %self.file_system_id,
            request_id,
            ?operation,
            "request sent"
        );
        Ok(())
    }

    async fn single_shot(
        &self,
        request_id: RequestId,
        request: Request,
    ) -> Result<Response, ProviderError> {
        let (tx, rx) = oneshot::channel();
        self.add_request(request_id, Completion::Waiting(tx), request)?;
        let guard = WaitGuard {
            decompressor: self,
            request_id,
            armed: true,
        };

        let received = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    tracing::error!(
                        file_system_id = %self.file_system_id,
                        request_id,
                        "engine did not answer in time, abandoning request"
                    );
                    return Err(ProviderError::Failed);
                }
            },
            None => rx.await,
        };
        guard.disarm();
        received.map_err(|_| ProviderError::Failed)?
    }

    /// Ask the engine for the metadata tree.
    pub async fn read_metadata(&self, request_id: RequestId) -> Result<RawEntry, ProviderError> {
        let request = Request::ReadMetadata {
            encoding: self.encoding.clone(),
            archive_size: self.archive.size(),
        };
        match self.single_shot(request_id, request).await? {
            Response::MetadataReady(raw) => Ok(raw),
            _ => Err(ProviderError::Failed),
        }
    }

    /// Open the entry at `index`. The record outlives this call until closed.
    pub async fn open_file(&self, request_id: RequestId, index: u64) -> Result<(), ProviderError> {
        let request = Request::OpenFile {
            index,
            encoding: self.encoding.clone(),
            archive_size: self.archive.size(),
        };
        match self.single_shot(request_id, request).await? {
            Response::OpenDone => Ok(()),
            _ => Err(ProviderError::Failed),
        }
    }

    /// Close the file opened by `open_request_id`.
    pub async fn close_file(
        &self,
        request_id: RequestId,
        open_request_id: RequestId,
    ) -> Result<(), ProviderError> {
        match self
            .single_shot(request_id, Request::CloseFile { open_request_id })
            .await?
        {
            Response::CloseDone { .. } => Ok(()),
            _ => Err(ProviderError::Failed),
        }
    }

    /// Read from an open file. The returned stream may yield several chunks.
    pub fn read_file(
        &self,
        request_id: RequestId,
        open_request_id: RequestId,
        offset: u64,
        length: u64,
    ) -> Result<ReadStream, ProviderError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_request(
            request_id,
            Completion::Streaming(tx),
            Request::ReadFile {
                open_request_id,
                offset,
                length,
            },
        )?;
        Ok(ReadStream::new(rx))
    }

    /// Tell the engine to release this volume.
    pub fn close_volume(&self) {
        if let Err(e) = self
            .engine
            .send(Request::CloseVolume.encode(&self.file_system_id, NO_REQUEST_ID))
        {
            tracing::warn!(file_system_id = %self.file_system_id, error = %e, "failed to close volume");
        }
    }

    /// Fail and drop every pending request.
    pub fn abandon_all(&self) {
        let drained: Vec<_> = self.requests().drain().collect();
        for (request_id, pending) in drained {
            tracing::debug!(
                file_system_id = %self.file_system_id,
                request_id,
                "abandoning request"
            );
            pending.fail();
        }
    }

    /// Handle a message the engine sent about `request_id`.
    pub fn process_message(self: &Arc<Self>, request_id: RequestId, message: EngineMessage) {
        match message {
            EngineMessage::Response(response) => self.complete(request_id, response),
            EngineMessage::SubRequest(SubRequest::ReadChunk { offset, length }) => {
                if !self.is_pending(request_id) {
                    tracing::warn!(
                        file_system_id = %self.file_system_id,
                        request_id,
                        "chunk read for a request that is not in progress"
                    );
                }
                let this = Arc::clone(self);
                tokio::spawn(async move { this.read_chunk(request_id, offset, length).await });
            }
            EngineMessage::SubRequest(SubRequest::ReadPassphrase) => {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.read_passphrase(request_id).await });
            }
            EngineMessage::Console(console) => console.log(&self.file_system_id),
        }
    }

    /// Fail the record of `request_id` after the engine sent something
    /// about it that could not be understood.
    pub fn fail_request(&self, request_id: RequestId, reason: &str) {
        self.complete(request_id, Response::Error(reason.to_string()));
    }

    fn complete(&self, request_id: RequestId, response: Response) {
        let mut requests = self.requests();
        let Some(pending) = requests.remove(&request_id) else {
            tracing::error!(
                file_system_id = %self.file_system_id,
                request_id,
                "no request in progress for engine response"
            );
            return;
        };

        match (pending.operation, pending.completion, response) {
            (operation, completion, Response::Error(error)) => {
                tracing::error!(
                    file_system_id = %self.file_system_id,
                    request_id,
                    error = %error,
                    "file system error"
                );
                PendingRequest {
                    operation,
                    completion,
                }
                .fail();
            }
            (Operation::ReadMetadata, Completion::Waiting(tx), response @ Response::MetadataReady(_)) => {
                let _ = tx.send(Ok(response));
            }
            (Operation::OpenFile, Completion::Waiting(tx), Response::OpenDone) => {
                let _ = tx.send(Ok(Response::OpenDone));
                requests.insert(
                    request_id,
                    PendingRequest {
                        operation: Operation::OpenFile,
                        completion: Completion::Opened,
                    },
                );
            }
            (Operation::CloseFile, Completion::Waiting(tx), Response::CloseDone { open_request_id }) => {
                requests.remove(&open_request_id);
                let _ = tx.send(Ok(Response::CloseDone { open_request_id }));
            }
            (Operation::ReadFile, Completion::Streaming(tx), Response::ReadDone { data, has_more_data }) => {
                let _ = tx.send(Ok(FileChunk {
                    data,
                    has_more_data,
                }));
                if has_more_data {
                    requests.insert(
                        request_id,
                        PendingRequest {
                            operation: Operation::ReadFile,
                            completion: Completion::Streaming(tx),
                        },
                    );
                }
            }
            (operation, completion, response) => {
                tracing::error!(
                    file_system_id = %self.file_system_id,
                    request_id,
                    ?operation,
                    ?response,
                    "invalid engine response for request"
                );
                PendingRequest {
                    operation,
                    completion,
                }
                .fail();
            }
        }
    }

    async fn read_chunk(&self, request_id: RequestId, offset: u64, length: u64) {
        let size = self.archive.size();
        if offset >= size || length == 0 {
            tracing::error!(
                file_system_id = %self.file_system_id,
                request_id,
                offset,
                length,
                size,
                "invalid chunk request"
            );
            self.reply(request_id, Request::ReadChunkError);
            return;
        }

        let length = length.min(size - offset);
        match self.archive.read_at(offset, length).await {
            Ok(buffer) => self.reply(request_id, Request::ReadChunkDone { buffer, offset }),
            Err(e) => {
                tracing::error!(
                    file_system_id = %self.file_system_id,
                    request_id,
                    error = %e,
                    "failed to read a chunk of data from the archive"
                );
                self.reply(request_id, Request::ReadChunkError);
            }
        }
    }

    async fn read_passphrase(&self, request_id: RequestId) {
        match self.passphrases.get_passphrase(&self.file_system_id).await {
            Ok((passphrase, remembered)) => {
                self.reply(request_id, Request::ReadPassphraseDone { passphrase });
                if remembered {
                    let _ = self
                        .events
                        .send(VolumeEvent::PassphraseRemembered(self.file_system_id.clone()));
                }
            }
            Err(e) => {
                tracing::error!(
                    file_system_id = %self.file_system_id,
                    request_id,
                    error = %e,
                    "no passphrase, volume cannot be decrypted"
                );
                self.reply(request_id, Request::ReadPassphraseError);
                let _ = self
                    .events
                    .send(VolumeEvent::Irrecoverable(self.file_system_id.clone()));
            }
        }
    }

    fn reply(&self, request_id: RequestId, reply: Request) {
        if let Err(e) = self.engine.send(reply.encode(&self.file_system_id, request_id)) {
            tracing::error!(
                file_system_id = %self.file_system_id,
                request_id,
                error = %e,
                "failed to answer engine"
            );
        }
    }
}
