//! Wire protocol spoken with the decompression engine.
//!
//! Every message is a flat dictionary keyed by the names in [`key`]. The
//! mandatory fields are `operation`, `file_system_id` and `request_id`.
//! Request ids and 64-bit numbers cross the wire as decimal strings because
//! the engine's bridge only carries 32-bit integers reliably; they are parsed
//! back into native integers here, at the boundary, and never handled as
//! strings past this module.
//!
//! Outgoing traffic is built from a typed [`Request`]. Incoming traffic is
//! decoded into an [`Envelope`] whose [`EngineMessage`] keeps terminal
//! responses and engine-initiated sub-requests apart.

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, DecodeError};
use crate::metadata::RawEntry;

/// Caller-chosen request identifier, unique among pending requests of a volume.
pub type RequestId = i64;

/// Request id used for messages that are not tied to any host request.
pub const NO_REQUEST_ID: RequestId = -1;

/// Field names used on the wire.
pub mod key {
    /// Operation tag
    pub const OPERATION: &str = "operation";
    /// Owning volume
    pub const FILE_SYSTEM_ID: &str = "file_system_id";
    /// Request correlation id
    pub const REQUEST_ID: &str = "request_id";
    /// Engine error text
    pub const ERROR: &str = "error";
    /// Metadata tree
    pub const METADATA: &str = "metadata";
    /// Archive size in bytes
    pub const ARCHIVE_SIZE: &str = "archive_size";
    /// Raw archive bytes
    pub const CHUNK_BUFFER: &str = "chunk_buffer";
    /// Byte offset
    pub const OFFSET: &str = "offset";
    /// Byte count
    pub const LENGTH: &str = "length";
    /// Entry position in the engine's header list
    pub const INDEX: &str = "index";
    /// Header encoding
    pub const ENCODING: &str = "encoding";
    /// Request id of the open operation a handle belongs to
    pub const OPEN_REQUEST_ID: &str = "open_request_id";
    /// Decompressed file bytes
    pub const READ_FILE_DATA: &str = "read_file_data";
    /// Whether more read-file responses follow
    pub const HAS_MORE_DATA: &str = "has_more_data";
    /// Archive passphrase
    pub const PASSPHRASE: &str = "passphrase";
    /// Source file of an engine console message
    pub const SRC_FILE: &str = "src_file";
    /// Source line of an engine console message
    pub const SRC_LINE: &str = "src_line";
    /// Source function of an engine console message
    pub const SRC_FUNC: &str = "src_func";
    /// Engine console text
    pub const MESSAGE: &str = "message";
}

/// Operation tags shared with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Read the archive's metadata tree
    ReadMetadata,
    /// Metadata tree is ready
    ReadMetadataDone,
    /// Engine asks for raw archive bytes
    ReadChunk,
    /// Raw archive bytes
    ReadChunkDone,
    /// Raw archive bytes could not be read
    ReadChunkError,
    /// Engine asks for the archive passphrase
    ReadPassphrase,
    /// Archive passphrase
    ReadPassphraseDone,
    /// No passphrase available
    ReadPassphraseError,
    /// Release all engine state for a volume
    CloseVolume,
    /// Open a file inside the archive
    OpenFile,
    /// File opened
    OpenFileDone,
    /// Close an open file
    CloseFile,
    /// File closed
    CloseFileDone,
    /// Read decompressed bytes from an open file
    ReadFile,
    /// Decompressed bytes
    ReadFileDone,
    /// Engine log line
    ConsoleLog,
    /// Engine debug line
    ConsoleDebug,
    /// Engine-reported failure for a request
    FileSystemError,
}

impl Operation {
    /// Numeric tag used on the wire.
    pub fn tag(self) -> i32 {
        match self {
            Operation::ReadMetadata => 0,
            Operation::ReadMetadataDone => 1,
            Operation::ReadChunk => 2,
            Operation::ReadChunkDone => 3,
            Operation::ReadChunkError => 4,
            Operation::ReadPassphrase => 5,
            Operation::ReadPassphraseDone => 6,
            Operation::ReadPassphraseError => 7,
            Operation::CloseVolume => 8,
            Operation::OpenFile => 9,
            Operation::OpenFileDone => 10,
            Operation::CloseFile => 11,
            Operation::CloseFileDone => 12,
            Operation::ReadFile => 13,
            Operation::ReadFileDone => 14,
            Operation::ConsoleLog => 15,
            Operation::ConsoleDebug => 16,
            Operation::FileSystemError => -1,
        }
    }
}

impl TryFrom<i32> for Operation {
    type Error = CodecError;

    fn try_from(tag: i32) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => Operation::ReadMetadata,
            1 => Operation::ReadMetadataDone,
            2 => Operation::ReadChunk,
            3 => Operation::ReadChunkDone,
            4 => Operation::ReadChunkError,
            5 => Operation::ReadPassphrase,
            6 => Operation::ReadPassphraseDone,
            7 => Operation::ReadPassphraseError,
            8 => Operation::CloseVolume,
            9 => Operation::OpenFile,
            10 => Operation::OpenFileDone,
            11 => Operation::CloseFile,
            12 => Operation::CloseFileDone,
            13 => Operation::ReadFile,
            14 => Operation::ReadFileDone,
            15 => Operation::ConsoleLog,
            16 => Operation::ConsoleDebug,
            -1 => Operation::FileSystemError,
            other => return Err(CodecError::UnknownOperation(other)),
        })
    }
}

/// A protocol message in the engine's representation.
///
/// Optional fields are named after their [`key`] constant and only present
/// for the operations that use them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct WireMessage {
    /// Operation tag, see [`Operation::tag`]
    pub operation: i32,
    /// Owning volume
    #[serde(default)]
    pub file_system_id: String,
    /// Stringified request id
    #[serde(default)]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RawEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_buffer: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_file_data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_more_data: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_line: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_func: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WireMessage {
    fn basic(operation: Operation, file_system_id: &str, request_id: RequestId) -> Self {
        Self {
            operation: operation.tag(),
            file_system_id: file_system_id.to_string(),
            request_id: request_id.to_string(),
            ..Default::default()
        }
    }
}

/// Messages sent to the engine, either client requests or replies to
/// engine-initiated sub-requests.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Ask for the archive's metadata tree
    ReadMetadata {
        /// Header encoding
        encoding: String,
        /// Archive size in bytes
        archive_size: u64,
    },
    /// Open the entry at `index`
    OpenFile {
        /// Entry position in the header list
        index: u64,
        /// Header encoding
        encoding: String,
        /// Archive size in bytes
        archive_size: u64,
    },
    /// Close the file opened by `open_request_id`
    CloseFile {
        /// Request id of the open operation
        open_request_id: RequestId,
    },
    /// Read `length` bytes from `offset` of an open file
    ReadFile {
        /// Request id of the open operation
        open_request_id: RequestId,
        /// Offset within the file
        offset: u64,
        /// Number of bytes
        length: u64,
    },
    /// Release the volume on the engine side
    CloseVolume,
    /// Raw archive bytes starting at `offset`
    ReadChunkDone {
        /// Archive bytes
        buffer: Vec<u8>,
        /// Offset the bytes start at
        offset: u64,
    },
    /// Archive bytes could not be read
    ReadChunkError,
    /// The passphrase
    ReadPassphraseDone {
        /// Passphrase text
        passphrase: String,
    },
    /// No passphrase could be obtained
    ReadPassphraseError,
}

impl Request {
    /// Operation tag for this request.
    pub fn operation(&self) -> Operation {
        match self {
            Request::ReadMetadata { .. } => Operation::ReadMetadata,
            Request::OpenFile { .. } => Operation::OpenFile,
            Request::CloseFile { .. } => Operation::CloseFile,
            Request::ReadFile { .. } => Operation::ReadFile,
            Request::CloseVolume => Operation::CloseVolume,
            Request::ReadChunkDone { .. } => Operation::ReadChunkDone,
            Request::ReadChunkError => Operation::ReadChunkError,
            Request::ReadPassphraseDone { .. } => Operation::ReadPassphraseDone,
            Request::ReadPassphraseError => Operation::ReadPassphraseError,
        }
    }

    /// Encode into a wire message addressed to `file_system_id`.
    pub fn encode(self, file_system_id: &str, request_id: RequestId) -> WireMessage {
        let mut msg = WireMessage::basic(self.operation(), file_system_id, request_id);
        match self {
            Request::ReadMetadata {
                encoding,
                archive_size,
            } => {
                msg.encoding = Some(encoding);
                msg.archive_size = Some(archive_size.to_string());
            }
            Request::OpenFile {
                index,
                encoding,
                archive_size,
            } => {
                msg.index = Some(index.to_string());
                msg.encoding = Some(encoding);
                msg.archive_size = Some(archive_size.to_string());
            }
            Request::CloseFile { open_request_id } => {
                msg.open_request_id = Some(open_request_id.to_string());
            }
            Request::ReadFile {
                open_request_id,
                offset,
                length,
            } => {
                msg.open_request_id = Some(open_request_id.to_string());
                msg.offset = Some(offset.to_string());
                msg.length = Some(length.to_string());
            }
            Request::ReadChunkDone { buffer, offset } => {
                msg.chunk_buffer = Some(buffer);
                msg.offset = Some(offset.to_string());
            }
            Request::ReadPassphraseDone { passphrase } => {
                msg.passphrase = Some(passphrase);
            }
            Request::CloseVolume | Request::ReadChunkError | Request::ReadPassphraseError => {}
        }
        msg
    }
}

/// Terminal (or, for open and partial reads, progress) answers to a client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Metadata tree for the archive
    MetadataReady(RawEntry),
    /// File opened; the open record stays alive until close
    OpenDone,
    /// File closed; releases both the close and the open record
    CloseDone {
        /// Request id of the open operation that was closed
        open_request_id: RequestId,
    },
    /// A piece of file data
    ReadDone {
        /// Decompressed bytes
        data: Vec<u8>,
        /// Whether more pieces follow for this request
        has_more_data: bool,
    },
    /// The engine failed the request
    Error(String),
}

/// Requests the engine makes of us while a client request is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubRequest {
    /// Raw archive bytes; values are unvalidated
    ReadChunk {
        /// Requested offset
        offset: u64,
        /// Requested length
        length: u64,
    },
    /// The archive passphrase
    ReadPassphrase,
}

/// A log line emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleMessage {
    /// Whether this is a debug line
    pub debug: bool,
    /// Engine source file
    pub src_file: Option<String>,
    /// Engine source line
    pub src_line: Option<i64>,
    /// Engine source function
    pub src_func: Option<String>,
    /// Log text
    pub message: String,
}

impl ConsoleMessage {
    /// Log the line, attributed to `file_system_id` when it names a volume.
    pub fn log(&self, file_system_id: &str) {
        let src_file = self.src_file.as_deref().unwrap_or_default();
        let src_func = self.src_func.as_deref().unwrap_or_default();
        if self.debug {
            tracing::debug!(
                file_system_id,
                src_file,
                src_line = self.src_line,
                src_func,
                "engine: {}",
                self.message
            );
        } else {
            tracing::info!(
                file_system_id,
                src_file,
                src_line = self.src_line,
                src_func,
                "engine: {}",
                self.message
            );
        }
    }
}

/// Decoded message kinds coming from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineMessage {
    /// Answer to a pending request
    Response(Response),
    /// Engine-initiated request reusing an existing request id
    SubRequest(SubRequest),
    /// Engine log output
    Console(ConsoleMessage),
}

/// A decoded engine message with its routing information.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Owning volume, empty for console output
    pub file_system_id: String,
    /// Request id the message refers to
    pub request_id: RequestId,
    /// Decoded payload
    pub message: EngineMessage,
}

fn parse_u64(field: &'static str, value: Option<String>) -> Result<u64, CodecError> {
    let value = value.ok_or(CodecError::MissingField(field))?;
    value
        .parse()
        .map_err(|_| CodecError::InvalidNumber { field, value })
}

fn parse_request_id(field: &'static str, value: Option<String>) -> Result<RequestId, CodecError> {
    let value = value.ok_or(CodecError::MissingField(field))?;
    value
        .parse()
        .map_err(|_| CodecError::InvalidNumber { field, value })
}

/// Decode a message received from the engine.
///
/// On failure the error still carries the volume and request id the message
/// named, so the owning request can be failed.
pub fn decode(msg: WireMessage) -> Result<Envelope, DecodeError> {
    let file_system_id = msg.file_system_id.clone();
    let request_id = msg.request_id.parse().ok();
    decode_message(msg).map_err(|error| DecodeError {
        file_system_id,
        request_id,
        error,
    })
}

fn decode_message(msg: WireMessage) -> Result<Envelope, CodecError> {
    let operation = Operation::try_from(msg.operation)?;

    if let Operation::ConsoleLog | Operation::ConsoleDebug = operation {
        return Ok(Envelope {
            file_system_id: msg.file_system_id,
            request_id: msg.request_id.parse().unwrap_or(NO_REQUEST_ID),
            message: EngineMessage::Console(ConsoleMessage {
                debug: operation == Operation::ConsoleDebug,
                src_file: msg.src_file,
                src_line: msg.src_line,
                src_func: msg.src_func,
                message: msg.message.unwrap_or_default(),
            }),
        });
    }

    if msg.file_system_id.is_empty() {
        return Err(CodecError::MissingField(key::FILE_SYSTEM_ID));
    }
    let request_id = parse_request_id(key::REQUEST_ID, Some(msg.request_id))?;

    let message = match operation {
        Operation::ReadMetadataDone => EngineMessage::Response(Response::MetadataReady(
            msg.metadata.ok_or(CodecError::MissingField(key::METADATA))?,
        )),
        Operation::OpenFileDone => EngineMessage::Response(Response::OpenDone),
        Operation::CloseFileDone => EngineMessage::Response(Response::CloseDone {
            open_request_id: parse_request_id(key::OPEN_REQUEST_ID, msg.open_request_id)?,
        }),
        Operation::ReadFileDone => EngineMessage::Response(Response::ReadDone {
            data: msg
                .read_file_data
                .ok_or(CodecError::MissingField(key::READ_FILE_DATA))?,
            has_more_data: msg
                .has_more_data
                .ok_or(CodecError::MissingField(key::HAS_MORE_DATA))?,
        }),
        Operation::FileSystemError => {
            EngineMessage::Response(Response::Error(msg.error.unwrap_or_default()))
        }
        Operation::ReadChunk => EngineMessage::SubRequest(SubRequest::ReadChunk {
            offset: parse_u64(key::OFFSET, msg.offset)?,
            length: parse_u64(key::LENGTH, msg.length)?,
        }),
        Operation::ReadPassphrase => EngineMessage::SubRequest(SubRequest::ReadPassphrase),
        other => return Err(CodecError::UnexpectedOperation(other)),
    };

    Ok(Envelope {
        file_system_id: msg.file_system_id,
        request_id,
        message,
    })
}
