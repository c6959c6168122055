//! Error types

use thiserror::Error;

/// Errors reported back to the host for a file system event.
///
/// Every host-facing operation resolves to one of these. The enum is `Copy`
/// so a single loading outcome can be handed to every caller waiting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The path does not resolve to an entry
    #[error("not found")]
    NotFound,
    /// A directory operation was requested on a file
    #[error("not a directory")]
    NotADirectory,
    /// Unsupported mode, unknown handle or a state the archive cannot serve
    #[error("invalid operation")]
    InvalidOperation,
    /// The volume still has pending requests or open files
    #[error("volume in use")]
    InUse,
    /// Engine, storage, restore or passphrase failure
    #[error("operation failed")]
    Failed,
}

/// Errors from the durable state store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The stored document could not be (de)serialized
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors from loading or talking to the decompression engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine could not be started
    #[error("failed to load engine: {0}")]
    Load(String),
    /// The engine went away
    #[error("engine channel closed")]
    Closed,
    /// IO error on the engine transport
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A message could not be put on or taken off the wire
    #[error("wire error: {0}")]
    Wire(#[from] serde_json::Error),
}

/// Errors decoding a protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// A field required by the operation is absent
    #[error("missing field: {0}")]
    MissingField(&'static str),
    /// A numeric field is not a decimal string
    #[error("invalid number in {field}: {value:?}")]
    InvalidNumber {
        /// Wire key of the field
        field: &'static str,
        /// Offending value
        value: String,
    },
    /// The operation tag is not one the protocol defines
    #[error("unknown operation: {0}")]
    UnknownOperation(i32),
    /// A client-to-engine operation arrived from the engine
    #[error("unexpected operation from engine: {0:?}")]
    UnexpectedOperation(crate::request::Operation),
}

/// An engine message that could not be decoded, with the routing
/// information it carried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed message for {file_system_id:?} request {request_id:?}: {error}")]
pub struct DecodeError {
    /// Volume named by the message, possibly empty
    pub file_system_id: String,
    /// Request id, if it parsed
    pub request_id: Option<crate::request::RequestId>,
    /// What was wrong with the message
    #[source]
    pub error: CodecError,
}

impl From<StorageError> for ProviderError {
    fn from(err: StorageError) -> Self {
        tracing::error!(error = %err, "state storage failure");
        ProviderError::Failed
    }
}

impl From<EngineError> for ProviderError {
    fn from(err: EngineError) -> Self {
        tracing::error!(error = %err, "engine failure");
        ProviderError::Failed
    }
}
