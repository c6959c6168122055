//! Unpacker: archives as mountable volumes
//!
//! Unpacker is the session layer between a host file system API and a
//! sandboxed decompression engine. It mounts archives as read-only volumes,
//! answers the host's metadata, listing, open, read and close events by
//! exchanging messages with the engine, and persists enough state to bring
//! volumes back after the process restarts.

mod config;
mod decompressor;
mod error;
mod metadata;
mod passphrase;
mod session;
mod volume;

pub mod engine;
pub mod host;
pub mod request;

#[cfg(test)]
#[allow(clippy::expect_used)]
mod testing;
#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests;

pub use config::{EngineConfig, SessionConfig};
pub use decompressor::{FileChunk, ReadStream};
pub use error::{CodecError, DecodeError, EngineError, ProviderError, StorageError};
pub use metadata::{EntryInfo, EntryMetadata, RawEntry, correct_metadata, time_from_time_t};
pub use passphrase::{
    NoPassphrase, PassphraseError, PassphraseManager, PassphraseProvider, PassphraseResponse,
};
pub use session::{SessionBuilder, SessionRegistry, VolumeState};
pub use volume::{OpenFileOptions, OpenMode, OpenedFile, Volume};
