//! Host collaborators.
//!
//! The session layer never touches the host directly; it goes through these
//! traits:
//! - [`StateStore`] - durable key-value storage for restore records
//! - [`ArchiveSource`] / [`EntryRetainer`] - archive blobs and the tokens
//!   that survive a restart
//! - [`MountRegistry`] - the host's list of mounted file systems
//!
//! Each trait ships with an in-process implementation, plus file-backed
//! ones for storage and archives.

mod archive;
mod mount;
mod storage;

pub use archive::{ArchiveSource, EntryRetainer, FileArchive, MemoryArchive, MemoryRetainer, PathRetainer};
pub use mount::{MountError, MountRegistry, MountTable};
pub use storage::{JsonFileStore, MemoryStateStore, StateStore};
