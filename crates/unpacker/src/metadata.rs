//! Archive metadata trees.
//!
//! The engine reports metadata as a nested dictionary with sizes as decimal
//! strings and modification times as `time_t` seconds ([`RawEntry`]).
//! [`correct_metadata`] turns that into a typed [`EntryMetadata`] tree, which
//! a volume keeps for its whole lifetime.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::request::key;

/// Metadata entry as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEntry {
    /// Entry name, empty for the root
    #[serde(default)]
    pub name: String,
    /// Size in bytes as a decimal string
    pub size: String,
    /// Whether the entry is a directory
    pub is_directory: bool,
    /// Seconds since the Unix epoch
    pub modification_time: i64,
    /// Position in the engine's header list, as a decimal string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    /// Children in the engine's header order, mandatory for directories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<IndexMap<String, RawEntry>>,
}

/// Metadata for a single archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    /// Entry name, empty for the root
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Whether the entry is a directory
    pub is_directory: bool,
    /// Last modification time
    pub modification_time: SystemTime,
    /// Position in the engine's header list
    pub index: Option<u64>,
    /// Children keyed by name in the order the engine reported them,
    /// empty for files
    pub entries: IndexMap<String, EntryMetadata>,
}

/// Entry details reported to the host, without children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Entry name, empty for the root
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Whether the entry is a directory
    pub is_directory: bool,
    /// Last modification time
    pub modification_time: SystemTime,
}

impl From<&EntryMetadata> for EntryInfo {
    fn from(entry: &EntryMetadata) -> Self {
        Self {
            name: entry.name.clone(),
            size: entry.size,
            is_directory: entry.is_directory,
            modification_time: entry.modification_time,
        }
    }
}

/// Convert a `time_t` value into a calendar time.
pub fn time_from_time_t(timestamp: i64) -> SystemTime {
    let magnitude = Duration::from_secs(timestamp.unsigned_abs());
    if timestamp >= 0 {
        UNIX_EPOCH + magnitude
    } else {
        UNIX_EPOCH - magnitude
    }
}

/// Normalize a raw metadata tree, recursively for every directory.
pub fn correct_metadata(raw: &RawEntry) -> Result<EntryMetadata, CodecError> {
    let size = raw.size.parse().map_err(|_| CodecError::InvalidNumber {
        field: "size",
        value: raw.size.clone(),
    })?;
    let index = raw
        .index
        .as_ref()
        .map(|value| {
            value.parse().map_err(|_| CodecError::InvalidNumber {
                field: key::INDEX,
                value: value.clone(),
            })
        })
        .transpose()?;

    let mut entries = IndexMap::new();
    if raw.is_directory {
        let children = raw
            .entries
            .as_ref()
            .ok_or(CodecError::MissingField("entries"))?;
        for (name, child) in children {
            entries.insert(name.clone(), correct_metadata(child)?);
        }
    }

    Ok(EntryMetadata {
        name: raw.name.clone(),
        size,
        is_directory: raw.is_directory,
        modification_time: time_from_time_t(raw.modification_time),
        index,
        entries,
    })
}

impl EntryMetadata {
    /// Resolve an absolute path relative to this entry.
    ///
    /// Leading and trailing slashes are ignored, so `/`, `/dir` and `/dir/`
    /// all resolve. Walking through a file yields `None`.
    pub fn resolve(&self, path: &str) -> Option<&EntryMetadata> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let path = path.strip_suffix('/').unwrap_or(path);
        if path.is_empty() {
            return Some(self);
        }

        let mut entry = self;
        for segment in path.split('/') {
            if !entry.is_directory {
                return None;
            }
            entry = entry.entries.get(segment)?;
        }
        Some(entry)
    }

    /// Immediate children in stored order.
    pub fn children(&self) -> impl Iterator<Item = &EntryMetadata> {
        self.entries.values()
    }
}
