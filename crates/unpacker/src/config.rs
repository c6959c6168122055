//! Session and engine configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`SessionRegistry`](crate::SessionRegistry)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Key under which all volume records are stored
    pub storage_key: String,
    /// Default encoding for archive headers
    pub encoding: String,
    /// Abandon single-shot engine requests after this long
    #[serde(with = "duration_ms")]
    pub request_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            storage_key: "state".to_string(),
            encoding: "CP1250".to_string(),
            request_timeout: None,
        }
    }
}

/// How to start the decompression engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine executable
    pub program: PathBuf,
    /// Extra arguments passed to the engine
    #[serde(default)]
    pub args: Vec<String>,
}

impl EngineConfig {
    /// Create a config for the given engine executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }
}

/// Helper for serializing an optional Duration as milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}
