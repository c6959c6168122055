//! Host mount registration.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors from the host mount registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MountError {
    /// The id is already mounted
    #[error("already mounted: {0}")]
    AlreadyMounted(String),
    /// The id is not mounted
    #[error("not mounted: {0}")]
    NotMounted(String),
    /// Any other host failure
    #[error("mount registry error: {0}")]
    Host(String),
}

/// The host's registry of mounted file systems.
#[async_trait]
pub trait MountRegistry: Send + Sync {
    /// Make a volume visible to the host.
    async fn mount(&self, file_system_id: &str, display_name: &str) -> Result<(), MountError>;

    /// Remove a volume from the host.
    async fn unmount(&self, file_system_id: &str) -> Result<(), MountError>;
}

/// In-process mount registry.
#[derive(Debug, Default)]
pub struct MountTable {
    mounted: RwLock<BTreeMap<String, String>>,
}

impl MountTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounted ids with their display names.
    pub async fn mounted(&self) -> Vec<(String, String)> {
        self.mounted
            .read()
            .await
            .iter()
            .map(|(id, name)| (id.clone(), name.clone()))
            .collect()
    }

    /// Whether `file_system_id` is mounted.
    pub async fn is_mounted(&self, file_system_id: &str) -> bool {
        self.mounted.read().await.contains_key(file_system_id)
    }
}

#[async_trait]
impl MountRegistry for MountTable {
    async fn mount(&self, file_system_id: &str, display_name: &str) -> Result<(), MountError> {
        let mut mounted = self.mounted.write().await;
        if mounted.contains_key(file_system_id) {
            return Err(MountError::AlreadyMounted(file_system_id.to_string()));
        }
        mounted.insert(file_system_id.to_string(), display_name.to_string());
        Ok(())
    }

    async fn unmount(&self, file_system_id: &str) -> Result<(), MountError> {
        self.mounted
            .write()
            .await
            .remove(file_system_id)
            .map(|_| ())
            .ok_or_else(|| MountError::NotMounted(file_system_id.to_string()))
    }
}
