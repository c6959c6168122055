//! Session registry: every volume of the running session.
//!
//! The registry owns the engine connection and routes each engine message
//! to the volume it names. Volumes are persisted as a single map under
//! [`SessionConfig::storage_key`] so that a restarted session can rebuild
//! them lazily: the first host event for an unknown id restores that volume
//! from its record, and concurrent events for the same id share one
//! restore.
//!
//! Every public operation waits for the engine to be loaded first.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::config::SessionConfig;
use crate::decompressor::{Decompressor, ReadStream, VolumeEvent};
use crate::engine::{EngineInbox, EngineLoader, EnginePeer};
use crate::error::{ProviderError, StorageError};
use crate::host::{ArchiveSource, EntryRetainer, MountRegistry, StateStore};
use crate::metadata::EntryInfo;
use crate::passphrase::{PassphraseManager, PassphraseProvider};
use crate::request::{self, EngineMessage, NO_REQUEST_ID, RequestId, WireMessage};
use crate::volume::{OpenFileOptions, OpenedFile, Volume};

/// What survives a restart for one volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeState {
    /// Retained archive token
    pub entry_id: String,
    /// Remembered passphrase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// Handles open at the last suspend
    #[serde(default)]
    pub opened_files: BTreeMap<RequestId, OpenedFile>,
}

type VolumeLoad = Shared<BoxFuture<'static, Result<Arc<Volume>, ProviderError>>>;

#[derive(Clone)]
enum EngineState {
    Loading,
    Ready(Arc<dyn EnginePeer>),
    Failed,
}

struct Inner {
    config: SessionConfig,
    store: Arc<dyn StateStore>,
    retainer: Arc<dyn EntryRetainer>,
    mounts: Arc<dyn MountRegistry>,
    passphrases: Arc<dyn PassphraseProvider>,
    engine: watch::Sender<EngineState>,
    volumes: Mutex<HashMap<String, Arc<Volume>>>,
    loads: Mutex<HashMap<String, VolumeLoad>>,
    events: mpsc::UnboundedSender<VolumeEvent>,
    event_inbox: Mutex<Option<mpsc::UnboundedReceiver<VolumeEvent>>>,
    state_lock: tokio::sync::Mutex<()>,
}

impl Inner {
    fn volumes(&self) -> MutexGuard<'_, HashMap<String, Arc<Volume>>> {
        self.volumes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn loads(&self) -> MutexGuard<'_, HashMap<String, VolumeLoad>> {
        self.loads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builder for a [`SessionRegistry`].
pub struct SessionBuilder {
    config: SessionConfig,
    store: Arc<dyn StateStore>,
    retainer: Arc<dyn EntryRetainer>,
    mounts: Arc<dyn MountRegistry>,
    passphrases: Arc<dyn PassphraseProvider>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionBuilder {
    /// Set the session configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the passphrase provider. Defaults to one that always cancels.
    pub fn passphrases(mut self, provider: Arc<dyn PassphraseProvider>) -> Self {
        self.passphrases = provider;
        self
    }

    /// Build the registry. The engine still has to be loaded with
    /// [`SessionRegistry::load_engine`].
    pub fn build(self) -> SessionRegistry {
        let (engine, _) = watch::channel(EngineState::Loading);
        let (events, event_inbox) = mpsc::unbounded_channel();
        SessionRegistry {
            inner: Arc::new(Inner {
                config: self.config,
                store: self.store,
                retainer: self.retainer,
                mounts: self.mounts,
                passphrases: self.passphrases,
                engine,
                volumes: Mutex::new(HashMap::new()),
                loads: Mutex::new(HashMap::new()),
                events,
                event_inbox: Mutex::new(Some(event_inbox)),
                state_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

/// Handle to the session. Cheap to clone.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("volumes", &self.inner.volumes().len())
            .field("loading", &self.inner.loads().len())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Start building a registry over the given host collaborators.
    pub fn builder(
        store: Arc<dyn StateStore>,
        retainer: Arc<dyn EntryRetainer>,
        mounts: Arc<dyn MountRegistry>,
    ) -> SessionBuilder {
        SessionBuilder {
            config: SessionConfig::default(),
            store,
            retainer,
            mounts,
            passphrases: Arc::new(crate::passphrase::NoPassphrase),
        }
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Load the engine and start routing its messages.
    ///
    /// Operations issued before this resolves wait for it. If loading fails
    /// they fail too.
    pub async fn load_engine(&self, loader: &dyn EngineLoader) -> Result<(), ProviderError> {
        let events = self
            .inner
            .event_inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(events) = events else {
            tracing::warn!("engine already loaded");
            return Err(ProviderError::InvalidOperation);
        };

        match loader.load().await {
            Ok((peer, inbox)) => {
                tokio::spawn(dispatch(Arc::downgrade(&self.inner), inbox, events));
                self.inner.engine.send_replace(EngineState::Ready(peer));
                tracing::info!("engine loaded");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "engine failed to load");
                self.inner.engine.send_replace(EngineState::Failed);
                Err(ProviderError::Failed)
            }
        }
    }

    async fn engine(&self) -> Result<Arc<dyn EnginePeer>, ProviderError> {
        let mut rx = self.inner.engine.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, EngineState::Loading))
            .await
            .map_err(|_| ProviderError::Failed)?
            .clone();
        match state {
            EngineState::Ready(peer) => Ok(peer),
            _ => Err(ProviderError::Failed),
        }
    }

    /// Ids of the volumes currently in memory, sorted.
    pub fn volume_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.volumes().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The in-memory volume for `file_system_id`, if loaded.
    pub fn volume(&self, file_system_id: &str) -> Option<Arc<Volume>> {
        self.inner.volumes().get(file_system_id).cloned()
    }

    fn create_volume(
        &self,
        file_system_id: &str,
        entry: Arc<dyn ArchiveSource>,
        engine: Arc<dyn EnginePeer>,
        passphrase: Option<String>,
    ) -> Arc<Volume> {
        let passphrases = Arc::new(PassphraseManager::new(
            Arc::clone(&self.inner.passphrases),
            passphrase,
        ));
        let decompressor = Arc::new(Decompressor::new(
            file_system_id,
            engine,
            Arc::clone(&entry),
            passphrases,
            self.inner.events.clone(),
            self.inner.config.encoding.clone(),
            self.inner.config.request_timeout,
        ));
        let volume = Arc::new(Volume::new(file_system_id, entry, decompressor));
        self.inner
            .volumes()
            .insert(file_system_id.to_string(), Arc::clone(&volume));
        volume
    }

    /// Mount a new archive and persist it. Returns the volume id.
    pub async fn mount(&self, entry: Arc<dyn ArchiveSource>) -> Result<String, ProviderError> {
        let engine = self.engine().await?;
        let file_system_id = entry.display_path().to_string();

        let load = {
            let mut loads = self.inner.loads();
            if loads.contains_key(&file_system_id) {
                tracing::warn!(file_system_id = %file_system_id, "volume already mounted");
                return Err(ProviderError::InvalidOperation);
            }
            let this = self.clone();
            let id = file_system_id.clone();
            let load = async move { this.mount_volume(id, entry, engine).await }
                .boxed()
                .shared();
            loads.insert(file_system_id.clone(), load.clone());
            load
        };

        load.await.map(|_| file_system_id)
    }

    async fn mount_volume(
        &self,
        file_system_id: String,
        entry: Arc<dyn ArchiveSource>,
        engine: Arc<dyn EnginePeer>,
    ) -> Result<Arc<Volume>, ProviderError> {
        tracing::info!(file_system_id = %file_system_id, "mounting volume");
        let display_name = entry.name().to_string();
        let volume = self.create_volume(&file_system_id, entry, engine, None);

        if let Err(e) = volume.initialize(NO_REQUEST_ID).await {
            self.abort_mount(&file_system_id).await;
            return Err(e);
        }

        if let Err(e) = self.inner.mounts.mount(&file_system_id, &display_name).await {
            tracing::error!(file_system_id = %file_system_id, error = %e, "host refused mount");
            self.abort_mount(&file_system_id).await;
            return Err(ProviderError::Failed);
        }

        if let Err(e) = self.save_state(&[file_system_id.clone()]).await {
            if let Err(e) = self.inner.mounts.unmount(&file_system_id).await {
                tracing::warn!(file_system_id = %file_system_id, error = %e, "failed to roll back mount");
            }
            self.abort_mount(&file_system_id).await;
            return Err(e);
        }

        tracing::info!(file_system_id = %file_system_id, "volume mounted");
        Ok(volume)
    }

    /// The volume for `file_system_id`, restoring it from its persisted
    /// record if it is not in memory.
    ///
    /// Concurrent calls for the same id share a single restore. A restore
    /// that fails force-unmounts the volume.
    pub async fn restore(
        &self,
        file_system_id: &str,
        request_id: RequestId,
    ) -> Result<Arc<Volume>, ProviderError> {
        let engine = self.engine().await?;

        let load = {
            let mut loads = self.inner.loads();
            match loads.get(file_system_id) {
                Some(load) => load.clone(),
                None => {
                    let this = self.clone();
                    let id = file_system_id.to_string();
                    let load = async move { this.restore_volume(id, request_id, engine).await }
                        .boxed()
                        .shared();
                    loads.insert(file_system_id.to_string(), load.clone());
                    load
                }
            }
        };

        load.await
    }

    async fn restore_volume(
        &self,
        file_system_id: String,
        request_id: RequestId,
        engine: Arc<dyn EnginePeer>,
    ) -> Result<Arc<Volume>, ProviderError> {
        tracing::info!(file_system_id = %file_system_id, "restoring volume");

        let restored = async {
            let state = self
                .load_state()
                .await?
                .remove(&file_system_id)
                .ok_or_else(|| {
                    tracing::error!(file_system_id = %file_system_id, "no persisted state for volume");
                    ProviderError::Failed
                })?;

            let entry = self
                .inner
                .retainer
                .restore(&state.entry_id)
                .await
                .map_err(|e| {
                    tracing::error!(
                        file_system_id = %file_system_id,
                        error = %e,
                        "failed to restore archive entry"
                    );
                    ProviderError::Failed
                })?;

            let volume = self.create_volume(&file_system_id, entry, engine, state.passphrase);
            volume.initialize(request_id).await?;
            volume.restore_opened_files(state.opened_files).await?;
            Ok(volume)
        }
        .await;

        match restored {
            Ok(volume) => {
                tracing::info!(file_system_id = %file_system_id, "volume restored");
                Ok(volume)
            }
            Err(e) => {
                if let Err(unmount) = self.unmount(&file_system_id, true).await {
                    tracing::warn!(
                        file_system_id = %file_system_id,
                        error = %unmount,
                        "failed to unmount volume after restore error"
                    );
                }
                Err(e)
            }
        }
    }

    /// Unmount a volume and forget its persisted record.
    ///
    /// Without `force`, a volume with pending requests or open files is
    /// left alone and [`ProviderError::InUse`] is returned. With `force`,
    /// host errors are logged and teardown continues.
    pub async fn unmount(&self, file_system_id: &str, force: bool) -> Result<(), ProviderError> {
        if !force {
            if let Some(volume) = self.volume(file_system_id) {
                if volume.is_in_use() {
                    tracing::warn!(file_system_id = %file_system_id, "volume in use");
                    return Err(ProviderError::InUse);
                }
            }
        }

        if let Err(e) = self.inner.mounts.unmount(file_system_id).await {
            if force {
                tracing::warn!(file_system_id = %file_system_id, error = %e, "host unmount failed, cleaning up anyway");
            } else {
                tracing::error!(file_system_id = %file_system_id, error = %e, "host unmount failed");
                return Err(ProviderError::Failed);
            }
        }

        self.cleanup_volume(file_system_id);
        match self.remove_state(file_system_id).await {
            Ok(()) => {}
            Err(_) if force => {}
            Err(e) => return Err(e),
        }
        tracing::info!(file_system_id = %file_system_id, force, "volume unmounted");
        Ok(())
    }

    /// Tear down a volume whose mount did not complete, persisted record included.
    async fn abort_mount(&self, file_system_id: &str) {
        self.cleanup_volume(file_system_id);
        if let Err(e) = self.remove_state(file_system_id).await {
            tracing::warn!(file_system_id = %file_system_id, error = %e, "failed to drop record of failed mount");
        }
    }

    fn cleanup_volume(&self, file_system_id: &str) {
        let volume = self.inner.volumes().remove(file_system_id);
        self.inner.loads().remove(file_system_id);
        if let Some(volume) = volume {
            volume.shutdown();
        }
    }

    async fn load_state(&self) -> Result<BTreeMap<String, VolumeState>, ProviderError> {
        match self.inner.store.get(&self.inner.config.storage_key).await? {
            Some(value) => Ok(serde_json::from_value(value).map_err(StorageError::from)?),
            None => Ok(BTreeMap::new()),
        }
    }

    async fn store_state(&self, state: &BTreeMap<String, VolumeState>) -> Result<(), ProviderError> {
        let value = serde_json::to_value(state).map_err(StorageError::from)?;
        self.inner
            .store
            .set(&self.inner.config.storage_key, value)
            .await?;
        Ok(())
    }

    /// Persist the records of the given in-memory volumes.
    ///
    /// Volumes still reading their metadata are skipped; they get a record
    /// once their mount or restore has got that far.
    async fn save_state(&self, file_system_ids: &[String]) -> Result<(), ProviderError> {
        let _guard = self.inner.state_lock.lock().await;
        let mut state = self.load_state().await?;
        for file_system_id in file_system_ids {
            let Some(volume) = self.volume(file_system_id) else {
                continue;
            };
            if !volume.is_ready() {
                tracing::debug!(file_system_id = %file_system_id, "volume not ready, not persisting");
                continue;
            }
            state.insert(
                file_system_id.clone(),
                VolumeState {
                    entry_id: self.inner.retainer.retain(volume.entry()),
                    passphrase: volume.passphrase(),
                    opened_files: volume.opened_files(),
                },
            );
        }
        self.store_state(&state).await
    }

    async fn remove_state(&self, file_system_id: &str) -> Result<(), ProviderError> {
        let _guard = self.inner.state_lock.lock().await;
        let mut state = self.load_state().await?;
        if state.remove(file_system_id).is_none() {
            tracing::debug!(file_system_id = %file_system_id, "no persisted state to remove");
            return Ok(());
        }
        self.store_state(&state).await
    }

    /// The persisted record of `file_system_id`.
    pub async fn persisted_state(
        &self,
        file_system_id: &str,
    ) -> Result<Option<VolumeState>, ProviderError> {
        Ok(self.load_state().await?.remove(file_system_id))
    }

    /// Persist every in-memory volume, open handles included.
    pub async fn on_suspend(&self) -> Result<(), ProviderError> {
        self.engine().await?;
        self.save_state(&self.volume_ids()).await
    }

    /// Forget open handles left over from a previous session.
    pub async fn on_startup(&self) -> Result<(), ProviderError> {
        self.engine().await?;
        let _guard = self.inner.state_lock.lock().await;
        let mut state = self.load_state().await?;
        if state.values().all(|s| s.opened_files.is_empty()) {
            return Ok(());
        }
        for record in state.values_mut() {
            record.opened_files.clear();
        }
        self.store_state(&state).await
    }

    /// Host event: metadata of one entry.
    pub async fn get_metadata(
        &self,
        file_system_id: &str,
        request_id: RequestId,
        entry_path: &str,
    ) -> Result<EntryInfo, ProviderError> {
        self.restore(file_system_id, request_id)
            .await?
            .get_metadata(entry_path)
    }

    /// Host event: list a directory.
    pub async fn read_directory(
        &self,
        file_system_id: &str,
        request_id: RequestId,
        directory_path: &str,
    ) -> Result<Vec<EntryInfo>, ProviderError> {
        self.restore(file_system_id, request_id)
            .await?
            .list_directory(directory_path)
    }

    /// Host event: open a file.
    pub async fn open_file(
        &self,
        file_system_id: &str,
        options: OpenFileOptions,
    ) -> Result<(), ProviderError> {
        self.restore(file_system_id, options.request_id)
            .await?
            .open_file(options)
            .await
    }

    /// Host event: close a file.
    pub async fn close_file(
        &self,
        file_system_id: &str,
        request_id: RequestId,
        open_request_id: RequestId,
    ) -> Result<(), ProviderError> {
        self.restore(file_system_id, request_id)
            .await?
            .close_file(request_id, open_request_id)
            .await
    }

    /// Host event: read from an open file.
    pub async fn read_file(
        &self,
        file_system_id: &str,
        request_id: RequestId,
        open_request_id: RequestId,
        offset: u64,
        length: u64,
    ) -> Result<ReadStream, ProviderError> {
        self.restore(file_system_id, request_id)
            .await?
            .read_file(request_id, open_request_id, offset, length)
    }

    /// Host event: the user asked to unmount.
    pub async fn unmount_requested(&self, file_system_id: &str) -> Result<(), ProviderError> {
        self.engine().await?;
        self.unmount(file_system_id, false).await
    }

    fn handle_engine_message(&self, message: WireMessage) {
        let envelope = match request::decode(message) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "malformed engine message");
                let volume = self.volume(&e.file_system_id);
                if let (Some(request_id), Some(volume)) = (e.request_id, volume) {
                    volume
                        .decompressor()
                        .fail_request(request_id, &e.error.to_string());
                }
                return;
            }
        };

        match (self.volume(&envelope.file_system_id), envelope.message) {
            (Some(volume), message) => volume
                .decompressor()
                .process_message(envelope.request_id, message),
            (None, EngineMessage::Console(console)) => console.log(&envelope.file_system_id),
            (None, _) => tracing::error!(
                file_system_id = %envelope.file_system_id,
                request_id = envelope.request_id,
                "engine message for a volume that is not loaded"
            ),
        }
    }

    fn handle_event(&self, event: VolumeEvent) {
        let this = self.clone();
        match event {
            VolumeEvent::PassphraseRemembered(file_system_id) => {
                tokio::spawn(async move {
                    if let Err(e) = this.save_state(&[file_system_id.clone()]).await {
                        tracing::error!(file_system_id = %file_system_id, error = %e, "failed to persist passphrase");
                    }
                });
            }
            VolumeEvent::Irrecoverable(file_system_id) => {
                tokio::spawn(async move {
                    if let Err(e) = this.unmount(&file_system_id, true).await {
                        tracing::error!(file_system_id = %file_system_id, error = %e, "failed to unmount irrecoverable volume");
                    }
                });
            }
        }
    }

    fn engine_closed(&self) {
        tracing::error!("engine closed, failing all volumes");
        self.inner.engine.send_replace(EngineState::Failed);
        let volumes: Vec<_> = self.inner.volumes().values().cloned().collect();
        for volume in volumes {
            volume.decompressor().abandon_all();
        }
    }
}

async fn dispatch(
    inner: Weak<Inner>,
    mut inbox: EngineInbox,
    mut events: mpsc::UnboundedReceiver<VolumeEvent>,
) {
    loop {
        tokio::select! {
            message = inbox.recv() => {
                let Some(inner) = inner.upgrade() else { return };
                let registry = SessionRegistry { inner };
                match message {
                    Some(message) => registry.handle_engine_message(message),
                    None => {
                        registry.engine_closed();
                        return;
                    }
                }
            }
            event = events.recv() => {
                let (Some(event), Some(inner)) = (event, inner.upgrade()) else { return };
                SessionRegistry { inner }.handle_event(event);
            }
        }
    }
}
