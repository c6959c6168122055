//! Session-level tests against a scripted engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use std::collections::BTreeMap;

use crate::host::{
    ArchiveSource, MemoryArchive, MemoryRetainer, MemoryStateStore, MountRegistry, MountTable,
    StateStore,
};
use crate::passphrase::{
    NoPassphrase, PassphraseError, PassphraseProvider, PassphraseResponse,
};
use crate::request::{Operation, WireMessage};
use crate::testing::{BrokenLoader, ScriptedEngine, ScriptedLoader, init_tracing, sample_content};
use crate::{OpenFileOptions, OpenMode, ProviderError, SessionRegistry, VolumeState};

const ARCHIVE: &str = "/downloads/photos.zip";

#[derive(Clone)]
struct Host {
    store: Arc<MemoryStateStore>,
    retainer: Arc<MemoryRetainer>,
    mounts: Arc<MountTable>,
}

impl Host {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStateStore::new()),
            retainer: Arc::new(MemoryRetainer::new()),
            mounts: Arc::new(MountTable::new()),
        }
    }

    fn registry(&self, provider: Arc<dyn PassphraseProvider>) -> SessionRegistry {
        SessionRegistry::builder(
            self.store.clone(),
            self.retainer.clone(),
            self.mounts.clone(),
        )
        .passphrases(provider)
        .build()
    }

    /// A registry with its engine loaded, as after a process start.
    async fn session(
        &self,
        engine: &Arc<ScriptedEngine>,
        provider: Arc<dyn PassphraseProvider>,
    ) -> SessionRegistry {
        init_tracing();
        let registry = self.registry(provider);
        registry
            .load_engine(&ScriptedLoader(engine.clone()))
            .await
            .expect("engine should load");
        registry
    }
}

fn archive() -> Arc<dyn ArchiveSource> {
    Arc::new(MemoryArchive::new(ARCHIVE, (0u8..64).collect()))
}

struct Remembering(&'static str);

#[async_trait]
impl PassphraseProvider for Remembering {
    async fn prompt(&self, _id: &str) -> Result<PassphraseResponse, PassphraseError> {
        Ok(PassphraseResponse {
            passphrase: self.0.to_string(),
            remember: true,
        })
    }
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held");
}

async fn wait_for_sent(engine: &ScriptedEngine, operation: Operation) {
    wait_until(|| {
        let sent = engine.count(operation);
        async move { sent > 0 }
    })
    .await;
}

fn spawn_mount(session: &SessionRegistry) -> tokio::task::JoinHandle<Result<String, ProviderError>> {
    let session = session.clone();
    tokio::spawn(async move { session.mount(archive()).await })
}

#[tokio::test]
async fn test_mount_lists_root() {
    let host = Host::new();
    let engine = ScriptedEngine::new();
    let session = host.session(&engine, Arc::new(NoPassphrase)).await;

    let id = session.mount(archive()).await.unwrap();
    assert_eq!(id, ARCHIVE);
    assert!(host.mounts.is_mounted(ARCHIVE).await);
    assert_eq!(engine.count(Operation::ReadChunkDone), 1);

    let names: Vec<_> = session
        .read_directory(&id, 1, "/")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, ["file2", "file1", "dir"]);

    let file3 = session.get_metadata(&id, 2, "/dir/file3").await.unwrap();
    assert_eq!(file3.size, 56);
    assert!(!file3.is_directory);

    let state = session.persisted_state(&id).await.unwrap().unwrap();
    assert_eq!(state.entry_id, ARCHIVE);
    assert!(state.passphrase.is_none());
}

#[tokio::test]
async fn test_mount_twice_is_rejected() {
    let host = Host::new();
    let engine = ScriptedEngine::new();
    let session = host.session(&engine, Arc::new(NoPassphrase)).await;

    session.mount(archive()).await.unwrap();
    assert_eq!(
        session.mount(archive()).await,
        Err(ProviderError::InvalidOperation)
    );
    assert_eq!(engine.count(Operation::ReadMetadata), 1);
}

#[tokio::test]
async fn test_failed_mount_leaves_nothing_behind() {
    let host = Host::new();
    let engine = ScriptedEngine::new();
    let session = host.session(&engine, Arc::new(NoPassphrase)).await;

    engine.fail_metadata(true);
    assert_eq!(session.mount(archive()).await, Err(ProviderError::Failed));
    assert!(session.volume_ids().is_empty());
    assert!(!host.mounts.is_mounted(ARCHIVE).await);
    assert!(session.persisted_state(ARCHIVE).await.unwrap().is_none());
    assert_eq!(engine.count(Operation::CloseVolume), 1);

    engine.fail_metadata(false);
    assert_eq!(session.mount(archive()).await.unwrap(), ARCHIVE);
}

#[tokio::test]
async fn test_open_read_close() {
    let host = Host::new();
    let engine = ScriptedEngine::new();
    let session = host.session(&engine, Arc::new(NoPassphrase)).await;
    let id = session.mount(archive()).await.unwrap();

    session
        .open_file(&id, OpenFileOptions::read(2, "/file2"))
        .await
        .unwrap();

    let whole = session
        .read_file(&id, 3, 2, 0, 1000)
        .await
        .unwrap()
        .read_to_end()
        .await
        .unwrap();
    assert_eq!(whole, sample_content(1));
    let read = engine
        .sent()
        .into_iter()
        .find(|m| m.operation == Operation::ReadFile.tag())
        .unwrap();
    assert_eq!(read.length.as_deref(), Some("33"));

    let tail = session
        .read_file(&id, 4, 2, 30, 10)
        .await
        .unwrap()
        .read_to_end()
        .await
        .unwrap();
    assert_eq!(tail, sample_content(1)[30..].to_vec());

    session.close_file(&id, 5, 2).await.unwrap();
    assert!(!session.volume(&id).unwrap().is_in_use());
    assert_eq!(
        session.read_file(&id, 6, 2, 0, 1).await.unwrap_err(),
        ProviderError::InvalidOperation
    );
}

#[tokio::test]
async fn test_open_for_write_is_invalid() {
    let host = Host::new();
    let engine = ScriptedEngine::new();
    let session = host.session(&engine, Arc::new(NoPassphrase)).await;
    let id = session.mount(archive()).await.unwrap();

    let mut options = OpenFileOptions::read(1, "/file1");
    options.mode = OpenMode::Write;
    assert_eq!(
        session.open_file(&id, options).await,
        Err(ProviderError::InvalidOperation)
    );
    assert_eq!(engine.count(Operation::OpenFile), 0);
}

#[tokio::test]
async fn test_unmount_refused_while_in_use() {
    let host = Host::new();
    let engine = ScriptedEngine::new();
    let session = host.session(&engine, Arc::new(NoPassphrase)).await;
    let id = session.mount(archive()).await.unwrap();

    session
        .open_file(&id, OpenFileOptions::read(1, "/file1"))
        .await
        .unwrap();
    assert_eq!(
        session.unmount_requested(&id).await,
        Err(ProviderError::InUse)
    );
    assert!(host.mounts.is_mounted(&id).await);

    session.close_file(&id, 2, 1).await.unwrap();
    session.unmount_requested(&id).await.unwrap();
    assert!(!host.mounts.is_mounted(&id).await);
    assert!(session.volume_ids().is_empty());
    assert!(session.persisted_state(&id).await.unwrap().is_none());
    assert_eq!(engine.count(Operation::CloseVolume), 1);
}

#[tokio::test]
async fn test_forced_unmount_of_unknown_volume_succeeds() {
    let host = Host::new();
    let engine = ScriptedEngine::new();
    let session = host.session(&engine, Arc::new(NoPassphrase)).await;

    assert_eq!(
        session.unmount("/never/mounted.zip", false).await,
        Err(ProviderError::Failed)
    );
    session.unmount("/never/mounted.zip", true).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_restores_share_one_load() {
    let host = Host::new();
    let first = ScriptedEngine::new();
    let id = host
        .session(&first, Arc::new(NoPassphrase))
        .await
        .mount(archive())
        .await
        .unwrap();

    let engine = ScriptedEngine::new();
    let session = host.session(&engine, Arc::new(NoPassphrase)).await;
    let (metadata, listing) = tokio::join!(
        session.get_metadata(&id, 10, "/file1"),
        session.read_directory(&id, 11, "/dir"),
    );

    assert_eq!(metadata.unwrap().size, 15);
    assert_eq!(listing.unwrap().len(), 1);
    assert_eq!(engine.count(Operation::ReadMetadata), 1);
    let metadata_request = engine
        .sent()
        .into_iter()
        .find(|m| m.operation == Operation::ReadMetadata.tag())
        .unwrap();
    assert_eq!(metadata_request.request_id, "10");
}

#[tokio::test]
async fn test_failed_restore_unmounts_and_allows_remount() {
    let host = Host::new();
    let first = ScriptedEngine::new();
    let id = host
        .session(&first, Arc::new(NoPassphrase))
        .await
        .mount(archive())
        .await
        .unwrap();
    host.retainer.forget(&id);

    let engine = ScriptedEngine::new();
    let session = host.session(&engine, Arc::new(NoPassphrase)).await;
    assert_eq!(
        session.get_metadata(&id, 1, "/").await,
        Err(ProviderError::Failed)
    );
    assert!(!host.mounts.is_mounted(&id).await);
    assert!(session.persisted_state(&id).await.unwrap().is_none());
    assert!(session.volume_ids().is_empty());

    assert_eq!(session.mount(archive()).await.unwrap(), id);
    assert_eq!(session.read_directory(&id, 2, "/").await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_restore_reopens_files_from_suspend() {
    let host = Host::new();
    let first = ScriptedEngine::new();
    let before = host.session(&first, Arc::new(NoPassphrase)).await;
    let id = before.mount(archive()).await.unwrap();
    before
        .open_file(&id, OpenFileOptions::read(7, "/file1"))
        .await
        .unwrap();
    before.on_suspend().await.unwrap();

    let state = before.persisted_state(&id).await.unwrap().unwrap();
    assert_eq!(
        state.opened_files.get(&7).map(|o| o.file_path.as_str()),
        Some("/file1")
    );

    let engine = ScriptedEngine::new();
    let session = host.session(&engine, Arc::new(NoPassphrase)).await;
    let data = session
        .read_file(&id, 8, 7, 0, 15)
        .await
        .unwrap()
        .read_to_end()
        .await
        .unwrap();
    assert_eq!(data, sample_content(0));

    let reopen = engine
        .sent()
        .into_iter()
        .find(|m| m.operation == Operation::OpenFile.tag())
        .unwrap();
    assert_eq!(reopen.request_id, "7");
    assert_eq!(reopen.index.as_deref(), Some("0"));
}

#[tokio::test]
async fn test_startup_forgets_open_handles() {
    let host = Host::new();
    let first = ScriptedEngine::new();
    let before = host.session(&first, Arc::new(NoPassphrase)).await;
    let id = before.mount(archive()).await.unwrap();
    before
        .open_file(&id, OpenFileOptions::read(7, "/file1"))
        .await
        .unwrap();
    before.on_suspend().await.unwrap();

    let engine = ScriptedEngine::new();
    let session = host.session(&engine, Arc::new(NoPassphrase)).await;
    session.on_startup().await.unwrap();

    let state = session.persisted_state(&id).await.unwrap().unwrap();
    assert!(state.opened_files.is_empty());
    assert_eq!(state.entry_id, ARCHIVE);

    session.get_metadata(&id, 1, "/").await.unwrap();
    assert_eq!(engine.count(Operation::OpenFile), 0);
}

#[tokio::test]
async fn test_remembered_passphrase_survives_restart() {
    let host = Host::new();
    let first = ScriptedEngine::encrypted("hunter2");
    let before = host.session(&first, Arc::new(Remembering("hunter2"))).await;
    let id = before.mount(archive()).await.unwrap();
    before
        .open_file(&id, OpenFileOptions::read(1, "/file1"))
        .await
        .unwrap();
    assert_eq!(first.count(Operation::ReadPassphraseDone), 1);

    wait_until(|| {
        let before = before.clone();
        let id = id.clone();
        async move {
            before
                .persisted_state(&id)
                .await
                .unwrap()
                .is_some_and(|s| s.passphrase.as_deref() == Some("hunter2"))
        }
    })
    .await;

    let engine = ScriptedEngine::encrypted("hunter2");
    let session = host.session(&engine, Arc::new(NoPassphrase)).await;
    session
        .open_file(&id, OpenFileOptions::read(2, "/file2"))
        .await
        .unwrap();
    assert_eq!(engine.count(Operation::ReadPassphraseDone), 1);
}

#[tokio::test]
async fn test_cancelled_passphrase_unmounts_volume() {
    let host = Host::new();
    let engine = ScriptedEngine::encrypted("hunter2");
    let session = host.session(&engine, Arc::new(NoPassphrase)).await;
    let id = session.mount(archive()).await.unwrap();

    assert_eq!(
        session
            .open_file(&id, OpenFileOptions::read(1, "/file1"))
            .await,
        Err(ProviderError::Failed)
    );
    assert_eq!(engine.count(Operation::ReadPassphraseError), 1);

    wait_until(|| {
        let session = session.clone();
        let id = id.clone();
        async move { session.persisted_state(&id).await.unwrap().is_none() }
    })
    .await;
    assert!(session.volume_ids().is_empty());
    assert!(!host.mounts.is_mounted(&id).await);
}

#[tokio::test]
async fn test_read_racing_close_is_harmless() {
    let host = Host::new();
    let engine = ScriptedEngine::new();
    let session = host.session(&engine, Arc::new(NoPassphrase)).await;
    let id = session.mount(archive()).await.unwrap();
    session
        .open_file(&id, OpenFileOptions::read(1, "/file2"))
        .await
        .unwrap();

    engine.hold_reads(true);
    let stream = session.read_file(&id, 2, 1, 0, 8).await.unwrap();
    session.close_file(&id, 3, 1).await.unwrap();
    engine.release_held();

    assert_eq!(stream.read_to_end().await, Err(ProviderError::Failed));
    assert_eq!(
        session.read_file(&id, 4, 1, 0, 8).await.unwrap_err(),
        ProviderError::InvalidOperation
    );
    assert!(!session.volume(&id).unwrap().is_in_use());
}

#[tokio::test]
async fn test_operations_wait_for_engine() {
    init_tracing();
    let host = Host::new();
    let engine = ScriptedEngine::new();
    let session = host.registry(Arc::new(NoPassphrase));

    let pending = tokio::spawn({
        let session = session.clone();
        async move { session.mount(archive()).await }
    });
    tokio::task::yield_now().await;
    assert!(!pending.is_finished());

    session
        .load_engine(&ScriptedLoader(engine.clone()))
        .await
        .unwrap();
    assert_eq!(pending.await.unwrap().unwrap(), ARCHIVE);
    assert_eq!(engine.load_count(), 1);

    assert_eq!(
        session.load_engine(&ScriptedLoader(engine.clone())).await,
        Err(ProviderError::InvalidOperation)
    );
}

#[tokio::test]
async fn test_engine_load_failure_fails_operations() {
    init_tracing();
    let host = Host::new();
    let session = host.registry(Arc::new(NoPassphrase));

    assert_eq!(
        session.load_engine(&BrokenLoader).await,
        Err(ProviderError::Failed)
    );
    assert_eq!(session.mount(archive()).await, Err(ProviderError::Failed));
    assert_eq!(
        session.get_metadata(ARCHIVE, 1, "/").await,
        Err(ProviderError::Failed)
    );
}

#[tokio::test]
async fn test_unknown_operation_fails_pending_request() {
    let host = Host::new();
    let engine = ScriptedEngine::new();
    let session = host.session(&engine, Arc::new(NoPassphrase)).await;
    engine.hold_metadata(true);

    let pending = spawn_mount(&session);
    wait_for_sent(&engine, Operation::ReadMetadata).await;
    engine.inject(WireMessage {
        operation: 42,
        file_system_id: ARCHIVE.to_string(),
        request_id: "-1".to_string(),
        ..Default::default()
    });

    let mounted = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("mount should fail instead of waiting")
        .unwrap();
    assert_eq!(mounted, Err(ProviderError::Failed));
    assert!(session.volume_ids().is_empty());
    assert!(!host.mounts.is_mounted(ARCHIVE).await);
}

#[tokio::test]
async fn test_incomplete_response_fails_pending_request() {
    let host = Host::new();
    let engine = ScriptedEngine::new();
    let session = host.session(&engine, Arc::new(NoPassphrase)).await;
    engine.hold_metadata(true);

    let pending = spawn_mount(&session);
    wait_for_sent(&engine, Operation::ReadMetadata).await;
    engine.inject(WireMessage {
        operation: Operation::ReadMetadataDone.tag(),
        file_system_id: ARCHIVE.to_string(),
        request_id: "-1".to_string(),
        ..Default::default()
    });

    let mounted = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("mount should fail instead of waiting")
        .unwrap();
    assert_eq!(mounted, Err(ProviderError::Failed));
    assert!(session.volume_ids().is_empty());

    engine.hold_metadata(false);
    assert_eq!(session.mount(archive()).await.unwrap(), ARCHIVE);
}

#[tokio::test]
async fn test_suspend_during_failed_mount_persists_nothing() {
    let host = Host::new();
    let engine = ScriptedEngine::new();
    let session = host.session(&engine, Arc::new(NoPassphrase)).await;
    engine.fail_metadata(true);
    engine.hold_metadata(true);

    let pending = spawn_mount(&session);
    wait_for_sent(&engine, Operation::ReadMetadata).await;
    assert_eq!(session.volume_ids(), [ARCHIVE]);

    session.on_suspend().await.unwrap();
    assert!(session.persisted_state(ARCHIVE).await.unwrap().is_none());

    engine.release_held();
    assert_eq!(pending.await.unwrap(), Err(ProviderError::Failed));
    assert!(session.persisted_state(ARCHIVE).await.unwrap().is_none());
    assert!(!host.mounts.is_mounted(ARCHIVE).await);
}

#[tokio::test]
async fn test_restore_without_record_unmounts() {
    const LOST: &str = "/downloads/lost.zip";
    let host = Host::new();
    host.mounts.mount(LOST, "lost.zip").await.unwrap();

    let engine = ScriptedEngine::new();
    let session = host.session(&engine, Arc::new(NoPassphrase)).await;
    assert_eq!(
        session.read_directory(LOST, 1, "/").await,
        Err(ProviderError::Failed)
    );
    assert!(!host.mounts.is_mounted(LOST).await);
    assert!(session.volume_ids().is_empty());
    assert_eq!(engine.count(Operation::ReadMetadata), 0);
}

#[tokio::test]
async fn test_suspend_rewrites_drifted_records() {
    let host = Host::new();
    let engine = ScriptedEngine::new();
    let session = host.session(&engine, Arc::new(NoPassphrase)).await;
    let id = session.mount(archive()).await.unwrap();
    session
        .open_file(&id, OpenFileOptions::read(4, "/file1"))
        .await
        .unwrap();
    let key = session.config().storage_key.clone();

    host.store.set(&key, serde_json::json!({})).await.unwrap();
    assert!(session.persisted_state(&id).await.unwrap().is_none());
    session.on_suspend().await.unwrap();
    let state = session.persisted_state(&id).await.unwrap().unwrap();
    assert_eq!(state.entry_id, ARCHIVE);
    assert!(state.opened_files.contains_key(&4));

    let mut drifted = BTreeMap::new();
    drifted.insert(
        id.clone(),
        VolumeState {
            entry_id: "/downloads/other.zip".to_string(),
            ..VolumeState::default()
        },
    );
    host.store
        .set(&key, serde_json::to_value(&drifted).unwrap())
        .await
        .unwrap();
    session.on_suspend().await.unwrap();
    let state = session.persisted_state(&id).await.unwrap().unwrap();
    assert_eq!(state.entry_id, ARCHIVE);
    assert!(state.opened_files.contains_key(&4));
}

#[tokio::test]
async fn test_failed_reopen_during_restore_unmounts() {
    let host = Host::new();
    let first = ScriptedEngine::new();
    let before = host.session(&first, Arc::new(NoPassphrase)).await;
    let id = before.mount(archive()).await.unwrap();
    before
        .open_file(&id, OpenFileOptions::read(7, "/file1"))
        .await
        .unwrap();
    before.on_suspend().await.unwrap();

    let engine = ScriptedEngine::new();
    engine.fail_opens(true);
    let session = host.session(&engine, Arc::new(NoPassphrase)).await;
    assert_eq!(
        session.get_metadata(&id, 8, "/file1").await,
        Err(ProviderError::Failed)
    );
    assert_eq!(engine.count(Operation::OpenFile), 1);
    assert!(!host.mounts.is_mounted(&id).await);
    assert!(session.persisted_state(&id).await.unwrap().is_none());
    assert!(session.volume_ids().is_empty());
}
