//! In-process engines for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::engine::{EngineInbox, EngineLoader, EnginePeer};
use crate::error::EngineError;
use crate::metadata::RawEntry;
use crate::metadata::tests::sample_tree;
use crate::request::{Operation, WireMessage};

static INIT_TRACING: Once = Once::new();

pub(crate) fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("unpacker=debug")
            .with_test_writer()
            .try_init();
    });
}

/// Engine that records what it is sent and never answers.
#[derive(Debug)]
pub(crate) struct RecordingEngine {
    tx: mpsc::UnboundedSender<WireMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<WireMessage>>,
    count: AtomicUsize,
}

impl RecordingEngine {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub(crate) async fn next_sent(&self) -> WireMessage {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a message to the engine")
            .expect("engine channel closed")
    }
}

impl EnginePeer for RecordingEngine {
    fn send(&self, message: WireMessage) -> Result<(), EngineError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.tx.send(message).map_err(|_| EngineError::Closed)
    }
}

/// Content of the entry at `index` in [`sample_tree`].
pub(crate) fn sample_content(index: u64) -> Vec<u8> {
    let size = match index {
        0 => 15,
        1 => 33,
        2 => 56,
        _ => 0,
    };
    (0..size).map(|i| (i as u8).wrapping_mul(7).wrapping_add(index as u8)).collect()
}

#[derive(Debug, Default)]
struct ScriptState {
    inbox: Option<mpsc::UnboundedSender<WireMessage>>,
    sent: Vec<WireMessage>,
    /// metadata reads waiting on their chunk, per volume
    metadata_waiting: HashMap<(String, String), ()>,
    /// open request ids waiting on a passphrase, per volume
    passphrase_waiting: HashMap<(String, String), u64>,
    /// open request id -> entry index, per volume
    opened: HashMap<(String, String), u64>,
    unlocked: HashMap<String, bool>,
    held: Vec<WireMessage>,
}

/// Engine that answers the protocol from [`sample_tree`].
///
/// Behaves like the real engine: metadata reads first pull a chunk of the
/// archive, encrypted archives ask for a passphrase on first open, and
/// reads are answered in pieces of `chunk_size` bytes.
#[derive(Debug)]
pub(crate) struct ScriptedEngine {
    state: Mutex<ScriptState>,
    tree: RawEntry,
    chunk_size: usize,
    passphrase: Option<String>,
    fail_metadata: AtomicBool,
    fail_opens: AtomicBool,
    hold_metadata: AtomicBool,
    hold_reads: AtomicBool,
    loads: AtomicUsize,
}

impl ScriptedEngine {
    pub(crate) fn new() -> Arc<Self> {
        Self::build(None, 10)
    }

    pub(crate) fn encrypted(passphrase: &str) -> Arc<Self> {
        Self::build(Some(passphrase.to_string()), 10)
    }

    fn build(passphrase: Option<String>, chunk_size: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ScriptState::default()),
            tree: sample_tree(),
            chunk_size,
            passphrase,
            fail_metadata: AtomicBool::new(false),
            fail_opens: AtomicBool::new(false),
            hold_metadata: AtomicBool::new(false),
            hold_reads: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
        })
    }

    pub(crate) fn fail_metadata(&self, fail: bool) {
        self.fail_metadata.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    /// Queue metadata reads until [`release_held`](Self::release_held).
    pub(crate) fn hold_metadata(&self, hold: bool) {
        self.hold_metadata.store(hold, Ordering::SeqCst);
    }

    /// Queue read-file answers until [`release_held`](Self::release_held).
    pub(crate) fn hold_reads(&self, hold: bool) {
        self.hold_reads.store(hold, Ordering::SeqCst);
    }

    /// Stop holding and answer everything queued so far.
    pub(crate) fn release_held(&self) {
        self.hold_metadata(false);
        self.hold_reads(false);
        let held = std::mem::take(&mut self.lock().held);
        for message in held {
            self.handle(message);
        }
    }

    /// Send `message` as if the engine had produced it.
    pub(crate) fn inject(&self, message: WireMessage) {
        self.emit(message);
    }

    pub(crate) fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub(crate) fn count(&self, operation: Operation) -> usize {
        self.lock()
            .sent
            .iter()
            .filter(|m| m.operation == operation.tag())
            .count()
    }

    pub(crate) fn sent(&self) -> Vec<WireMessage> {
        self.lock().sent.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().expect("script state poisoned")
    }

    fn emit(&self, message: WireMessage) {
        if let Some(inbox) = &self.lock().inbox {
            let _ = inbox.send(message);
        }
    }

    fn reply(&self, to: &WireMessage, operation: Operation) -> WireMessage {
        WireMessage {
            operation: operation.tag(),
            file_system_id: to.file_system_id.clone(),
            request_id: to.request_id.clone(),
            ..Default::default()
        }
    }

    fn error(&self, to: &WireMessage, text: &str) {
        let mut msg = self.reply(to, Operation::FileSystemError);
        msg.error = Some(text.to_string());
        self.emit(msg);
    }

    fn key(msg: &WireMessage) -> (String, String) {
        (msg.file_system_id.clone(), msg.request_id.clone())
    }

    fn handle(&self, msg: WireMessage) {
        let Ok(operation) = Operation::try_from(msg.operation) else {
            return;
        };
        match operation {
            Operation::ReadMetadata => {
                if self.hold_metadata.load(Ordering::SeqCst) {
                    self.lock().held.push(msg);
                    return;
                }
                if self.fail_metadata.load(Ordering::SeqCst) {
                    self.error(&msg, "Could not read archive headers.");
                    return;
                }
                self.lock().metadata_waiting.insert(Self::key(&msg), ());
                let mut chunk = self.reply(&msg, Operation::ReadChunk);
                chunk.offset = Some("0".to_string());
                chunk.length = Some("16".to_string());
                self.emit(chunk);
            }
            Operation::ReadChunkDone | Operation::ReadChunkError => {
                if self.lock().metadata_waiting.remove(&Self::key(&msg)).is_none() {
                    return;
                }
                if operation == Operation::ReadChunkError {
                    self.error(&msg, "Could not read archive.");
                    return;
                }
                let mut done = self.reply(&msg, Operation::ReadMetadataDone);
                done.metadata = Some(self.tree.clone());
                self.emit(done);
            }
            Operation::OpenFile => {
                if self.fail_opens.load(Ordering::SeqCst) {
                    self.error(&msg, "Could not open file.");
                    return;
                }
                let index = msg.index.as_deref().and_then(|i| i.parse().ok()).unwrap_or(0);
                let unlocked = self
                    .lock()
                    .unlocked
                    .get(&msg.file_system_id)
                    .copied()
                    .unwrap_or(false);
                if self.passphrase.is_some() && !unlocked {
                    self.lock()
                        .passphrase_waiting
                        .insert(Self::key(&msg), index);
                    self.emit(self.reply(&msg, Operation::ReadPassphrase));
                    return;
                }
                self.lock().opened.insert(Self::key(&msg), index);
                self.emit(self.reply(&msg, Operation::OpenFileDone));
            }
            Operation::ReadPassphraseDone | Operation::ReadPassphraseError => {
                let waiting = self.lock().passphrase_waiting.remove(&Self::key(&msg));
                let Some(index) = waiting else {
                    return;
                };
                if msg.passphrase.is_some() && msg.passphrase == self.passphrase {
                    let mut state = self.lock();
                    state.unlocked.insert(msg.file_system_id.clone(), true);
                    state.opened.insert(Self::key(&msg), index);
                    drop(state);
                    self.emit(self.reply(&msg, Operation::OpenFileDone));
                } else {
                    self.error(&msg, "Wrong passphrase.");
                }
            }
            Operation::ReadFile => {
                if self.hold_reads.load(Ordering::SeqCst) {
                    self.lock().held.push(msg);
                    return;
                }
                let open_key = (
                    msg.file_system_id.clone(),
                    msg.open_request_id.clone().unwrap_or_default(),
                );
                let opened = self.lock().opened.get(&open_key).copied();
                let Some(index) = opened else {
                    self.error(&msg, "File not opened.");
                    return;
                };
                let content = sample_content(index);
                let offset: usize = msg.offset.as_deref().and_then(|o| o.parse().ok()).unwrap_or(0);
                let length: usize = msg.length.as_deref().and_then(|l| l.parse().ok()).unwrap_or(0);
                let start = offset.min(content.len());
                let end = (offset + length).min(content.len());
                let data = &content[start..end];

                let pieces: Vec<&[u8]> = if data.is_empty() {
                    vec![data]
                } else {
                    data.chunks(self.chunk_size).collect()
                };
                let last = pieces.len() - 1;
                for (i, piece) in pieces.into_iter().enumerate() {
                    let mut done = self.reply(&msg, Operation::ReadFileDone);
                    done.read_file_data = Some(piece.to_vec());
                    done.has_more_data = Some(i != last);
                    self.emit(done);
                }
            }
            Operation::CloseFile => {
                let open_request_id = msg.open_request_id.clone().unwrap_or_default();
                self.lock()
                    .opened
                    .remove(&(msg.file_system_id.clone(), open_request_id.clone()));
                let mut done = self.reply(&msg, Operation::CloseFileDone);
                done.open_request_id = Some(open_request_id);
                self.emit(done);
            }
            Operation::CloseVolume => {
                let mut state = self.lock();
                state.unlocked.remove(&msg.file_system_id);
                state.opened.retain(|(id, _), _| id != &msg.file_system_id);
            }
            _ => {}
        }
    }
}

impl EnginePeer for ScriptedEngine {
    fn send(&self, message: WireMessage) -> Result<(), EngineError> {
        self.lock().sent.push(message.clone());
        self.handle(message);
        Ok(())
    }
}

/// Loader handing out a shared [`ScriptedEngine`].
#[derive(Debug, Clone)]
pub(crate) struct ScriptedLoader(pub(crate) Arc<ScriptedEngine>);

#[async_trait]
impl EngineLoader for ScriptedLoader {
    async fn load(&self) -> Result<(Arc<dyn EnginePeer>, EngineInbox), EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.0.lock().inbox = Some(tx);
        self.0.loads.fetch_add(1, Ordering::SeqCst);
        Ok((self.0.clone(), rx))
    }
}

/// Loader that never produces an engine.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BrokenLoader;

#[async_trait]
impl EngineLoader for BrokenLoader {
    async fn load(&self) -> Result<(Arc<dyn EnginePeer>, EngineInbox), EngineError> {
        Err(EngineError::Load("no engine".to_string()))
    }
}
