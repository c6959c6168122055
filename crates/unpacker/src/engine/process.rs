//! Engine running as a sandboxed child process.
//!
//! Messages are exchanged as newline-delimited JSON over the child's stdin
//! and stdout. The child signals readiness by printing one line before any
//! protocol traffic. stderr is inherited so engine crashes stay visible.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

use super::{EngineInbox, EngineLoader, EnginePeer};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::request::WireMessage;

/// Loads the engine by spawning `config.program`.
#[derive(Debug, Clone)]
pub struct ProcessEngineLoader {
    config: EngineConfig,
}

impl ProcessEngineLoader {
    /// Create a loader for the given engine.
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[derive(Debug)]
struct ProcessPeer {
    outbox: mpsc::UnboundedSender<WireMessage>,
}

impl EnginePeer for ProcessPeer {
    fn send(&self, message: WireMessage) -> Result<(), EngineError> {
        self.outbox.send(message).map_err(|_| EngineError::Closed)
    }
}

#[async_trait]
impl EngineLoader for ProcessEngineLoader {
    async fn load(&self) -> Result<(Arc<dyn EnginePeer>, EngineInbox), EngineError> {
        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::Load(format!("{}: {}", self.config.program.display(), e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Load("engine stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Load("engine stdout unavailable".to_string()))?;

        let mut lines = BufReader::new(stdout).lines();
        match lines.next_line().await? {
            Some(banner) => tracing::info!(banner = %banner.trim(), "engine ready"),
            None => return Err(EngineError::Load("engine exited before ready".to_string())),
        }

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(stdin, outbox_rx));
        tokio::spawn(read_loop(lines, inbox_tx));
        tokio::spawn(watch_exit(child));

        Ok((Arc::new(ProcessPeer { outbox: outbox_tx }), inbox_rx))
    }
}

async fn write_loop(mut stdin: ChildStdin, mut outbox: mpsc::UnboundedReceiver<WireMessage>) {
    while let Some(message) = outbox.recv().await {
        let line = match encode_line(&message) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode engine message");
                continue;
            }
        };
        if let Err(e) = stdin.write_all(&line).await {
            tracing::error!(error = %e, "engine stdin closed");
            return;
        }
        if let Err(e) = stdin.flush().await {
            tracing::error!(error = %e, "engine stdin closed");
            return;
        }
    }
}

async fn read_loop(
    mut lines: tokio::io::Lines<BufReader<ChildStdout>>,
    inbox: mpsc::UnboundedSender<WireMessage>,
) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match decode_line(&line) {
                    Ok(message) => {
                        if inbox.send(message).is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "malformed engine message"),
                }
            }
            Ok(None) => {
                tracing::warn!("engine closed its output");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed reading engine output");
                return;
            }
        }
    }
}

async fn watch_exit(mut child: Child) {
    match child.wait().await {
        Ok(status) if status.success() => tracing::info!("engine exited"),
        Ok(status) => tracing::error!(%status, "engine exited abnormally"),
        Err(e) => tracing::error!(error = %e, "failed waiting for engine"),
    }
}

fn encode_line(message: &WireMessage) -> Result<Vec<u8>, EngineError> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

fn decode_line(line: &str) -> Result<WireMessage, EngineError> {
    Ok(serde_json::from_str(line)?)
}
