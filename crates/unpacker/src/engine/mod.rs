//! The decompression engine as an opaque message peer.
//!
//! An [`EngineLoader`] starts the engine and hands back an [`EnginePeer`]
//! to send messages with, plus an inbox of messages the engine emits. The
//! engine is free to interleave responses for different requests and to
//! send sub-requests (chunk reads, passphrase prompts) at any time.

mod process;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::request::WireMessage;

pub use process::ProcessEngineLoader;

/// Messages emitted by the engine.
pub type EngineInbox = mpsc::UnboundedReceiver<WireMessage>;

/// Send side of a running engine.
pub trait EnginePeer: Send + Sync + std::fmt::Debug {
    /// Queue a message for the engine.
    fn send(&self, message: WireMessage) -> Result<(), EngineError>;
}

/// Starts the engine.
#[async_trait]
pub trait EngineLoader: Send + Sync {
    /// Start the engine and wait until it signals readiness.
    async fn load(&self) -> Result<(Arc<dyn EnginePeer>, EngineInbox), EngineError>;
}
