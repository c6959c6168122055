//! Unpacker CLI - browse an archive through a decompression engine
//!
//! Usage:
//!   unpacker --engine ./engine archive.zip ls /docs
//!   unpacker --engine ./engine archive.zip cat /docs/readme.txt
//!   unpacker --engine ./engine --state state.json archive.zip stat /docs
//!
//! With `--state`, volumes survive between runs: the next invocation for
//! the same archive restores the volume instead of mounting it again.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use unpacker::host::{
    ArchiveSource, FileArchive, JsonFileStore, MemoryStateStore, MountRegistry, MountTable,
    PathRetainer, StateStore,
};
use unpacker::engine::ProcessEngineLoader;
use unpacker::{
    EngineConfig, EntryInfo, OpenFileOptions, PassphraseError, PassphraseProvider,
    PassphraseResponse, SessionConfig, SessionRegistry,
};

/// Unpacker - read-only access to archives through a sandboxed engine
#[derive(Parser, Debug)]
#[command(name = "unpacker")]
#[command(about = "Browse archives through a sandboxed decompression engine")]
struct Args {
    /// Engine executable
    #[arg(long)]
    engine: PathBuf,

    /// Extra argument for the engine, may be repeated
    #[arg(long = "engine-arg")]
    engine_args: Vec<String>,

    /// Persist volumes in this JSON file between runs
    #[arg(long)]
    state: Option<PathBuf>,

    /// Give up on engine requests after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Default encoding for archive headers
    #[arg(long, default_value = "CP1250")]
    encoding: String,

    /// Remember passphrases entered at the prompt
    #[arg(long)]
    remember: bool,

    /// Archive to mount
    archive: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a directory
    Ls {
        /// Directory inside the archive
        #[arg(default_value = "/")]
        path: String,
    },
    /// Show one entry
    Stat {
        /// Entry inside the archive
        path: String,
    },
    /// Write a file to stdout
    Cat {
        /// File inside the archive
        path: String,
    },
    /// Unmount the archive and forget its saved state
    Umount,
}

/// Prompts on stderr and reads the passphrase from stdin.
#[derive(Debug)]
struct StdinPassphrase {
    remember: bool,
}

#[async_trait]
impl PassphraseProvider for StdinPassphrase {
    async fn prompt(&self, file_system_id: &str) -> Result<PassphraseResponse, PassphraseError> {
        eprint!("passphrase for {file_system_id}: ");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        match lines.next_line().await {
            Ok(Some(line)) if !line.is_empty() => Ok(PassphraseResponse {
                passphrase: line,
                remember: self.remember,
            }),
            Ok(_) => Err(PassphraseError::Cancelled),
            Err(e) => Err(PassphraseError::Prompt(e.to_string())),
        }
    }
}

fn describe(entry: &EntryInfo) -> String {
    let kind = if entry.is_directory { 'd' } else { '-' };
    let mtime = entry
        .modification_time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{kind} {:>12} {:>12} {}", entry.size, mtime, entry.name)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let store: Arc<dyn StateStore> = match &args.state {
        Some(path) => Arc::new(JsonFileStore::new(path)),
        None => Arc::new(MemoryStateStore::new()),
    };
    let mounts = Arc::new(MountTable::new());
    let config = SessionConfig {
        encoding: args.encoding.clone(),
        request_timeout: args.timeout_ms.map(Duration::from_millis),
        ..SessionConfig::default()
    };
    let registry = SessionRegistry::builder(store, Arc::new(PathRetainer), mounts.clone())
        .config(config)
        .passphrases(Arc::new(StdinPassphrase {
            remember: args.remember,
        }))
        .build();

    let mut engine = EngineConfig::new(args.engine.clone());
    engine.args = args.engine_args.clone();
    registry
        .load_engine(&ProcessEngineLoader::new(engine))
        .await
        .context("failed to load engine")?;
    registry.on_startup().await?;

    let path = std::fs::canonicalize(&args.archive)
        .with_context(|| format!("cannot open {}", args.archive.display()))?;
    let archive: Arc<dyn ArchiveSource> = Arc::new(FileArchive::open(&path).await?);
    let id = archive.display_path().to_string();

    if registry.persisted_state(&id).await?.is_some() {
        // The host remembers its mounts across runs.
        mounts.mount(&id, archive.name()).await?;
        tracing::info!(file_system_id = %id, "volume will be restored");
    } else {
        registry
            .mount(archive)
            .await
            .with_context(|| format!("failed to mount {}", path.display()))?;
    }

    let request_ids = AtomicI64::new(1);
    let next_id = || request_ids.fetch_add(1, Ordering::Relaxed);

    match &args.command {
        Command::Ls { path } => {
            for entry in registry.read_directory(&id, next_id(), path).await? {
                println!("{}", describe(&entry));
            }
        }
        Command::Stat { path } => {
            println!("{}", describe(&registry.get_metadata(&id, next_id(), path).await?));
        }
        Command::Cat { path } => {
            let size = registry.get_metadata(&id, next_id(), path).await?.size;
            let handle = next_id();
            registry
                .open_file(&id, OpenFileOptions::read(handle, path.clone()))
                .await?;

            let mut stdout = std::io::stdout().lock();
            let mut stream = registry.read_file(&id, next_id(), handle, 0, size).await?;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                stdout.write_all(&chunk.data)?;
                if !chunk.has_more_data {
                    break;
                }
            }
            stdout.flush()?;
            registry.close_file(&id, next_id(), handle).await?;
        }
        Command::Umount => {
            registry.unmount_requested(&id).await?;
            return Ok(());
        }
    }

    if args.state.is_some() {
        registry.on_suspend().await?;
    } else {
        registry.unmount(&id, false).await?;
    }
    Ok(())
}
