//! Main entrypoint for the Oracle voice companion.
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and the command line.
//! 2. Opening the memory store and starting the memory tools.
//! 3. Choosing the realtime transport (direct or relay).
//! 4. Running the interactive console until it exits.

use anyhow::Context;
use clap::Parser;
use oracle::{config::Config, console};
use oracle_core::{
    BASE_INSTRUCTIONS, FileMemoryBackend, MemoryStore, SessionController, SessionSettings, ToolRegistry,
};
use oracle_native_utils::CpalBackend;
use oracle_realtime::{RealtimeTransport, WebSocketTransport};
use secrecy::SecretString;
use std::{path::PathBuf, sync::Arc};
use tokio::io::BufReader;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about = "Realtime voice companion with long-term memory")]
struct Args {
    /// Memory file, overriding ORACLE_MEMORY_PATH.
    #[arg(long)]
    memory: Option<PathBuf>,
    /// Voice, overriding ORACLE_VOICE.
    #[arg(long)]
    voice: Option<String>,
    /// Connect immediately instead of waiting for /connect.
    #[arg(long)]
    connect: bool,
}

fn transport(config: &Config) -> Arc<dyn RealtimeTransport> {
    match &config.relay_url {
        Some(relay_url) => {
            info!(url = %relay_url, "Using realtime relay.");
            Arc::new(WebSocketTransport::relay(relay_url.clone()))
        }
        None => Arc::new(WebSocketTransport::direct(
            config.realtime_url.clone(),
            config.realtime_model.clone(),
            config.openai_api_key.clone().map(SecretString::from),
        )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let args = Args::parse();
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(memory) = args.memory {
        config.memory_path = memory;
    }
    if let Some(voice) = args.voice {
        config.voice = voice;
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!("Configuration loaded. Initializing session...");

    // --- 3. Memory and Tools ---
    let backend = Arc::new(FileMemoryBackend::new(&config.memory_path));
    let memory = Arc::new(
        MemoryStore::open(backend)
            .await
            .with_context(|| format!("Failed to open memory at {}", config.memory_path.display()))?,
    );
    let tools = Arc::new(
        ToolRegistry::start(memory.clone())
            .await
            .context("Failed to start memory tools")?,
    );

    let instructions = match &config.instructions_path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read instructions from {}", path.display()))?,
        None => BASE_INSTRUCTIONS.to_string(),
    };
    let settings = SessionSettings {
        voice: config.voice.clone(),
        instructions,
        ..Default::default()
    };

    // --- 4. Session ---
    let session = SessionController::new(
        settings,
        transport(&config),
        Arc::new(CpalBackend),
        memory,
        tools,
    );
    info!(
        voice = %config.voice,
        model = %config.realtime_model,
        memory = %config.memory_path.display(),
        "Session configured."
    );

    if args.connect {
        session.connect().await.context("Failed to connect")?;
    }
    console::run(&session, BufReader::new(tokio::io::stdin())).await?;

    info!("Oracle has shut down.");
    Ok(())
}
