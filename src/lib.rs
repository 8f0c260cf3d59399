// Declare the modules
pub mod api;
pub mod app;
pub mod chat;
pub mod commands;
pub mod config;
pub mod manager;
pub mod models;
pub mod pump;
pub mod state;
pub mod storage;

use crate::api::{LLMApiProvider, OllamaProvider};
use crate::chat::ChatSession;
use crate::config::Config;
use crate::state::AppState;
use crate::storage::{FileTranscriptStore, MemoryTranscriptStore, TranscriptStore};
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

/// Chat with a local Ollama server from the terminal.
#[derive(Parser, Debug)]
#[command(name = "termchat", version, about)]
pub struct Cli {
    /// Server address, e.g. http://localhost:11434 (overrides the config file)
    #[arg(long)]
    pub host: Option<String>,

    /// Model to chat with (defaults to the first one the server lists)
    #[arg(long, short)]
    pub model: Option<String>,

    /// Path to the config file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; RUST_LOG raises the level.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    runtime.block_on(start(cli))
}

fn open_store(config: &Config) -> Arc<dyn TranscriptStore> {
    match FileTranscriptStore::new(&config.storage.path) {
        Ok(store) => {
            log::info!("Saving conversations to {}", store.dir().display());
            Arc::new(store)
        }
        Err(e) => {
            log::warn!("History directory unavailable, conversations won't be saved: {}", e);
            eprintln!("Warning: {e}. Conversations will not be saved this session.");
            Arc::new(MemoryTranscriptStore::new())
        }
    }
}

async fn start(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(config::default_config_path);
    let config = Config::load_or_create(&config_path, cli.host.as_deref())?;
    log::debug!("Loaded config from {}: {:?}", config_path.display(), config);

    let store = open_store(&config);
    let api_provider: Arc<dyn LLMApiProvider> = Arc::new(OllamaProvider::new(config.host.clone()));

    let models = match api_provider.list_models().await {
        Ok(models) => models,
        // An explicit model lets us start anyway; the first send will report the problem.
        Err(e) if cli.model.is_some() => {
            log::warn!("Could not list models: {:#}", e);
            Vec::new()
        }
        Err(e) => {
            return Err(e.context(format!("Could not reach {} (is Ollama running?)", config.host)));
        }
    };

    let model = match cli.model.or_else(|| models.first().map(|m| m.name.clone())) {
        Some(model) => model,
        None => bail!("No Ollama models found at {} (try `ollama pull <model>`)", config.host),
    };
    log::info!("Using model {}", model);

    let state = AppState::new(store, api_provider, config, config_path);
    let mut session = ChatSession::new(state);
    session.new_conversation(&model);

    app::run_repl(session, models).await
}
