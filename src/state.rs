use crate::api::{LLMApiProvider, StreamOptions};
use crate::config::Config;
use crate::manager::{ConversationManager, SharedConversationManager};
use crate::storage::TranscriptStore;
use std::path::PathBuf;
use std::sync::Arc;

// Core application state, built once at startup and handed to the chat session
#[derive(Clone)]
pub struct AppState {
    // The only owner of the current conversation; everything else goes through it.
    pub manager: SharedConversationManager,
    pub api_provider: Arc<dyn LLMApiProvider>, // Hold the trait object
    pub config: Config,
    pub config_path: PathBuf,
}

impl AppState {
    pub fn new(
        store: Arc<dyn TranscriptStore>,
        api_provider: Arc<dyn LLMApiProvider>,
        config: Config,
        config_path: PathBuf,
    ) -> Self {
        Self {
            manager: ConversationManager::shared(store),
            api_provider,
            config,
            config_path,
        }
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            system_message: self.config.system_message().map(str::to_string),
        }
    }
}
