use crate::models::{Conversation, ModelInfo};
use crate::pump::{PumpEvent, StreamPump};
use crate::state::AppState;
use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;

/// Drives chat turns for a single-threaded event loop.
///
/// Owns at most one in-flight stream. The loop calls [`ChatSession::next_event`]
/// while [`ChatSession::is_streaming`] is true; every batch lands in the
/// current conversation and the end of the stream flushes it to the store.
pub struct ChatSession {
    state: AppState,
    pump: Option<StreamPump>,
    // Set when a flush of a non-empty conversation wrote nothing.
    save_failed: bool,
}

impl ChatSession {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            pump: None,
            save_failed: false,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn current(&self) -> Option<Conversation> {
        self.state.manager.get_current()
    }

    pub fn is_streaming(&self) -> bool {
        self.pump.is_some()
    }

    /// Handle for cancelling the active stream from outside the loop.
    pub fn cancel_handle(&self) -> Option<CancellationToken> {
        self.pump.as_ref().map(StreamPump::cancel_handle)
    }

    /// Whether a save failed since the last call. Clears the flag.
    pub fn take_save_failure(&mut self) -> bool {
        std::mem::take(&mut self.save_failed)
    }

    fn note_flush(&mut self, written: bool) {
        if !written && self.state.manager.with_current(|c| c.is_some_and(|c| !c.is_empty())) {
            log::warn!("Current conversation was not saved");
            self.save_failed = true;
        }
    }

    fn flush(&mut self) {
        let written = self.state.manager.flush_current();
        self.note_flush(written);
    }

    /// Records the user's message and starts streaming the reply.
    ///
    /// If the server can't be reached the turn ends right away with an empty
    /// reply (already saved) and the error is returned for display.
    pub async fn submit(&mut self, input: &str) -> Result<()> {
        let input = input.trim();
        if input.is_empty() {
            bail!("Message is empty");
        }
        if self.is_streaming() {
            bail!("Still waiting for the previous reply");
        }
        let Some(model) = self.state.manager.current_model() else {
            bail!("No conversation is open");
        };

        self.state.manager.add_user_message(input);
        self.flush();

        let history = self.state.manager.history_for_request();
        log::info!("Starting stream with {} messages of history", history.len());

        let options = self.state.stream_options();
        let started = self
            .state
            .api_provider
            .start_stream(&model, &history, &options)
            .await;
        match started {
            Ok(increments) => {
                self.pump = Some(StreamPump::new(increments));
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to start stream: {:?}", e);
                self.flush();
                Err(e)
            }
        }
    }

    /// Waits for the next piece of the reply. `None` when nothing is streaming.
    pub async fn next_event(&mut self) -> Option<PumpEvent> {
        let pump = self.pump.as_mut()?;
        let event = pump.next_event().await;
        match &event {
            PumpEvent::Batch(text) => self.state.manager.append_assistant_chunk(text),
            PumpEvent::Finished => self.finish_stream(),
        }
        Some(event)
    }

    /// Asks the active stream to stop; the next event will be `Finished`.
    pub fn cancel(&self) -> bool {
        match &self.pump {
            Some(pump) => {
                pump.cancel();
                true
            }
            None => false,
        }
    }

    fn finish_stream(&mut self) {
        self.pump = None;
        self.flush();
    }

    // Stops an in-flight reply before the current conversation is swapped out.
    fn abort_stream(&mut self) {
        if let Some(pump) = &self.pump {
            pump.cancel();
            self.finish_stream();
        }
    }

    pub fn new_conversation(&mut self, model: &str) -> Conversation {
        self.abort_stream();
        self.state.manager.new_conversation(model)
    }

    /// Opens a stored conversation. If it can't be loaded a fresh one on the
    /// current model takes its place and the error is returned.
    pub fn open_conversation(&mut self, id: &str) -> Result<Conversation> {
        self.abort_stream();
        let manager = &self.state.manager;
        match manager.load_conversation(id) {
            Ok(conversation) => Ok(conversation),
            Err(e) => {
                log::warn!("Could not open conversation {}: {}", id, e);
                let model = manager.current_model().unwrap_or_default();
                manager.new_conversation(&model);
                Err(e.into())
            }
        }
    }

    pub fn delete_conversation(&mut self, id: &str) -> Result<()> {
        if self.state.manager.current_id().as_deref() == Some(id) {
            self.abort_stream();
        }
        self.state.manager.delete_conversation(id)?;
        Ok(())
    }

    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        Ok(self.state.manager.list_all()?)
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        self.state.api_provider.list_models().await
    }

    pub fn set_system_message(&mut self, message: &str) -> Result<()> {
        let path = self.state.config_path.clone();
        self.state.config.set_system_message(message, &path)
    }

    pub fn shutdown(&mut self) {
        self.abort_stream();
        let written = self.state.manager.shutdown();
        self.note_flush(written);
    }
}
