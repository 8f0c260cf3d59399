//! Single owner of the current conversation.
//!
//! Every read and write of the conversation being chatted in goes through
//! [`ConversationManager`], which keeps it behind one `RwLock` and writes it
//! to the [`TranscriptStore`] when a message is added, when a stream
//! finishes or is cancelled, before it is replaced, and on shutdown.
//!
//! Lock discipline: each public operation takes the lock once for its whole
//! duration (shared for reads, exclusive for everything else). Flushing from
//! inside an operation goes through `flush_locked`, never through the public
//! [`ConversationManager::flush_current`], so the lock is never re-entered.

use crate::models::{Conversation, Message, Role};
use crate::storage::{StoreError, TranscriptStore};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub type SharedConversationManager = Arc<ConversationManager>;

pub struct ConversationManager {
    store: Arc<dyn TranscriptStore>,
    current: RwLock<Option<Conversation>>,
}

impl ConversationManager {
    /// Starts with no current conversation.
    pub fn new(store: Arc<dyn TranscriptStore>) -> Self {
        Self {
            store,
            current: RwLock::new(None),
        }
    }

    pub fn shared(store: Arc<dyn TranscriptStore>) -> SharedConversationManager {
        Arc::new(Self::new(store))
    }

    // A panic elsewhere must not take the chat session down with it.
    fn read(&self) -> RwLockReadGuard<'_, Option<Conversation>> {
        self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Conversation>> {
        self.current.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Best-effort write of `current`; returns whether a record was written.
    fn flush_locked(&self, current: &mut Option<Conversation>) -> bool {
        let Some(conversation) = current.as_mut() else {
            return false;
        };
        if conversation.is_empty() {
            return false;
        }
        match self.store.save(conversation) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to save conversation {}: {}", conversation.id, e);
                false
            }
        }
    }

    /// Flushes the current conversation and replaces it with a fresh one for `model`.
    pub fn new_conversation(&self, model: &str) -> Conversation {
        let mut current = self.write();
        self.flush_locked(&mut current);

        let conversation = Conversation::new(model);
        log::info!("Starting conversation {} with model {}", conversation.id, model);
        *current = Some(conversation.clone());

        // No-op while empty: the store skips conversations without messages.
        self.flush_locked(&mut current);

        conversation
    }

    /// Flushes the current conversation and installs the stored one with `id`.
    ///
    /// On failure the previous conversation stays current (already flushed).
    pub fn load_conversation(&self, id: &str) -> Result<Conversation, StoreError> {
        let mut current = self.write();
        self.flush_locked(&mut current);

        let loaded = self.store.load(id)?;
        log::info!("Loaded conversation {} ({} messages)", loaded.id, loaded.messages.len());
        *current = Some(loaded.clone());
        Ok(loaded)
    }

    /// Snapshot of the current conversation.
    pub fn get_current(&self) -> Option<Conversation> {
        self.read().clone()
    }

    /// Lends the live conversation to `f` under the shared lock.
    pub fn with_current<R>(&self, f: impl FnOnce(Option<&Conversation>) -> R) -> R {
        let current = self.read();
        f(current.as_ref())
    }

    pub fn current_id(&self) -> Option<String> {
        self.with_current(|c| c.map(|c| c.id.clone()))
    }

    pub fn current_model(&self) -> Option<String> {
        self.with_current(|c| c.map(|c| c.model.clone()))
    }

    /// Messages to send to the model: everything but a trailing empty assistant placeholder.
    pub fn history_for_request(&self) -> Vec<Message> {
        self.with_current(|c| {
            let Some(c) = c else {
                return Vec::new();
            };
            let mut messages = c.messages.as_slice();
            if let Some((last, rest)) = messages.split_last() {
                if last.role == Role::Assistant && last.content.is_empty() {
                    messages = rest;
                }
            }
            messages.to_vec()
        })
    }

    /// Every stored conversation, most recent first, including the current one.
    pub fn list_all(&self) -> Result<Vec<Conversation>, StoreError> {
        let mut current = self.write();
        self.flush_locked(&mut current);
        self.store.list_all()
    }

    /// Deletes a stored conversation. Deleting the current one swaps in a
    /// fresh conversation on the same model, so there is always a current one.
    pub fn delete_conversation(&self, id: &str) -> Result<(), StoreError> {
        let mut current = self.write();
        let is_current = current.as_ref().is_some_and(|c| c.id == id);

        match self.store.delete(id) {
            Ok(()) => {}
            // Never flushed, so there is no record; the in-memory one still goes.
            Err(StoreError::NotFound { .. }) if is_current => {
                log::debug!("Current conversation {} had no stored record", id);
            }
            Err(e) => return Err(e),
        }

        if is_current {
            let model = current.as_ref().map(|c| c.model.clone()).unwrap_or_default();
            let replacement = Conversation::new(model);
            log::info!("Deleted current conversation {}, replaced by {}", id, replacement.id);
            *current = Some(replacement);
        }
        Ok(())
    }

    /// Appends a user message and its empty assistant placeholder in one step.
    /// The first user message also becomes the title.
    pub fn add_user_message(&self, content: &str) {
        let mut current = self.write();
        let Some(conversation) = current.as_mut() else {
            log::warn!("Dropping user message: no current conversation");
            return;
        };

        if conversation.messages.is_empty() {
            conversation.title = content.to_string();
        }
        conversation.messages.push(Message::user(content));
        conversation.messages.push(Message::assistant(""));
        conversation.touch();
    }

    /// Grows the trailing assistant message by `text`.
    pub fn append_assistant_chunk(&self, text: &str) {
        let mut current = self.write();
        let Some(conversation) = current.as_mut() else {
            return;
        };
        let Some(last) = conversation.messages.last_mut() else {
            return;
        };
        if last.role != Role::Assistant {
            log::warn!("Ignoring assistant chunk: last message is from {}", last.role);
            return;
        }
        last.content.push_str(text);
        conversation.touch();
    }

    /// Persists the current conversation if it has messages. Never fails;
    /// returns whether a record was actually written.
    pub fn flush_current(&self) -> bool {
        let mut current = self.write();
        self.flush_locked(&mut current)
    }

    /// Final flush; same result as [`ConversationManager::flush_current`].
    pub fn shutdown(&self) -> bool {
        log::info!("Conversation manager shutting down");
        self.flush_current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileTranscriptStore, MemoryTranscriptStore};
    use chrono::Utc;

    fn manager_with_memory() -> (Arc<MemoryTranscriptStore>, ConversationManager) {
        let store = Arc::new(MemoryTranscriptStore::new());
        let manager = ConversationManager::new(store.clone());
        (store, manager)
    }

    // Fails every save; used to check that persistence errors are swallowed.
    struct FailingStore;

    impl TranscriptStore for FailingStore {
        fn save(&self, _conversation: &mut Conversation) -> Result<(), StoreError> {
            Err(StoreError::io(
                "writing conversation",
                "/read-only",
                std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            ))
        }
        fn load(&self, id: &str) -> Result<Conversation, StoreError> {
            Err(StoreError::not_found(id))
        }
        fn list_all(&self) -> Result<Vec<Conversation>, StoreError> {
            Ok(Vec::new())
        }
        fn delete(&self, id: &str) -> Result<(), StoreError> {
            Err(StoreError::not_found(id))
        }
    }

    #[test]
    fn starts_without_a_current_conversation() {
        let (_store, manager) = manager_with_memory();
        assert!(manager.get_current().is_none());
        manager.add_user_message("ignored");
        manager.append_assistant_chunk("ignored");
        assert!(!manager.flush_current());
        assert!(manager.get_current().is_none());
    }

    #[test]
    fn end_to_end_turn_is_persisted() {
        let (store, manager) = manager_with_memory();
        manager.new_conversation("modelA");
        assert!(store.is_empty(), "empty shell must not be written");

        manager.add_user_message("hi");
        let current = manager.get_current().unwrap();
        assert_eq!(current.title, "hi");
        assert_eq!(current.messages, vec![Message::user("hi"), Message::assistant("")]);

        manager.append_assistant_chunk("Hello");
        assert_eq!(manager.get_current().unwrap().last_message().unwrap().content, "Hello");

        assert!(manager.flush_current());
        let stored = store.list_all().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].messages.len(), 2);
    }

    #[test]
    fn chunks_concatenate_in_order_and_turns_add_two_messages() {
        let (_store, manager) = manager_with_memory();
        manager.new_conversation("m");

        for turn in 0..3 {
            manager.add_user_message(&format!("question {turn}"));
            for chunk in ["a", "b", "", "c"] {
                manager.append_assistant_chunk(chunk);
            }
            let current = manager.get_current().unwrap();
            assert_eq!(current.messages.len(), 2 * (turn + 1));
            assert_eq!(current.last_message().unwrap().content, "abc");
        }
        assert_eq!(manager.get_current().unwrap().title, "question 0");
    }

    #[test]
    fn chunk_is_ignored_when_last_message_is_not_assistant() {
        let (_store, manager) = manager_with_memory();
        manager.new_conversation("m");
        manager.append_assistant_chunk("orphan");
        assert!(manager.get_current().unwrap().messages.is_empty());
    }

    #[test]
    fn updated_at_never_decreases() {
        let (_store, manager) = manager_with_memory();
        let created = manager.new_conversation("m");
        let mut last = created.updated_at;
        manager.add_user_message("hi");
        for chunk in ["x", "y", "z"] {
            manager.append_assistant_chunk(chunk);
            let now = manager.get_current().unwrap().updated_at;
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn flushing_twice_writes_the_same_record() {
        let (store, manager) = manager_with_memory();
        manager.new_conversation("m");
        manager.add_user_message("hi");
        manager.append_assistant_chunk("there");

        assert!(manager.flush_current());
        let first = store.load(&manager.current_id().unwrap()).unwrap();
        assert!(manager.flush_current());
        let second = store.load(&manager.current_id().unwrap()).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.title, second.title);
        assert_eq!(first.messages, second.messages);
        assert!(second.updated_at >= first.updated_at);
    }

    #[test]
    fn new_conversation_flushes_the_previous_one() {
        let (store, manager) = manager_with_memory();
        let first = manager.new_conversation("m");
        manager.add_user_message("keep me");

        let second = manager.new_conversation("m2");
        assert_ne!(first.id, second.id);
        assert_eq!(store.load(&first.id).unwrap().title, "keep me");
        assert_eq!(manager.current_model().as_deref(), Some("m2"));
    }

    #[test]
    fn load_installs_the_stored_conversation() {
        let (_store, manager) = manager_with_memory();
        let first = manager.new_conversation("m");
        manager.add_user_message("first");
        manager.new_conversation("m");
        manager.add_user_message("second");

        let loaded = manager.load_conversation(&first.id).unwrap();
        assert_eq!(loaded.title, "first");
        assert_eq!(manager.current_id(), Some(first.id));
    }

    #[test]
    fn failed_load_keeps_previous_current_and_flushes_it() {
        let (store, manager) = manager_with_memory();
        let current = manager.new_conversation("m");
        manager.add_user_message("still here");

        let err = manager.load_conversation("missing").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(manager.current_id(), Some(current.id.clone()));
        assert!(store.load(&current.id).is_ok());
    }

    #[test]
    fn list_all_includes_the_unflushed_current_conversation() {
        let (_store, manager) = manager_with_memory();
        let current = manager.new_conversation("m");
        manager.add_user_message("listed");

        let listed = manager.list_all().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, current.id);
    }

    #[test]
    fn deleting_current_leaves_a_fresh_conversation_on_the_same_model() {
        let (store, manager) = manager_with_memory();
        let deleted = manager.new_conversation("llama3");
        manager.add_user_message("bye");
        manager.flush_current();

        manager.delete_conversation(&deleted.id).unwrap();
        let current = manager.get_current().unwrap();
        assert_ne!(current.id, deleted.id);
        assert_eq!(current.model, "llama3");
        assert!(current.messages.is_empty());
        assert!(store.load(&deleted.id).is_err());
    }

    #[test]
    fn deleting_unflushed_current_still_replaces_it() {
        let (_store, manager) = manager_with_memory();
        let deleted = manager.new_conversation("m");

        manager.delete_conversation(&deleted.id).unwrap();
        assert_ne!(manager.current_id(), Some(deleted.id));
    }

    #[test]
    fn deleting_other_conversation_keeps_current() {
        let (_store, manager) = manager_with_memory();
        let other = manager.new_conversation("m");
        manager.add_user_message("other");
        let current = manager.new_conversation("m");

        manager.delete_conversation(&other.id).unwrap();
        assert_eq!(manager.current_id(), Some(current.id));
        assert!(matches!(
            manager.delete_conversation("never-existed"),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn history_for_request_drops_only_the_empty_placeholder() {
        let (_store, manager) = manager_with_memory();
        manager.new_conversation("m");
        manager.add_user_message("one");
        assert_eq!(manager.history_for_request(), vec![Message::user("one")]);

        manager.append_assistant_chunk("answer");
        assert_eq!(manager.history_for_request().len(), 2);
    }

    #[test]
    fn persistence_failures_are_swallowed() {
        let manager = ConversationManager::new(Arc::new(FailingStore));
        manager.new_conversation("m");
        manager.add_user_message("hi");
        assert!(!manager.flush_current());
        manager.shutdown();
        assert_eq!(manager.get_current().unwrap().messages.len(), 2);
    }

    #[test]
    fn shutdown_writes_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileTranscriptStore::new(dir.path()).unwrap());
        let manager = ConversationManager::new(store.clone());
        let conv = manager.new_conversation("m");
        manager.add_user_message("persist");
        let before = Utc::now();
        manager.shutdown();

        let stored = store.load(&conv.id).unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert!(stored.updated_at >= before);
    }

    #[test]
    fn concurrent_readers_never_see_a_torn_turn() {
        let (_store, manager) = manager_with_memory();
        let manager = Arc::new(manager);
        manager.new_conversation("m");

        let writer = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                for i in 0..200 {
                    manager.add_user_message(&format!("q{i}"));
                    manager.append_assistant_chunk("a");
                }
            })
        };
        for _ in 0..200 {
            manager.with_current(|c| {
                let c = c.unwrap();
                assert_eq!(c.messages.len() % 2, 0);
            });
        }
        writer.join().unwrap();
        assert_eq!(manager.get_current().unwrap().messages.len(), 400);
    }
}
