use crate::models::{new_conversation_id, Conversation};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

const RECORD_EXTENSION: &str = "json";
const TEMP_SUFFIX: &str = ".json.tmp";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation {id} not found")]
    NotFound { id: String },

    #[error("conversation {id} could not be decoded: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize conversation {id}: {source}")]
    Serialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// A corrupt record is as good as missing for a single lookup.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Corrupt { .. })
    }
}

/// Whole-record key/value persistence for conversations, keyed by id.
///
/// Every operation is atomic for a single record; nothing spans records.
pub trait TranscriptStore: Send + Sync {
    /// Writes the full conversation. Conversations without messages are
    /// skipped. Assigns a missing id, stamps a missing `created_at` and
    /// refreshes `updated_at`, mirroring those stamps back into `conversation`.
    fn save(&self, conversation: &mut Conversation) -> Result<(), StoreError>;

    fn load(&self, id: &str) -> Result<Conversation, StoreError>;

    /// Every readable, non-empty record, most recently updated first.
    fn list_all(&self) -> Result<Vec<Conversation>, StoreError>;

    fn delete(&self, id: &str) -> Result<(), StoreError>;
}

// Fills in id/created_at and refreshes updated_at before a write.
fn stamp_for_save(conversation: &mut Conversation, now: DateTime<Utc>) {
    if conversation.id.is_empty() {
        conversation.id = new_conversation_id();
    }
    if conversation.created_at == DateTime::<Utc>::default() {
        conversation.created_at = now;
    }
    conversation.touch_at(now);
}

fn sort_most_recent_first(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}

/// Stores each conversation as `<id>.json` under a single directory.
#[derive(Debug, Clone)]
pub struct FileTranscriptStore {
    dir: PathBuf,
}

impl FileTranscriptStore {
    /// Opens the store, creating the directory if it doesn't exist yet.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io("creating store directory", &dir, e))?;
        log::info!("Transcript store opened at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // Ids are opaque but must never escape the store directory.
    fn record_path(&self, id: &str) -> Option<PathBuf> {
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\'])
            && !id.contains("..");
        valid.then(|| self.dir.join(format!("{id}.{RECORD_EXTENSION}")))
    }

    fn read_record(path: &Path, id: &str) -> Result<Conversation, StoreError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::not_found(id)),
            Err(e) => return Err(StoreError::io("reading conversation", path, e)),
        };
        let mut conversation: Conversation =
            serde_json::from_slice(&data).map_err(|source| StoreError::Corrupt {
                id: id.to_string(),
                source,
            })?;
        // The file name is the key; a missing or stale id in the body must not fork the record.
        if conversation.id != id {
            log::debug!("Record {} carried id {:?}, using its file name", path.display(), conversation.id);
            conversation.id = id.to_string();
        }
        Ok(conversation)
    }
}

impl TranscriptStore for FileTranscriptStore {
    fn save(&self, conversation: &mut Conversation) -> Result<(), StoreError> {
        if conversation.is_empty() {
            log::debug!("Skipping save of empty conversation {:?}", conversation.id);
            return Ok(());
        }

        stamp_for_save(conversation, Utc::now());
        let path = self
            .record_path(&conversation.id)
            .ok_or_else(|| StoreError::not_found(conversation.id.clone()))?;

        let data = serde_json::to_vec_pretty(conversation).map_err(|source| StoreError::Serialize {
            id: conversation.id.clone(),
            source,
        })?;

        // Write beside the record then rename over it, so readers never see half a file.
        let tmp_path = self.dir.join(format!("{}{TEMP_SUFFIX}", conversation.id));
        fs::write(&tmp_path, &data).map_err(|e| StoreError::io("writing conversation", &tmp_path, e))?;
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            StoreError::io("replacing conversation", &path, e)
        })?;

        log::debug!(
            "Saved conversation {} ({} messages)",
            conversation.id,
            conversation.messages.len()
        );
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Conversation, StoreError> {
        let path = self.record_path(id).ok_or_else(|| StoreError::not_found(id))?;
        Self::read_record(&path, id)
    }

    fn list_all(&self) -> Result<Vec<Conversation>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| StoreError::io("listing conversations", &self.dir, e))?;

        let mut conversations = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io("listing conversations", &self.dir, e))?;
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };

            match Self::read_record(&path, id) {
                Ok(conversation) if conversation.is_empty() => {
                    log::debug!("Skipping empty record {}", path.display());
                }
                Ok(conversation) => conversations.push(conversation),
                Err(e) => log::warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }

        sort_most_recent_first(&mut conversations);
        log::debug!("Listed {} conversations", conversations.len());
        Ok(conversations)
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.record_path(id).ok_or_else(|| StoreError::not_found(id))?;
        match fs::remove_file(&path) {
            Ok(()) => {
                log::info!("Deleted conversation {}", id);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::not_found(id)),
            Err(e) => Err(StoreError::io("deleting conversation", &path, e)),
        }
    }
}

/// Keeps records in a map. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryTranscriptStore {
    records: Mutex<HashMap<String, Conversation>>,
}

impl MemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TranscriptStore for MemoryTranscriptStore {
    fn save(&self, conversation: &mut Conversation) -> Result<(), StoreError> {
        if conversation.is_empty() {
            return Ok(());
        }
        stamp_for_save(conversation, Utc::now());
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Conversation, StoreError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(id))
    }

    fn list_all(&self) -> Result<Vec<Conversation>, StoreError> {
        let mut conversations: Vec<Conversation> = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| !c.is_empty())
            .cloned()
            .collect();
        sort_most_recent_first(&mut conversations);
        Ok(conversations)
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(id))
    }
}
