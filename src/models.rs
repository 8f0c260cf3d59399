use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// Who authored a message. Serialized lowercase to match the server's wire format.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Represents a single message in a conversation
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// One chat session: its messages, the model it talks to, and timestamps.
///
/// This is also the persisted record shape, one JSON file per conversation.
/// An empty `id` means "not yet assigned" and an epoch `created_at` means
/// "not yet stamped"; the store fills both in on save.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Conversation {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// A fresh, empty conversation with a new id and both timestamps set to now.
    pub fn new(model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_conversation_id(),
            title: String::new(),
            model: model.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Refreshes `updated_at` without ever moving it backwards.
    pub fn touch(&mut self) {
        self.touch_at(Utc::now());
    }

    pub fn touch_at(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

pub fn new_conversation_id() -> String {
    Uuid::new_v4().to_string()
}

// A model as reported by the server's `/api/tags` endpoint
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub details: ModelDetails,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ModelDetails {
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub parameter_size: String,
    #[serde(default)]
    pub quantization_level: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::assistant("hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }

    #[test]
    fn new_conversation_has_id_and_matching_timestamps() {
        let conv = Conversation::new("llama3");
        assert!(!conv.id.is_empty());
        assert!(conv.title.is_empty());
        assert!(conv.is_empty());
        assert_eq!(conv.created_at, conv.updated_at);
    }

    #[test]
    fn touch_never_moves_backwards() {
        let mut conv = Conversation::new("m");
        let before = conv.updated_at;
        conv.touch_at(before - Duration::seconds(30));
        assert_eq!(conv.updated_at, before);
        conv.touch_at(before + Duration::seconds(1));
        assert_eq!(conv.updated_at, before + Duration::seconds(1));
    }

    #[test]
    fn record_with_missing_fields_uses_defaults() {
        let conv: Conversation = serde_json::from_str(r#"{"id":"abc","messages":[]}"#).unwrap();
        assert_eq!(conv.id, "abc");
        assert_eq!(conv.created_at, DateTime::<Utc>::default());
    }

    #[test]
    fn model_info_tolerates_partial_details() {
        let info: ModelInfo = serde_json::from_str(
            r#"{"name":"llama3:8b","model":"llama3:8b","size":42,"details":{"family":"llama"}}"#,
        )
        .unwrap();
        assert_eq!(info.details.family, "llama");
        assert!(info.details.quantization_level.is_empty());
    }
}
