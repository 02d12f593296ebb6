//! Data model shared by the channel and the data service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Local database identifier of a session.
pub type SessionId = i64;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageOrigin {
    User,
    Assistant,
    System,
}

impl MessageOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// A single transcript entry. Immutable once created.
///
/// The REST API spells the origin `message_type` and the timestamp
/// `created_at`; frames pushed over the channel use `type` and `timestamp`.
/// Both spellings deserialize into the same struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    #[serde(alias = "type")]
    pub message_type: MessageOrigin,
    pub content: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    #[serde(alias = "timestamp")]
    pub created_at: DateTime<Utc>,
}

/// A conversation as returned by the data service.
///
/// `messages` is only populated by the detail endpoint; the listing carries the
/// denormalized `message_count` and `last_message` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// Channel binding id used to route realtime traffic.
    pub session_id: String,
    pub title: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub message_count: Option<u64>,
    #[serde(default)]
    pub last_message: Option<Message>,
}

impl Session {
    pub fn binding_id(&self) -> &str {
        &self.session_id
    }

    /// Text of the most recent message, if the service reported one.
    pub fn preview(&self) -> Option<&str> {
        self.last_message.as_ref().map(|m| m.content.as_str())
    }

    /// Fold a newly observed message into the denormalized summary fields.
    pub(crate) fn record_message(&mut self, message: &Message) {
        self.message_count = Some(self.message_count.unwrap_or(0) + 1);
        self.last_message = Some(message.clone());
    }
}

/// One page of the session listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPage {
    pub count: u64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    pub results: Vec<Session>,
}

/// Response of the request/response send: both sides of the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub user_message: Message,
    pub assistant_message: Message,
}
