//! Channel envelope codec.
//!
//! Every frame is a small JSON object with a `type` discriminator plus
//! kind-specific fields. Outbound frames are strongly typed; inbound frames
//! are classified by hand so that kinds added by the backend later are
//! dropped instead of being reported as protocol errors.

use serde::Serialize;
use serde_json::Value;

use crate::error::ChatError;
use crate::types::Message;

/// Frames sent from the client to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message { content: String },
    Typing { is_typing: bool },
}

impl ClientFrame {
    pub fn to_json(&self) -> Result<String, ChatError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frames received from the backend, after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Message(Message),
    Typing {
        is_typing: bool,
        user_id: Option<i64>,
    },
    Error(String),
    /// A discriminator this client does not know about (or none at all).
    Unknown(String),
}

/// Decode one inbound text frame.
///
/// Returns `Ok(None)` for a `message` frame that carries no payload; the
/// backend never sends one on purpose and there is nothing to deliver.
pub fn decode(text: &str) -> Result<Option<ServerFrame>, ChatError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ChatError::Protocol(format!("invalid json: {e}")))?;
    let Value::Object(mut fields) = value else {
        return Err(ChatError::Protocol("envelope is not an object".into()));
    };

    let kind = fields.get("type").and_then(Value::as_str).map(str::to_owned);
    let frame = match kind.as_deref() {
        Some("message") => match fields.remove("message") {
            None | Some(Value::Null) => return Ok(None),
            Some(payload) => {
                let message: Message = serde_json::from_value(payload)
                    .map_err(|e| ChatError::Protocol(format!("invalid message payload: {e}")))?;
                ServerFrame::Message(message)
            }
        },
        Some("typing") => ServerFrame::Typing {
            is_typing: fields
                .get("is_typing")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            user_id: fields.get("user_id").and_then(Value::as_i64),
        },
        Some("error") => ServerFrame::Error(error_text(&fields)),
        Some(other) => ServerFrame::Unknown(other.to_string()),
        // The backend reports processing failures as a bare `{"error": ...}`.
        None if fields.contains_key("error") => ServerFrame::Error(error_text(&fields)),
        None => ServerFrame::Unknown("<missing>".to_string()),
    };
    Ok(Some(frame))
}

fn error_text(fields: &serde_json::Map<String, Value>) -> String {
    fields
        .get("error")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or("Unknown error")
        .to_string()
}
