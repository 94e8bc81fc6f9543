use serde::Serialize;

use super::chat::Role;

/// One text part of an upstream message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessagePart {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

/// A message in the upstream assistant's request format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamMessage {
    pub id: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    pub role: Role,
    pub content: String,
    pub parts: Vec<MessagePart>,
}

impl UpstreamMessage {
    /// Build a message whose single text part mirrors `content`.
    pub fn text(id: String, created_at: String, role: Role, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id,
            created_at,
            role,
            parts: vec![MessagePart {
                kind: "text",
                text: content.clone(),
            }],
            content,
        }
    }
}

/// Request body for one upstream round.
///
/// `id` and `conversation_id` both carry the session id and serialize as
/// `null` before a continuation session exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamPayload {
    pub id: Option<String>,
    pub conversation_id: Option<String>,
    pub messages: Vec<UpstreamMessage>,
    pub fp: String,
}

impl UpstreamPayload {
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }
}
