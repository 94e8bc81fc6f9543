use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Conversation role accepted on the inbound API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "developer")]
    System,
    #[default]
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One chat message with its content flattened to text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: Role,
    #[serde(default, deserialize_with = "deserialize_content")]
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Accepts a string, `null`, or an array of `{type:"text", text}` parts.
fn deserialize_content<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(text) => Ok(text),
        Value::Array(parts) => {
            let mut out = String::new();
            for part in &parts {
                let kind = part.get("type").and_then(Value::as_str).unwrap_or("text");
                if kind != "text" {
                    continue;
                }
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    out.push_str(text);
                }
            }
            Ok(out)
        }
        other => Err(serde::de::Error::custom(format!(
            "message content must be a string, null, or an array of text parts, got {other}"
        ))),
    }
}

/// Inbound `POST /v1/chat/completions` body. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub model: Option<String>,
}

/// Why a choice stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Stop,
    Length,
}

impl FinishReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
        }
    }
}

/// Batch `chat.completion` response.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: ChatUsage,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ChatUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl ChatCompletionResponse {
    #[must_use]
    pub fn new(
        id: String,
        created: u64,
        model: String,
        content: String,
        finish_reason: FinishReason,
        usage: ChatUsage,
    ) -> Self {
        Self {
            id,
            object: "chat.completion",
            created,
            model,
            choices: vec![ChatChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant",
                    content,
                },
                finish_reason,
            }],
            usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: ChatCompletionRequest =
            serde_json::from_str(r#"{"messages":[{"role":"user","content":"hello"}]}"#).unwrap();
        assert!(!request.stream);
        assert!(request.model.is_none());
        assert_eq!(request.messages[0], ChatMessage::new(Role::User, "hello"));
    }

    #[test]
    fn test_developer_role_maps_to_system() {
        let message: ChatMessage =
            serde_json::from_str(r#"{"role":"developer","content":"be brief"}"#).unwrap();
        assert_eq!(message.role, Role::System);
    }

    #[test]
    fn test_missing_role_defaults_to_user() {
        let message: ChatMessage = serde_json::from_str(r#"{"content":"hi"}"#).unwrap();
        assert_eq!(message.role, Role::User);
    }

    #[test]
    fn test_content_parts_are_concatenated() {
        let message: ChatMessage = serde_json::from_str(
            r#"{"role":"user","content":[
                {"type":"text","text":"Build "},
                {"type":"image_url","image_url":{"url":"x"}},
                {"type":"text","text":"a todo app"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(message.content, "Build a todo app");
    }

    #[test]
    fn test_null_and_missing_content() {
        let message: ChatMessage =
            serde_json::from_str(r#"{"role":"assistant","content":null}"#).unwrap();
        assert_eq!(message.content, "");
        let message: ChatMessage = serde_json::from_str(r#"{"role":"assistant"}"#).unwrap();
        assert_eq!(message.content, "");
    }

    #[test]
    fn test_numeric_content_is_rejected() {
        let result = serde_json::from_str::<ChatMessage>(r#"{"role":"user","content":42}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let result = serde_json::from_str::<ChatMessage>(r#"{"role":"wizard","content":"x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_response_shape() {
        let response = ChatCompletionResponse::new(
            "chatcmpl-1".to_string(),
            1_700_000_000,
            "mintlify".to_string(),
            "Hi there<built>".to_string(),
            FinishReason::Stop,
            ChatUsage {
                prompt_tokens: 3,
                completion_tokens: 4,
                total_tokens: 7,
            },
        );
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["object"], "chat.completion");
        assert_eq!(json["choices"][0]["message"]["role"], "assistant");
        assert_eq!(json["choices"][0]["message"]["content"], "Hi there<built>");
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
        assert_eq!(json["usage"]["total_tokens"], 7);
    }
}
