//! Outbound server-sent-event frames in the `chat.completion.chunk` shape.

use crate::error::{openai_error_payload, GatewayError};
use crate::protocol::chat::FinishReason;
use crate::util::{push_json_string_escaped, push_u64_decimal};

pub const DONE_FRAME: &str = "data: [DONE]\n\n";
/// SSE comment line; ignored by clients, keeps idle connections open.
pub const KEEPALIVE_FRAME: &str = ":\n\n";

/// Encodes chunk frames sharing one response id, timestamp and model.
#[derive(Debug, Clone)]
pub struct ChunkEncoder {
    id: String,
    created: u64,
    model: String,
}

impl ChunkEncoder {
    #[must_use]
    pub fn new(id: String, created: u64, model: String) -> Self {
        Self { id, created, model }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// A content delta frame.
    #[must_use]
    pub fn delta_frame(&self, content: &str) -> String {
        let mut out = String::with_capacity(128 + self.id.len() + self.model.len() + content.len());
        self.push_prefix(&mut out);
        out.push_str(",\"choices\":[{\"index\":0,\"delta\":{\"content\":");
        push_json_string_escaped(&mut out, content);
        out.push_str("},\"finish_reason\":null}]}\n\n");
        out
    }

    /// The terminal frame: empty delta plus the finish reason.
    #[must_use]
    pub fn finish_frame(&self, reason: FinishReason) -> String {
        let mut out = String::with_capacity(128 + self.id.len() + self.model.len());
        self.push_prefix(&mut out);
        out.push_str(",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":");
        push_json_string_escaped(&mut out, reason.as_str());
        out.push_str("}]}\n\n");
        out
    }

    fn push_prefix(&self, out: &mut String) {
        out.push_str("data: {\"id\":");
        push_json_string_escaped(out, &self.id);
        out.push_str(",\"object\":\"chat.completion.chunk\",\"created\":");
        push_u64_decimal(out, self.created);
        out.push_str(",\"model\":");
        push_json_string_escaped(out, &self.model);
    }
}

/// An OpenAI-shaped error body as a data frame.
#[must_use]
pub fn error_frame(err: &GatewayError) -> String {
    let payload = openai_error_payload(err);
    let mut out = String::with_capacity(128);
    out.push_str("data: ");
    out.push_str(&payload.to_string());
    out.push_str("\n\n");
    out
}
