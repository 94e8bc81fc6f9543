use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tiktoken_rs::CoreBPE;
use tracing::{debug, info};

use crate::error::GatewayError;
use crate::protocol::chat::ChatMessage;

/// Fixed overhead per message (role/content framing).
const PER_MESSAGE_OVERHEAD: u64 = 4;
/// Fixed overhead for priming the assistant reply.
const REPLY_PRIMING: u64 = 2;

type BpeCache = RwLock<FxHashMap<String, Option<Arc<CoreBPE>>>>;

fn bpe_cache() -> &'static BpeCache {
    static CACHE: OnceLock<BpeCache> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(FxHashMap::default()))
}

/// Resolve the BPE table for `model`, caching misses as `None`.
fn resolve_bpe(model: &str) -> Option<Arc<CoreBPE>> {
    if let Some(entry) = bpe_cache().read().get(model) {
        return entry.clone();
    }
    let loaded = match tiktoken_rs::get_bpe_from_model(model) {
        Ok(bpe) => Some(Arc::new(bpe)),
        Err(err) => {
            debug!(model, error = %err, "no tokenizer for model, using char estimate");
            None
        }
    };
    bpe_cache()
        .write()
        .entry(model.to_string())
        .or_insert(loaded)
        .clone()
}

/// `ceil(chars / 4)`, used when no tokenizer is available.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Count the tokens in `text` with the tokenizer for `model`.
///
/// Falls back to [`estimate_tokens`] when the model has no known encoding.
#[must_use]
pub fn count_tokens(text: &str, model: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    match resolve_bpe(model) {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
        None => estimate_tokens(text),
    }
}

/// Count prompt tokens for a message list: `4 + role + content` per message,
/// plus 2 for the reply priming.
#[must_use]
pub fn count_message_tokens(messages: &[ChatMessage], model: &str) -> u64 {
    messages.iter().fold(REPLY_PRIMING, |total, message| {
        total
            + PER_MESSAGE_OVERHEAD
            + count_tokens(message.role.as_str(), model)
            + count_tokens(&message.content, model)
    })
}

/// Token usage for one completed request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Log token usage for a completed request at INFO level.
pub fn log_request_usage(model: &str, usage: &TokenUsage, duration: Duration) {
    let seconds = duration.as_secs_f64();
    let tokens_per_second = if seconds > 0.0 {
        usage.completion_tokens as f64 / seconds
    } else {
        0.0
    };
    info!(
        model = model,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        total_tokens = usage.total_tokens(),
        duration_seconds = seconds,
        tokens_per_second = tokens_per_second,
        "request completed"
    );
}

/// Run `count` on the blocking pool, handing `value` back with the result.
async fn count_off_runtime<T, F>(value: T, count: F) -> Result<(T, u64), GatewayError>
where
    T: Send + 'static,
    F: FnOnce(&T) -> u64 + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let tokens = count(&value);
        (value, tokens)
    })
    .await
    .map_err(|err| GatewayError::Internal(format!("Token counting task failed: {err}")))
}

/// Tracks one request's prompt size and start time; reports usage at the end.
///
/// Tokenization runs on the blocking pool, never on a runtime worker.
#[derive(Debug, Clone)]
pub struct UsageRecorder {
    model: String,
    tokenizer_model: String,
    prompt_tokens: u64,
    started: std::time::Instant,
}

impl UsageRecorder {
    /// Count prompt tokens for `messages` and start the clock. The messages
    /// are handed back unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] if the counting task panics.
    pub async fn start(
        model: &str,
        tokenizer_model: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<(Self, Vec<ChatMessage>), GatewayError> {
        let started = std::time::Instant::now();
        let tokenizer = tokenizer_model.to_string();
        let (messages, prompt_tokens) = count_off_runtime(messages, move |messages| {
            count_message_tokens(messages, &tokenizer)
        })
        .await?;
        let recorder = Self {
            model: model.to_string(),
            tokenizer_model: tokenizer_model.to_string(),
            prompt_tokens,
            started,
        };
        Ok((recorder, messages))
    }

    /// Count completion tokens for `output` and log the request summary.
    /// The output is handed back unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] if the counting task panics.
    pub async fn finish(&self, output: String) -> Result<(TokenUsage, String), GatewayError> {
        let tokenizer = self.tokenizer_model.clone();
        let (output, completion_tokens) =
            count_off_runtime(output, move |output| count_tokens(output, &tokenizer)).await?;
        let usage = TokenUsage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens,
        };
        super::log_request_complete(&self.model, &usage, self.started);
        Ok((usage, output))
    }
}
