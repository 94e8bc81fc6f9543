use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use tracing::{debug, info};

use crate::continuation::inject_completion_instruction;
use crate::error::GatewayError;
use crate::observability::token_counter::UsageRecorder;
use crate::protocol::chat::{ChatCompletionRequest, ChatCompletionResponse, ChatUsage};
use crate::state::AppState;
use crate::stream::{collect_completion, sse_stream, ChunkEncoder, TranslatorSettings};
use crate::util::{truncate_for_log, unix_now_secs};

/// `POST /v1/chat/completions`.
pub async fn handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = match serde_json::from_slice::<ChatCompletionRequest>(&body) {
        Ok(request) => request,
        Err(err) => {
            return GatewayError::InvalidRequest(format!("Invalid JSON body: {err}"))
                .into_response();
        }
    };
    match handle(state, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle(
    state: Arc<AppState>,
    request: ChatCompletionRequest,
) -> Result<Response, GatewayError> {
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "messages must contain at least one message".to_string(),
        ));
    }

    let config = &state.config;
    let mut messages = request.messages;
    let injected = inject_completion_instruction(&mut messages, state.orchestrator.marker());
    let model = request
        .model
        .filter(|model| !model.trim().is_empty())
        .unwrap_or_else(|| config.features.response_model.clone());
    let response_id = state.next_response_id();

    info!(
        response_id = %response_id,
        stream = request.stream,
        message_count = messages.len(),
        completion_instruction = injected,
        "chat completion request"
    );
    for message in &messages {
        debug!(
            role = message.role.as_str(),
            content = %truncate_for_log(&message.content, 50),
            "request message"
        );
    }

    let (usage, messages) =
        UsageRecorder::start(&model, &config.features.tokenizer_model, messages).await?;
    let fragment_buffer = config.continuation.fragment_buffer;
    let created = unix_now_secs();

    if request.stream {
        let encoder = ChunkEncoder::new(response_id, created, model);
        let settings = TranslatorSettings {
            fragment_buffer,
            keepalive_interval: Duration::from_secs(config.continuation.keepalive_interval_secs),
        };
        let stream = sse_stream(
            Arc::clone(&state.orchestrator),
            messages,
            encoder,
            Some(usage),
            settings,
        );
        return Ok(sse_ok_response(Body::from_stream(stream)));
    }

    let outcome = collect_completion(&state.orchestrator, &messages, fragment_buffer).await?;
    let finish_reason = outcome.finish_reason();
    let (tokens, output) = usage.finish(outcome.output).await?;
    info!(
        response_id = %response_id,
        stop = outcome.stop.as_str(),
        rounds = outcome.rounds,
        output_chars = output.chars().count(),
        "chat completion finished"
    );
    let response = ChatCompletionResponse::new(
        response_id,
        created,
        model,
        output,
        finish_reason,
        ChatUsage {
            prompt_tokens: tokens.prompt_tokens,
            completion_tokens: tokens.completion_tokens,
            total_tokens: tokens.total_tokens(),
        },
    );
    Ok(Json(response).into_response())
}

fn sse_ok_response(body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = http::StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );
    response
}
