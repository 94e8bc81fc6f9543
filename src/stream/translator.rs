//! Turns the orchestrator's fragment sequence into caller-facing output:
//! an SSE body for streaming callers, a concatenated string for batch callers.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::continuation::{ContinuationOutcome, Orchestrator};
use crate::error::GatewayError;
use crate::observability::token_counter::UsageRecorder;
use crate::protocol::chat::ChatMessage;
use crate::transport::UpstreamTransport;

use super::sse::{error_frame, ChunkEncoder, DONE_FRAME, KEEPALIVE_FRAME};

/// Channel and timer settings for one translated response.
#[derive(Debug, Clone, Copy)]
pub struct TranslatorSettings {
    pub fragment_buffer: usize,
    pub keepalive_interval: Duration,
}

/// Run the loop to completion and return the outcome with the drained text.
///
/// # Errors
///
/// Propagates the orchestrator's transport failure.
pub async fn collect_completion<T: UpstreamTransport>(
    orchestrator: &Orchestrator<T>,
    messages: &[ChatMessage],
    fragment_buffer: usize,
) -> Result<ContinuationOutcome, GatewayError> {
    let (tx, mut rx) = mpsc::channel::<String>(fragment_buffer.max(1));
    let drain = async {
        let mut collected = String::new();
        while let Some(fragment) = rx.recv().await {
            collected.push_str(&fragment);
        }
        collected
    };
    let (result, collected) = tokio::join!(orchestrator.run(messages, tx), drain);
    let mut outcome = result?;
    outcome.output = collected;
    Ok(outcome)
}

/// Aborts the orchestrator task when the response body is dropped.
struct TaskGuard(JoinHandle<Result<ContinuationOutcome, GatewayError>>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct SseState {
    rx: mpsc::Receiver<String>,
    task: TaskGuard,
    keepalive: Interval,
    encoder: ChunkEncoder,
    usage: Option<UsageRecorder>,
    finished: bool,
}

impl SseState {
    /// Frames emitted after the fragment channel closes.
    async fn terminal_frames(&mut self) -> String {
        let joined = (&mut self.task.0).await;
        let result = joined.unwrap_or_else(|err| {
            Err(GatewayError::Internal(format!(
                "continuation task failed: {err}"
            )))
        });
        match result {
            Ok(outcome) => {
                let finish_reason = outcome.finish_reason();
                if let Some(usage) = &self.usage {
                    if let Err(err) = usage.finish(outcome.output).await {
                        warn!(response_id = self.encoder.id(), error = %err, "usage not recorded");
                    }
                }
                debug!(
                    response_id = self.encoder.id(),
                    stop = outcome.stop.as_str(),
                    rounds = outcome.rounds,
                    "stream finished"
                );
                let mut out = self.encoder.finish_frame(finish_reason);
                out.push_str(DONE_FRAME);
                out
            }
            Err(err) => {
                warn!(response_id = self.encoder.id(), error = %err, "stream aborted");
                error_frame(&err)
            }
        }
    }
}

/// Spawn the orchestrator and return the SSE body stream for its output.
///
/// The body owns the keep-alive timer and the orchestrator task: dropping it
/// (client disconnect) aborts the task and releases the upstream response.
pub fn sse_stream<T: UpstreamTransport>(
    orchestrator: Arc<Orchestrator<T>>,
    messages: Vec<ChatMessage>,
    encoder: ChunkEncoder,
    usage: Option<UsageRecorder>,
    settings: TranslatorSettings,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let (tx, rx) = mpsc::channel::<String>(settings.fragment_buffer.max(1));
    let handle = tokio::spawn(async move { orchestrator.run(&messages, tx).await });

    let period = settings.keepalive_interval;
    let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let state = SseState {
        rx,
        task: TaskGuard(handle),
        keepalive,
        encoder,
        usage,
        finished: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        let frame = tokio::select! {
            biased;
            fragment = state.rx.recv() => match fragment {
                Some(text) => state.encoder.delta_frame(&text),
                None => {
                    state.finished = true;
                    state.terminal_frames().await
                }
            },
            _ = state.keepalive.tick() => KEEPALIVE_FRAME.to_string(),
        };
        Some((Ok(Bytes::from(frame)), state))
    })
}
