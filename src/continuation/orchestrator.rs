use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::protocol::chat::{ChatMessage, FinishReason};
use crate::protocol::upstream::UpstreamPayload;
use crate::stream::upstream::UpstreamDecoder;
use crate::transport::UpstreamTransport;
use crate::util::char_len;

use super::detector::verdict;
use super::payload::PayloadBuilder;
use super::policy::{ContinuationPolicy, RoundDecision, StopReason};
use super::session::ContinuationSession;

/// Result of one full continuation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationOutcome {
    pub stop: StopReason,
    /// Upstream rounds that were dispatched.
    pub rounds: u32,
    pub session_id: Option<String>,
    /// Concatenation of every forwarded fragment.
    pub output: String,
}

impl ContinuationOutcome {
    #[must_use]
    pub fn finish_reason(&self) -> FinishReason {
        self.stop.finish_reason()
    }
}

enum RoundEnd {
    Finished(String),
    Cancelled,
}

/// Drives sequential upstream rounds until the output looks complete or a
/// bound is hit, forwarding every fragment to the caller as it arrives.
pub struct Orchestrator<T> {
    transport: Arc<T>,
    builder: PayloadBuilder,
    marker: String,
    policy: ContinuationPolicy,
}

impl<T: UpstreamTransport> Orchestrator<T> {
    #[must_use]
    pub fn new(
        transport: Arc<T>,
        builder: PayloadBuilder,
        marker: impl Into<String>,
        policy: ContinuationPolicy,
    ) -> Self {
        Self {
            transport,
            builder,
            marker: marker.into(),
            policy,
        }
    }

    #[must_use]
    pub fn from_config(transport: Arc<T>, config: &AppConfig) -> Self {
        let continuation = &config.continuation;
        Self::new(
            transport,
            PayloadBuilder::new(continuation.system_prompt.as_deref(), config.upstream.fp.as_str()),
            continuation.completion_marker.as_str(),
            ContinuationPolicy::from_config(continuation, config.server.profile),
        )
    }

    #[must_use]
    pub fn marker(&self) -> &str {
        &self.marker
    }

    #[must_use]
    pub fn policy(&self) -> &ContinuationPolicy {
        &self.policy
    }

    /// Run the continuation loop for `messages`, sending each text fragment
    /// to `sink` in arrival order.
    ///
    /// A closed sink ends the loop with [`StopReason::Cancelled`] and no
    /// further rounds are issued.
    ///
    /// # Errors
    ///
    /// Any transport failure aborts the whole run.
    pub async fn run(
        &self,
        messages: &[ChatMessage],
        sink: mpsc::Sender<String>,
    ) -> Result<ContinuationOutcome, GatewayError> {
        let mut session = ContinuationSession::new();
        let mut rounds = 0u32;

        loop {
            if sink.is_closed() {
                return Ok(outcome(session, StopReason::Cancelled, rounds));
            }

            let is_initial = session.is_initial();
            let payload = self.builder.build(
                messages,
                session.session_id(),
                is_initial,
                session.last_round_output(),
            );
            info!(
                round = session.round_index() + 1,
                max_rounds = self.policy.max_continuations,
                mode = if is_initial { "initial" } else { "continuation" },
                session_id = session.session_id().unwrap_or("-"),
                prior_chars = session.last_round_output().map_or(0, char_len),
                "dispatching upstream round"
            );

            rounds += 1;
            let round_text = match self.run_round(&payload, &sink, &mut session).await? {
                RoundEnd::Finished(text) => text,
                RoundEnd::Cancelled => {
                    debug!(round = rounds, "caller disconnected mid-round");
                    return Ok(outcome(session, StopReason::Cancelled, rounds));
                }
            };

            let round_chars = char_len(&round_text);
            let round_verdict = verdict(&round_text, &self.marker);
            session.finish_round(&round_text, self.policy.context_window_chars);
            let decision = self
                .policy
                .decide_round(session.round_index(), round_chars, round_verdict);

            info!(
                round = session.round_index() + 1,
                round_chars,
                total_chars = char_len(session.accumulated_output()),
                has_marker = round_verdict.has_marker,
                truncated = round_verdict.is_truncated,
                decision = ?decision,
                "upstream round completed"
            );

            match decision {
                RoundDecision::Stop(reason) => {
                    return Ok(outcome(session, reason, rounds));
                }
                RoundDecision::Continue { delay } => {
                    session.ensure_session_id();
                    let next_round = session.advance();
                    if self.policy.exhausted(next_round) {
                        info!(
                            rounds,
                            max_rounds = self.policy.max_continuations,
                            "continuation ceiling reached"
                        );
                        return Ok(outcome(session, StopReason::MaxRounds, rounds));
                    }
                    if !delay.is_zero() {
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = sink.closed() => {
                                return Ok(outcome(session, StopReason::Cancelled, rounds));
                            }
                        }
                    }
                }
            }
        }
    }

    async fn run_round(
        &self,
        payload: &UpstreamPayload,
        sink: &mpsc::Sender<String>,
        session: &mut ContinuationSession,
    ) -> Result<RoundEnd, GatewayError> {
        let mut stream = self.transport.open_round(payload).await?;
        let mut decoder = UpstreamDecoder::new();
        let mut fragments = Vec::new();
        let mut round_text = String::new();

        loop {
            let next = tokio::select! {
                biased;
                () = sink.closed() => return Ok(RoundEnd::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let fed = decoder.feed(&chunk?, &mut fragments);
            if !forward(&mut fragments, sink, session, &mut round_text).await {
                return Ok(RoundEnd::Cancelled);
            }
            fed?;
        }

        decoder.finish(&mut fragments)?;
        if !forward(&mut fragments, sink, session, &mut round_text).await {
            return Ok(RoundEnd::Cancelled);
        }

        if round_text.is_empty() {
            let stats = decoder.stats();
            warn!(
                raw_chunks = stats.raw_chunks,
                lines = stats.lines,
                recognised_lines = stats.recognised_lines,
                prefixes = ?stats.prefixes,
                sample_lines = ?stats.sample_lines,
                data_frames = stats.saw_data_frames,
                error_text = stats.saw_error_text,
                "upstream round produced no text"
            );
        }
        Ok(RoundEnd::Finished(round_text))
    }
}

/// Send drained fragments in order. Returns `false` once the sink is gone.
async fn forward(
    fragments: &mut Vec<String>,
    sink: &mpsc::Sender<String>,
    session: &mut ContinuationSession,
    round_text: &mut String,
) -> bool {
    for fragment in fragments.drain(..) {
        session.append_fragment(&fragment);
        round_text.push_str(&fragment);
        if sink.send(fragment).await.is_err() {
            return false;
        }
    }
    true
}

fn outcome(session: ContinuationSession, stop: StopReason, rounds: u32) -> ContinuationOutcome {
    ContinuationOutcome {
        stop,
        rounds,
        session_id: session.session_id().map(str::to_string),
        output: session.into_output(),
    }
}
