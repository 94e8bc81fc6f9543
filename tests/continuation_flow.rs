use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use stitch_rs::continuation::{ContinuationPolicy, Orchestrator, PayloadBuilder, StopReason};
use stitch_rs::error::GatewayError;
use stitch_rs::protocol::chat::{ChatMessage, FinishReason, Role};
use stitch_rs::protocol::upstream::UpstreamPayload;
use stitch_rs::stream::{collect_completion, sse_stream, ChunkEncoder, TranslatorSettings};
use stitch_rs::transport::{UpstreamByteStream, UpstreamTransport};
use tokio::sync::mpsc;

/// Serves one scripted reply per round; the last reply repeats.
struct ScriptedTransport {
    replies: Vec<Result<Vec<&'static str>, GatewayError>>,
    payloads: Mutex<Vec<UpstreamPayload>>,
    opened: AtomicUsize,
}

impl ScriptedTransport {
    fn new(replies: Vec<Result<Vec<&'static str>, GatewayError>>) -> Self {
        Self {
            replies,
            payloads: Mutex::new(Vec::new()),
            opened: AtomicUsize::new(0),
        }
    }

    fn texts(texts: &[String]) -> Self {
        let replies = texts
            .iter()
            .map(|text| {
                let line = format!("0:{}\n", serde_json::to_string(text).unwrap());
                Ok(vec![&*Box::leak(line.into_boxed_str())])
            })
            .collect();
        Self::new(replies)
    }

    fn payloads(&self) -> Vec<UpstreamPayload> {
        self.payloads.lock().clone()
    }
}

impl UpstreamTransport for ScriptedTransport {
    async fn open_round(
        &self,
        payload: &UpstreamPayload,
    ) -> Result<UpstreamByteStream, GatewayError> {
        let index = self.opened.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().push(payload.clone());
        let reply = &self.replies[index.min(self.replies.len() - 1)];
        match reply {
            Ok(chunks) => {
                let items: Vec<Result<Bytes, GatewayError>> = chunks
                    .iter()
                    .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
                    .collect();
                Ok(Box::pin(futures_util::stream::iter(items)))
            }
            Err(GatewayError::Upstream { status, message }) => Err(GatewayError::Upstream {
                status: *status,
                message: message.clone(),
            }),
            Err(other) => Err(GatewayError::Transport(other.to_string())),
        }
    }
}

fn fast_policy() -> ContinuationPolicy {
    ContinuationPolicy {
        continue_delay: Duration::ZERO,
        long_round_delay: Duration::ZERO,
        ..ContinuationPolicy::default()
    }
}

fn orchestrator<T: UpstreamTransport>(
    transport: Arc<T>,
    policy: ContinuationPolicy,
) -> Orchestrator<T> {
    Orchestrator::new(
        transport,
        PayloadBuilder::new(None, "mintlify"),
        "<built>",
        policy,
    )
}

fn hello() -> Vec<ChatMessage> {
    vec![ChatMessage::new(Role::User, "hello")]
}

/// One long line with no closing punctuation: always looks truncated.
fn truncated_text(chars: usize) -> String {
    "x".repeat(chars)
}

#[tokio::test]
async fn test_marker_completes_in_one_round() {
    let transport = Arc::new(ScriptedTransport::new(vec![Ok(vec![
        "f:{\"messageId\":\"m1\"}\n",
        "0:\"Hi there\"\n0:\"<built>\"\n",
        "e:{\"finishReason\":\"stop\"}\nd:{\"finishReason\":\"stop\"}\n",
    ])]));
    let orchestrator = orchestrator(Arc::clone(&transport), fast_policy());

    let outcome = collect_completion(&orchestrator, &hello(), 8).await.unwrap();

    assert_eq!(outcome.stop, StopReason::Complete);
    assert_eq!(outcome.finish_reason(), FinishReason::Stop);
    assert_eq!(outcome.rounds, 1);
    assert_eq!(outcome.output, "Hi there<built>");
    assert!(outcome.session_id.is_none());
    assert!(transport.payloads()[0].conversation_id.is_none());
}

#[tokio::test]
async fn test_always_truncated_stops_after_three_rounds() {
    let transport = Arc::new(ScriptedTransport::texts(&[truncated_text(4_000)]));
    let orchestrator = orchestrator(Arc::clone(&transport), fast_policy());

    let outcome = collect_completion(&orchestrator, &hello(), 8).await.unwrap();

    assert_eq!(outcome.stop, StopReason::Forced);
    assert_eq!(outcome.finish_reason(), FinishReason::Length);
    assert_eq!(outcome.rounds, 3);
    assert_eq!(outcome.output.len(), 12_000);

    let payloads = transport.payloads();
    assert_eq!(payloads.len(), 3);
    assert!(payloads[0].id.is_none());
    assert!(payloads[0].conversation_id.is_none());
    let session = payloads[1].conversation_id.clone().expect("session id on round 2");
    assert!(session.starts_with("conv_"));
    assert_eq!(payloads[1].id.as_deref(), Some(session.as_str()));
    assert_eq!(payloads[2].conversation_id.as_deref(), Some(session.as_str()));
    assert_eq!(outcome.session_id.as_deref(), Some(session.as_str()));
}

#[tokio::test]
async fn test_truncated_then_short_round_concatenates() {
    let first = truncated_text(4_000);
    let second = format!("{}.", "y".repeat(499));
    let transport = Arc::new(ScriptedTransport::texts(&[first.clone(), second.clone()]));
    let orchestrator = orchestrator(Arc::clone(&transport), fast_policy());

    let outcome = collect_completion(&orchestrator, &hello(), 8).await.unwrap();

    // A clean 500-char round matches the short-output row first.
    assert_eq!(outcome.stop, StopReason::Short);
    assert_eq!(outcome.finish_reason(), FinishReason::Length);
    assert_eq!(outcome.rounds, 2);
    assert_eq!(outcome.output, format!("{first}{second}"));
}

#[tokio::test]
async fn test_modest_truncated_second_round_is_likely_complete() {
    let transport = Arc::new(ScriptedTransport::texts(&[
        truncated_text(4_000),
        truncated_text(1_500),
    ]));
    let orchestrator = orchestrator(Arc::clone(&transport), fast_policy());

    let outcome = collect_completion(&orchestrator, &hello(), 8).await.unwrap();

    assert_eq!(outcome.stop, StopReason::LikelyComplete);
    assert_eq!(outcome.finish_reason(), FinishReason::Length);
    assert_eq!(outcome.rounds, 2);
}

#[tokio::test]
async fn test_round_ceiling_stops_loop() {
    let transport = Arc::new(ScriptedTransport::texts(&[truncated_text(4_000)]));
    let policy = ContinuationPolicy {
        max_continuations: 2,
        ..fast_policy()
    };
    let orchestrator = orchestrator(Arc::clone(&transport), policy);

    let outcome = collect_completion(&orchestrator, &hello(), 8).await.unwrap();

    assert_eq!(outcome.stop, StopReason::MaxRounds);
    assert_eq!(outcome.rounds, 2);
    assert_eq!(transport.opened.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_continuation_payload_carries_round_tail() {
    let first = format!("{}{}", "a".repeat(3_000), "b".repeat(2_000));
    let transport = Arc::new(ScriptedTransport::texts(&[
        first,
        "All done.<built>".to_string(),
    ]));
    let orchestrator = orchestrator(Arc::clone(&transport), fast_policy());

    let outcome = collect_completion(&orchestrator, &hello(), 8).await.unwrap();
    assert_eq!(outcome.stop, StopReason::Complete);

    let payloads = transport.payloads();
    let continuation = &payloads[1].messages;
    assert_eq!(continuation.len(), 4);
    assert_eq!(continuation[2].role, Role::Assistant);
    assert_eq!(continuation[2].content, "b".repeat(2_000));
    assert_eq!(continuation[3].role, Role::User);
    assert!(continuation[3]
        .content
        .starts_with("Continue exactly from where the previous response was cut off."));
    assert!(continuation[3].content.contains(&"b".repeat(100)));
}

#[tokio::test]
async fn test_transport_failure_aborts_run() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(vec![&*Box::leak(
            format!("0:\"{}\"\n", truncated_text(4_000)).into_boxed_str(),
        )]),
        Err(GatewayError::Upstream {
            status: 500,
            message: "boom".to_string(),
        }),
    ]));
    let orchestrator = orchestrator(Arc::clone(&transport), fast_policy());

    let (tx, mut rx) = mpsc::channel(8);
    let result = orchestrator.run(&hello(), tx).await;

    assert!(matches!(result, Err(GatewayError::Upstream { status: 500, .. })));
    // The first round was already forwarded before the failure.
    let first = rx.recv().await.expect("first round fragment");
    assert_eq!(first.len(), 4_000);
}

#[tokio::test]
async fn test_stream_ending_mid_frame_is_transport_error() {
    let transport = Arc::new(ScriptedTransport::new(vec![Ok(vec![
        "0:\"partial \"\n",
        "0:\"cut",
    ])]));
    let orchestrator = orchestrator(Arc::clone(&transport), fast_policy());

    let err = collect_completion(&orchestrator, &hello(), 8)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Transport(ref msg) if msg.contains("mid-frame")));
}

#[tokio::test]
async fn test_closed_sink_issues_no_rounds() {
    let transport = Arc::new(ScriptedTransport::texts(&["unused".to_string()]));
    let orchestrator = orchestrator(Arc::clone(&transport), fast_policy());

    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let outcome = orchestrator.run(&hello(), tx).await.unwrap();

    assert_eq!(outcome.stop, StopReason::Cancelled);
    assert_eq!(outcome.rounds, 0);
    assert_eq!(transport.opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_closed_sink_during_delay_skips_next_round() {
    let transport = Arc::new(ScriptedTransport::texts(&[truncated_text(4_000)]));
    let policy = ContinuationPolicy {
        continue_delay: Duration::from_secs(5),
        long_round_delay: Duration::from_secs(5),
        ..ContinuationPolicy::default()
    };
    let orchestrator = Arc::new(orchestrator(Arc::clone(&transport), policy));

    let (tx, mut rx) = mpsc::channel(8);
    let started = tokio::time::Instant::now();
    let run = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.run(&hello(), tx).await }
    });

    let first = rx.recv().await.expect("first fragment");
    assert_eq!(first.len(), 4_000);
    drop(rx);

    let outcome = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("run should end without waiting out the delay")
        .unwrap()
        .unwrap();
    assert_eq!(outcome.stop, StopReason::Cancelled);
    assert_eq!(outcome.rounds, 1);
    assert_eq!(transport.opened.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_closed_sink_mid_round_releases_upstream() {
    let released = Arc::new(AtomicBool::new(false));
    let transport = Arc::new(HangingTransport {
        opened: AtomicUsize::new(0),
        released: Arc::clone(&released),
        first_delay: Duration::ZERO,
    });
    let orchestrator = Arc::new(orchestrator(Arc::clone(&transport), fast_policy()));

    let (tx, mut rx) = mpsc::channel(8);
    let run = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.run(&hello(), tx).await }
    });

    let first = rx.recv().await.expect("first fragment");
    assert_eq!(first, "first fragment");
    drop(rx);

    let outcome = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("run should end once the sink closes")
        .unwrap()
        .unwrap();
    assert_eq!(outcome.stop, StopReason::Cancelled);
    assert_eq!(outcome.rounds, 1);
    assert_eq!(outcome.output, "first fragment");
    assert!(released.load(Ordering::SeqCst), "upstream stream not dropped");
    assert_eq!(transport.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_malformed_text_frame_aborts_run() {
    let transport = Arc::new(ScriptedTransport::new(vec![Ok(vec![
        "0:\"kept\"\n0:\"bad \\q\"\n",
    ])]));
    let orchestrator = orchestrator(Arc::clone(&transport), fast_policy());

    let (tx, mut rx) = mpsc::channel(8);
    let result = orchestrator.run(&hello(), tx).await;

    assert!(matches!(result, Err(GatewayError::Transport(ref msg)) if msg.contains("malformed")));
    assert_eq!(rx.recv().await.as_deref(), Some("kept"));
    assert_eq!(transport.opened.load(Ordering::SeqCst), 1);
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// First round yields one fragment and then never ends.
struct HangingTransport {
    opened: AtomicUsize,
    released: Arc<AtomicBool>,
    first_delay: Duration,
}

impl UpstreamTransport for HangingTransport {
    async fn open_round(
        &self,
        _payload: &UpstreamPayload,
    ) -> Result<UpstreamByteStream, GatewayError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let guard = DropFlag(Arc::clone(&self.released));
        let delay = self.first_delay;
        let first = futures_util::stream::once(async move {
            tokio::time::sleep(delay).await;
            Ok::<_, GatewayError>(Bytes::from_static(b"0:\"first fragment\"\n"))
        });
        let stream = first
            .chain(futures_util::stream::pending())
            .map(move |item| {
                let _held = &guard;
                item
            });
        Ok(Box::pin(stream))
    }
}

fn encoder() -> ChunkEncoder {
    ChunkEncoder::new("chatcmpl-test".to_string(), 1_700_000_000, "mintlify".to_string())
}

#[tokio::test]
async fn test_client_disconnect_releases_upstream() {
    let released = Arc::new(AtomicBool::new(false));
    let transport = Arc::new(HangingTransport {
        opened: AtomicUsize::new(0),
        released: Arc::clone(&released),
        first_delay: Duration::ZERO,
    });
    let orchestrator = Arc::new(orchestrator(Arc::clone(&transport), fast_policy()));

    let settings = TranslatorSettings {
        fragment_buffer: 4,
        keepalive_interval: Duration::from_secs(10),
    };
    let mut body = Box::pin(sse_stream(orchestrator, hello(), encoder(), None, settings));

    let first = body.next().await.expect("first frame").unwrap();
    let first = String::from_utf8(first.to_vec()).unwrap();
    assert!(first.contains("first fragment"));

    drop(body);
    for _ in 0..50 {
        if released.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(released.load(Ordering::SeqCst), "upstream stream not dropped");
    assert_eq!(transport.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_keepalive_emitted_while_waiting() {
    let transport = Arc::new(HangingTransport {
        opened: AtomicUsize::new(0),
        released: Arc::new(AtomicBool::new(false)),
        first_delay: Duration::from_millis(300),
    });
    let orchestrator = Arc::new(orchestrator(transport, fast_policy()));

    let settings = TranslatorSettings {
        fragment_buffer: 4,
        keepalive_interval: Duration::from_millis(50),
    };
    let mut body = Box::pin(sse_stream(orchestrator, hello(), encoder(), None, settings));

    let frame = body.next().await.expect("frame").unwrap();
    assert_eq!(&frame[..], b":\n\n");
}

#[tokio::test]
async fn test_sse_stream_frames_in_order() {
    let transport = Arc::new(ScriptedTransport::new(vec![Ok(vec![
        "0:\"Hi\"\n0:\" there\"\n",
        "0:\"<built>\"\n",
    ])]));
    let orchestrator = Arc::new(orchestrator(transport, fast_policy()));
    let settings = TranslatorSettings {
        fragment_buffer: 4,
        keepalive_interval: Duration::from_secs(10),
    };

    let frames: Vec<String> = sse_stream(orchestrator, hello(), encoder(), None, settings)
        .map(|frame| String::from_utf8(frame.unwrap().to_vec()).unwrap())
        .collect()
        .await;

    let body = frames.concat();
    let events: Vec<&str> = body
        .split("\n\n")
        .filter(|event| !event.is_empty())
        .collect();
    assert_eq!(events.len(), 5);
    let deltas: String = events[..3]
        .iter()
        .map(|event| {
            let json: serde_json::Value =
                serde_json::from_str(event.strip_prefix("data: ").unwrap()).unwrap();
            json["choices"][0]["delta"]["content"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(deltas, "Hi there<built>");
    let finish: serde_json::Value =
        serde_json::from_str(events[3].strip_prefix("data: ").unwrap()).unwrap();
    assert_eq!(finish["choices"][0]["finish_reason"], "stop");
    assert_eq!(events[4], "data: [DONE]");
}

#[tokio::test]
async fn test_sse_stream_error_frame_without_done() {
    let transport = Arc::new(ScriptedTransport::new(vec![Err(GatewayError::Upstream {
        status: 429,
        message: "slow down".to_string(),
    })]));
    let orchestrator = Arc::new(orchestrator(transport, fast_policy()));
    let settings = TranslatorSettings {
        fragment_buffer: 4,
        keepalive_interval: Duration::from_secs(10),
    };

    let frames: Vec<String> = sse_stream(orchestrator, hello(), encoder(), None, settings)
        .map(|frame| String::from_utf8(frame.unwrap().to_vec()).unwrap())
        .collect()
        .await;

    assert_eq!(frames.len(), 1);
    assert!(frames[0].contains("\"error\""));
    assert!(frames[0].contains("slow down"));
    assert!(!frames.concat().contains("[DONE]"));
}
