use std::convert::Infallible;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;

const DEFAULT_UPSTREAM_PORT: u16 = 19_002;
const DEFAULT_TRUNCATED_CHARS: usize = 4_000;
const INITIAL_ROUND_MARKER: &[u8] = b"\"conversation_id\":null";

#[derive(Copy, Clone)]
enum MockScenario {
    /// One round ending with the completion marker.
    Complete,
    /// A long truncated first round, then a marker-terminated continuation.
    Truncated,
    /// Every round is long and truncated.
    Never,
    /// `data:` frames in the chat-completions delta shape.
    DataFrames,
    Error,
}

struct RoundStats {
    initial: AtomicU64,
    continuation: AtomicU64,
}

impl RoundStats {
    const fn new() -> Self {
        Self {
            initial: AtomicU64::new(0),
            continuation: AtomicU64::new(0),
        }
    }

    fn record(&self, is_initial: bool) {
        if is_initial {
            self.initial.fetch_add(1, Ordering::Relaxed);
        } else {
            self.continuation.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> (u64, u64) {
        (
            self.initial.load(Ordering::Relaxed),
            self.continuation.load(Ordering::Relaxed),
        )
    }

    fn reset(&self) {
        self.initial.store(0, Ordering::Relaxed);
        self.continuation.store(0, Ordering::Relaxed);
    }
}

struct MockState {
    scenario: MockScenario,
    marker: String,
    truncated_chars: usize,
    stats: RoundStats,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let port = env_parse("UPSTREAM_PORT", DEFAULT_UPSTREAM_PORT);
    let state = Arc::new(MockState {
        scenario: parse_scenario(),
        marker: env::var("MOCK_MARKER").unwrap_or_else(|_| "<built>".to_string()),
        truncated_chars: env_parse("MOCK_TRUNCATED_CHARS", DEFAULT_TRUNCATED_CHARS),
        stats: RoundStats::new(),
    });

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap_or_else(|err| panic!("failed to bind mock upstream on 127.0.0.1:{port}: {err}"));
    let conn_builder = AutoBuilder::new(TokioExecutor::new());

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok((stream, remote_addr)) => (stream, remote_addr),
            Err(err) => {
                eprintln!("accept error: {err}");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let conn_builder = conn_builder.clone();
        let service_state = Arc::clone(&state);
        let service = service_fn(move |request: Request<Incoming>| {
            let state_ref = Arc::clone(&service_state);
            async move { Ok::<_, Infallible>(handle_request(request, &state_ref).await) }
        });

        tokio::spawn(async move {
            if let Err(err) = conn_builder.serve_connection(io, service).await {
                eprintln!("mock upstream connection error from {remote_addr}: {err}");
            }
        });
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_scenario() -> MockScenario {
    match env::var("MOCK_SCENARIO").as_deref() {
        Ok("truncated") => MockScenario::Truncated,
        Ok("never") => MockScenario::Never,
        Ok("data") => MockScenario::DataFrames,
        Ok("error") => MockScenario::Error,
        Ok("complete") | Err(_) => MockScenario::Complete,
        Ok(other) => {
            eprintln!("unknown MOCK_SCENARIO '{other}', fallback to complete");
            MockScenario::Complete
        }
    }
}

async fn handle_request(request: Request<Incoming>, state: &Arc<MockState>) -> Response<Full<Bytes>> {
    let (parts, body) = request.into_parts();
    let body = read_request_body(body).await;

    let method = parts.method;
    let path = parts.uri.path();

    if method == Method::GET && path == "/_mock/stats" {
        return stats_response(state);
    }
    if method == Method::POST && path == "/_mock/reset" {
        state.stats.reset();
        return simple_response(
            StatusCode::OK,
            "application/json",
            Bytes::from_static(br#"{"ok":true}"#),
        );
    }
    if method != Method::POST {
        return simple_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "application/json",
            Bytes::from_static(br#"{"error":"method_not_allowed"}"#),
        );
    }
    if !path.ends_with("/message") {
        return simple_response(
            StatusCode::NOT_FOUND,
            "application/json",
            Bytes::from_static(br#"{"error":"not_found"}"#),
        );
    }

    let is_initial = memchr::memmem::find(&body, INITIAL_ROUND_MARKER).is_some();
    state.stats.record(is_initial);

    let lines = match state.scenario {
        MockScenario::Error => {
            return simple_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "application/json",
                Bytes::from_static(br#"{"error":"mock_injected_error"}"#),
            );
        }
        MockScenario::Complete => text_lines(&[
            "Hello from the mock assistant. ",
            state.marker.as_str(),
        ]),
        MockScenario::Truncated if !is_initial => text_lines(&[
            "...and that completes the application.",
            state.marker.as_str(),
        ]),
        MockScenario::Truncated | MockScenario::Never => {
            text_lines(&[truncated_text(state.truncated_chars).as_str()])
        }
        MockScenario::DataFrames => {
            data_frames(&["Hello from ", "data frames. ", state.marker.as_str()])
        }
    };

    let mut response = simple_response(StatusCode::OK, "text/plain; charset=utf-8", lines);
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

async fn read_request_body(mut body: Incoming) -> BytesMut {
    let mut collected = BytesMut::new();
    while let Some(frame_result) = body.frame().await {
        let Ok(frame) = frame_result else {
            break;
        };
        if let Some(data) = frame.data_ref() {
            collected.extend_from_slice(data);
        }
    }
    collected
}

/// A single long line without closing punctuation.
fn truncated_text(chars: usize) -> String {
    const WORDS: &str = "function render the component state and update ";
    WORDS.chars().cycle().take(chars).collect()
}

fn push_json_string(out: &mut String, value: &str) {
    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c <= '\u{1f}' => out.push_str(&format!("\\u{:04x}", c as u32)),
            _ => out.push(ch),
        }
    }
    out.push('"');
}

fn text_lines(texts: &[&str]) -> Bytes {
    let mut out = String::from("f:{\"messageId\":\"msg-mock\"}\n");
    for text in texts {
        out.push_str("0:");
        push_json_string(&mut out, text);
        out.push('\n');
    }
    out.push_str("e:{\"finishReason\":\"stop\",\"isContinued\":false}\n");
    out.push_str("d:{\"finishReason\":\"stop\"}\n");
    Bytes::from(out)
}

fn data_frames(texts: &[&str]) -> Bytes {
    let mut out = String::new();
    for text in texts {
        out.push_str("data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":");
        push_json_string(&mut out, text);
        out.push_str("}}]}\n");
    }
    out.push_str("data: [DONE]\n");
    Bytes::from(out)
}

fn stats_response(state: &MockState) -> Response<Full<Bytes>> {
    let (initial, continuation) = state.stats.snapshot();
    let scenario = match state.scenario {
        MockScenario::Complete => "complete",
        MockScenario::Truncated => "truncated",
        MockScenario::Never => "never",
        MockScenario::DataFrames => "data",
        MockScenario::Error => "error",
    };
    let body = format!(
        "{{\"scenario\":\"{scenario}\",\"initial_rounds\":{initial},\"continuation_rounds\":{continuation}}}"
    );
    simple_response(StatusCode::OK, "application/json", Bytes::from(body))
}

fn simple_response(
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
