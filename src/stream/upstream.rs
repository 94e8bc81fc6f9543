//! Decoder for the upstream assistant's line-oriented response stream.
//!
//! Each line carries a type prefix. `0:` lines hold generated text, usually
//! as a JSON string literal. `data: ` lines are accepted as a fallback framing
//! with an OpenAI chunk payload. Every other prefix (`f:`, `d:`, `e:`, ...) is
//! metadata and dropped.

use bytes::BytesMut;
use memchr::memchr;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::error::GatewayError;
use crate::util::truncate_for_log;

const SAMPLE_LINES: usize = 5;
const SAMPLE_LINE_BYTES: usize = 80;
const MAX_PREFIXES: usize = 8;

/// Classification of one complete upstream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamLine {
    /// Generated text to forward.
    Text(String),
    /// A recognised frame carrying no text (empty delta, `[DONE]`).
    Empty,
    /// Metadata, blank, or unparseable line.
    Ignored,
    /// A quoted `0:` frame that is not a valid JSON string.
    Malformed(String),
}

/// Classify one line (without its `\n`; a trailing `\r` is tolerated).
#[must_use]
pub fn parse_line(line: &str) -> UpstreamLine {
    let line = line.strip_suffix('\r').unwrap_or(line);

    if let Some(payload) = line.strip_prefix("0:") {
        return text_frame(payload);
    }

    if let Some(data) = line.strip_prefix("data: ") {
        return data_frame(data);
    }

    UpstreamLine::Ignored
}

fn text_frame(payload: &str) -> UpstreamLine {
    let text = if is_quoted(payload) {
        match serde_json::from_str::<String>(payload) {
            Ok(decoded) => decoded,
            Err(err) => return UpstreamLine::Malformed(err.to_string()),
        }
    } else {
        payload.to_string()
    };
    if text.is_empty() {
        UpstreamLine::Empty
    } else {
        UpstreamLine::Text(text)
    }
}

fn data_frame(data: &str) -> UpstreamLine {
    let data = data.trim();
    if data.is_empty() {
        return UpstreamLine::Ignored;
    }
    if data == "[DONE]" {
        return UpstreamLine::Empty;
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
        trace!("unparseable data frame dropped");
        return UpstreamLine::Ignored;
    };
    match value
        .pointer("/choices/0/delta/content")
        .and_then(serde_json::Value::as_str)
    {
        Some(content) if !content.is_empty() => UpstreamLine::Text(content.to_string()),
        _ => UpstreamLine::Empty,
    }
}

#[inline]
fn is_quoted(payload: &str) -> bool {
    payload.len() >= 2 && payload.starts_with('"') && payload.ends_with('"')
}

/// Counters describing one upstream round, logged when a round yields no text.
#[derive(Debug, Clone, Default)]
pub struct ParseStats {
    pub raw_chunks: u64,
    pub lines: u64,
    pub recognised_lines: u64,
    pub sample_lines: SmallVec<[String; SAMPLE_LINES]>,
    pub prefixes: SmallVec<[String; MAX_PREFIXES]>,
    pub saw_data_frames: bool,
    pub saw_error_text: bool,
}

impl ParseStats {
    fn observe_line(&mut self, line: &str) {
        self.lines += 1;
        if self.sample_lines.len() < SAMPLE_LINES {
            self.sample_lines
                .push(truncate_for_log(line, SAMPLE_LINE_BYTES));
        }
        if let Some(colon) = line.find(':') {
            if colon > 0 && self.prefixes.len() < MAX_PREFIXES {
                let prefix = &line[..=colon];
                if !self.prefixes.iter().any(|seen| seen == prefix) {
                    self.prefixes.push(prefix.to_string());
                }
            }
        }
        if line.starts_with("data: ") {
            self.saw_data_frames = true;
        }
        if line.contains("error") || line.contains("Error") {
            self.saw_error_text = true;
        }
    }
}

/// Incremental decoder turning raw byte chunks into text fragments.
///
/// Partial lines are buffered across chunks; multi-byte characters split
/// across chunk boundaries are reassembled before decoding.
#[derive(Debug, Default)]
pub struct UpstreamDecoder {
    buffer: BytesMut,
    stats: ParseStats,
}

impl UpstreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            stats: ParseStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> &ParseStats {
        &self.stats
    }

    /// Feed one raw chunk, appending any completed text fragments to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] on a malformed quoted text frame.
    /// Fragments decoded before it are still in `out`.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<String>) -> Result<(), GatewayError> {
        self.stats.raw_chunks += 1;
        self.buffer.extend_from_slice(chunk);
        while let Some(pos) = memchr(b'\n', &self.buffer) {
            let line = self.buffer.split_to(pos + 1);
            self.process_line(&line[..pos], out)?;
        }
        Ok(())
    }

    /// Flush the unterminated tail at end of stream.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when the stream stopped inside a
    /// quoted text frame.
    pub fn finish(&mut self, out: &mut Vec<String>) -> Result<(), GatewayError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let tail = self.buffer.split();
        let tail_str = String::from_utf8_lossy(&tail);
        let trimmed = tail_str.strip_suffix('\r').unwrap_or(&tail_str);
        if let Some(payload) = trimmed.strip_prefix("0:\"") {
            if !payload.ends_with('"') || serde_json::from_str::<String>(&trimmed[2..]).is_err() {
                return Err(GatewayError::Transport(
                    "stream ended mid-frame".to_string(),
                ));
            }
        }
        self.process_line(&tail, out)
    }

    fn process_line(&mut self, raw: &[u8], out: &mut Vec<String>) -> Result<(), GatewayError> {
        let line = String::from_utf8_lossy(raw);
        let line = line.strip_suffix('\r').unwrap_or(&line);
        if line.is_empty() {
            return Ok(());
        }
        self.stats.observe_line(line);
        match parse_line(line) {
            UpstreamLine::Text(text) => {
                self.stats.recognised_lines += 1;
                out.push(text);
            }
            UpstreamLine::Empty => self.stats.recognised_lines += 1,
            UpstreamLine::Ignored => {}
            UpstreamLine::Malformed(reason) => {
                debug!(
                    line = %truncate_for_log(line, SAMPLE_LINE_BYTES),
                    error = %reason,
                    "malformed text frame"
                );
                return Err(GatewayError::Transport(format!(
                    "malformed text frame: {reason}"
                )));
            }
        }
        Ok(())
    }
}
