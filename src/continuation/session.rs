use crate::util::{push_random_base36, push_u64_decimal, tail_chars, unix_now_millis};

/// Per-request loop state. Lives only as long as one orchestrator run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContinuationSession {
    session_id: Option<String>,
    round_index: u32,
    accumulated_output: String,
    last_round_output: String,
}

impl ContinuationSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    #[must_use]
    pub fn round_index(&self) -> u32 {
        self.round_index
    }

    #[must_use]
    pub fn is_initial(&self) -> bool {
        self.round_index == 0
    }

    #[must_use]
    pub fn accumulated_output(&self) -> &str {
        &self.accumulated_output
    }

    /// Tail of the most recent round, handed to the next continuation payload.
    #[must_use]
    pub fn last_round_output(&self) -> Option<&str> {
        (!self.last_round_output.is_empty()).then_some(self.last_round_output.as_str())
    }

    /// Generate the session id on first use; later calls keep it.
    pub fn ensure_session_id(&mut self) -> &str {
        self.session_id.get_or_insert_with(generate_session_id)
    }

    pub fn append_fragment(&mut self, fragment: &str) {
        self.accumulated_output.push_str(fragment);
    }

    /// Keep the last `window_chars` characters of the finished round.
    pub fn finish_round(&mut self, round_text: &str, window_chars: usize) {
        self.last_round_output.clear();
        self.last_round_output
            .push_str(tail_chars(round_text, window_chars));
    }

    /// Advance to the next round and return its index.
    pub fn advance(&mut self) -> u32 {
        self.round_index += 1;
        self.round_index
    }

    #[must_use]
    pub fn into_output(self) -> String {
        self.accumulated_output
    }
}

/// `conv_<millis>_<6 random base36>`.
fn generate_session_id() -> String {
    let mut out = String::with_capacity(32);
    out.push_str("conv_");
    push_u64_decimal(&mut out, unix_now_millis());
    out.push('_');
    push_random_base36(&mut out, 6);
    out
}
