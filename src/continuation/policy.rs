use std::time::Duration;

use crate::config::{ContinuationConfig, Profile};
use crate::protocol::chat::FinishReason;

use super::detector::CompletionVerdict;

/// Why the continuation loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The round ended with the completion marker.
    Complete,
    /// A short, structurally complete round.
    Short,
    /// A modest continuation round after the first.
    LikelyComplete,
    /// Hard stop after the forced-stop round.
    Forced,
    /// The configured round ceiling was reached.
    MaxRounds,
    /// The caller stopped listening.
    Cancelled,
}

impl StopReason {
    #[must_use]
    pub fn finish_reason(self) -> FinishReason {
        match self {
            StopReason::Complete => FinishReason::Stop,
            _ => FinishReason::Length,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Complete => "complete",
            StopReason::Short => "short",
            StopReason::LikelyComplete => "likely_complete",
            StopReason::Forced => "forced",
            StopReason::MaxRounds => "max_rounds",
            StopReason::Cancelled => "cancelled",
        }
    }
}

/// Outcome of evaluating one finished round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundDecision {
    Stop(StopReason),
    Continue { delay: Duration },
}

/// Thresholds driving the stopping policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationPolicy {
    pub max_continuations: u32,
    pub short_output_chars: usize,
    pub likely_complete_chars: usize,
    pub forced_stop_round: u32,
    pub context_window_chars: usize,
    pub long_round_chars: usize,
    pub continue_delay: Duration,
    pub long_round_delay: Duration,
}

impl Default for ContinuationPolicy {
    fn default() -> Self {
        Self::from_config(&ContinuationConfig::default(), Profile::default())
    }
}

impl ContinuationPolicy {
    #[must_use]
    pub fn from_config(config: &ContinuationConfig, profile: Profile) -> Self {
        Self {
            max_continuations: config.effective_max_continuations(profile),
            short_output_chars: config.short_output_chars,
            likely_complete_chars: config.likely_complete_chars,
            forced_stop_round: config.forced_stop_round,
            context_window_chars: config.context_window_chars,
            long_round_chars: config.long_round_chars,
            continue_delay: Duration::from_millis(config.continue_delay_ms),
            long_round_delay: Duration::from_millis(config.long_round_delay_ms),
        }
    }

    /// Apply the stopping table to a finished round. First matching row wins.
    ///
    /// `round_chars` is the round's length in characters.
    #[must_use]
    pub fn decide_round(
        &self,
        round_index: u32,
        round_chars: usize,
        verdict: CompletionVerdict,
    ) -> RoundDecision {
        if verdict.has_marker {
            return RoundDecision::Stop(StopReason::Complete);
        }
        if !verdict.is_truncated && round_chars < self.short_output_chars {
            return RoundDecision::Stop(StopReason::Short);
        }
        if round_index >= 1 && round_chars < self.likely_complete_chars {
            return RoundDecision::Stop(StopReason::LikelyComplete);
        }
        if round_index >= self.forced_stop_round {
            return RoundDecision::Stop(StopReason::Forced);
        }
        let delay = if round_chars > self.long_round_chars {
            self.long_round_delay
        } else {
            self.continue_delay
        };
        RoundDecision::Continue { delay }
    }

    /// Whether a loop that has advanced to `next_round_index` must stop.
    #[must_use]
    pub fn exhausted(&self, next_round_index: u32) -> bool {
        next_round_index >= self.max_continuations
    }
}
