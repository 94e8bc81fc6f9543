//! Automatic continuation of truncated upstream generations.
//!
//! [`detector`] judges a round's text, [`policy`] turns that judgement into
//! stop/continue, [`payload`] builds each round's request, and
//! [`orchestrator`] runs the loop.

pub mod detector;
pub mod orchestrator;
pub mod payload;
pub mod policy;
pub mod session;

pub use detector::{has_completion_marker, is_truncated, verdict, CompletionVerdict};
pub use orchestrator::{ContinuationOutcome, Orchestrator};
pub use payload::{inject_completion_instruction, ContextKind, PayloadBuilder};
pub use policy::{ContinuationPolicy, RoundDecision, StopReason};
pub use session::ContinuationSession;
