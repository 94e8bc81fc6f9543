pub mod token_counter;

use self::token_counter::TokenUsage;
use tracing_subscriber::EnvFilter;

/// Map a configured level name onto a tracing filter directive.
///
/// `DISABLED` yields `None`; `WARNING` and `CRITICAL` become `WARN` and `ERROR`.
#[must_use]
pub fn filter_directive(log_level: &str) -> Option<String> {
    match log_level.trim().to_uppercase().as_str() {
        "DISABLED" => None,
        "WARNING" => Some("WARN".to_string()),
        "CRITICAL" => Some("ERROR".to_string()),
        other => Some(other.to_string()),
    }
}

/// Install the global fmt subscriber for the configured log level.
///
/// A second call is a no-op.
pub fn init_tracing(log_level: &str) {
    let Some(directive) = filter_directive(log_level) else {
        return;
    };
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("INFO"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

/// Log token usage for a completed request, computing duration from start time.
pub fn log_request_complete(model: &str, usage: &TokenUsage, start_time: std::time::Instant) {
    token_counter::log_request_usage(model, usage, start_time.elapsed());
}
