use std::sync::LazyLock;

use chrono::{DateTime, Local, SecondsFormat, Utc};
use regex_lite::Regex;

use crate::protocol::chat::{ChatMessage, Role};
use crate::protocol::upstream::{UpstreamMessage, UpstreamPayload};
use crate::util::{push_random_base36, push_u64_base36, tail_chars, unix_now_millis};

pub const DEFAULT_SYSTEM_PROMPT: &str = "The assistant is an AI assistant.\n\
**CRITICAL RULE: The assistant MUST NOT unnecessarily mention searching through documentation, \
using tools, or reference any search/lookup processes when answering simple questions that \
don't require such explanations. This is the highest priority rule.**";

/// Placeholder in the system prompt replaced by the current local date and time.
pub const DATE_TIME_PLACEHOLDER: &str = "{currentDateTime}";

const FALLBACK_CONTINUATION: &str = "Please continue exactly from where you left off. \
Complete the remaining parts of the application or documentation.";
const CONTINUATION_BASE: &str = "Continue exactly from where the previous response was cut off.";

/// Characters of prior output inspected to classify where it stopped.
const CLASSIFY_WINDOW_CHARS: usize = 200;
/// Characters of prior output quoted back in the continuation instruction.
const QUOTE_CHARS: usize = 100;

/// What the previous round was in the middle of writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Code,
    Documentation,
    Markup,
    General,
}

/// Whitespace class substituted for `\s`: ASCII whitespace plus the Unicode
/// space separators, no-break spaces and BOM.
const UNICODE_SPACE: &str =
    "[\\s\u{a0}\u{1680}\u{2000}-\u{200a}\u{2028}\u{2029}\u{202f}\u{205f}\u{3000}\u{feff}]";

/// Ordered classifier table; the first matching pattern decides.
static CONTEXT_PATTERNS: LazyLock<Vec<(ContextKind, Regex)>> = LazyLock::new(|| {
    [
        (ContextKind::Code, r"```[\w]*\s*$"),
        (ContextKind::Code, r"^[^`]*```$"),
        (ContextKind::Code, r"\{\s*$"),
        (ContextKind::Code, r"^\s*\}$"),
        (ContextKind::Code, r"function\s+\w*\s*\([^)]*$"),
        (ContextKind::Code, r"class\s+\w*\s*\{?$"),
        (ContextKind::Code, r#"import\s+.*from\s+['"][^'"]*$"#),
        (ContextKind::Code, r"export\s+.*\{?$"),
        (ContextKind::Documentation, r"#+\s*[^\n]*$"),
        (ContextKind::Documentation, r"\*\s*[^\n]*$"),
        (ContextKind::Documentation, r"\d+\.\s*[^\n]*$"),
        (ContextKind::Documentation, r"##\s*[^\n]*$"),
        (ContextKind::Markup, r"<[^>]*$"),
        (ContextKind::Markup, r"^[^<]*>$"),
        (ContextKind::Markup, r"<\w+[^>]*$"),
    ]
    .into_iter()
    .map(|(kind, pattern)| {
        let pattern = pattern.replace(r"\s", UNICODE_SPACE);
        let re = Regex::new(&pattern)
            .unwrap_or_else(|err| panic!("invalid context pattern {pattern:?}: {err}"));
        (kind, re)
    })
    .collect()
});

/// Classify the tail of a truncated output.
#[must_use]
pub fn classify_context(window: &str) -> ContextKind {
    CONTEXT_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(window))
        .map_or(ContextKind::General, |(kind, _)| *kind)
}

/// Instruction asking the model to resume after `prior_output`.
#[must_use]
pub fn continuation_instruction(prior_output: Option<&str>) -> String {
    let Some(prior) = prior_output.filter(|text| !text.is_empty()) else {
        return FALLBACK_CONTINUATION.to_string();
    };
    let window = tail_chars(prior, CLASSIFY_WINDOW_CHARS);
    let quoted = tail_chars(window, QUOTE_CHARS);
    match classify_context(window) {
        ContextKind::Code => format!(
            "{CONTINUATION_BASE} You were in the middle of writing code. The last part was: \
             \"{quoted}\" - continue the code from this exact point, maintaining proper syntax \
             and structure. Do not repeat any code that was already written."
        ),
        ContextKind::Documentation => format!(
            "{CONTINUATION_BASE} You were writing documentation. The last part was: \
             \"{quoted}\" - continue the documentation from this exact point without repeating \
             content."
        ),
        ContextKind::Markup => format!(
            "{CONTINUATION_BASE} You were writing HTML/JSX. The last part was: \"{quoted}\" - \
             continue the HTML/JSX from this exact point, ensuring proper tag closure and \
             structure."
        ),
        ContextKind::General => format!(
            "{CONTINUATION_BASE} The last part of your response was: \"{quoted}\" - continue \
             from this exact point without repeating any content. Pick up seamlessly where you \
             left off."
        ),
    }
}

/// Instruction appended to the caller's system message before the first round.
#[must_use]
pub fn completion_instruction(marker: &str) -> String {
    format!(
        "\n\nIMPORTANT: When you have completely finished building the application and provided \
         all necessary code, end your response with the exact word: {marker}\n\n\
         This marker indicates the application is complete and ready to use. Do not include \
         {marker} unless the application is fully complete.\n\n\
         NOTE: If your response gets cut off due to length limits, I will automatically continue \
         the conversation to get the complete response. You should continue exactly from where \
         you left off when prompted."
    )
}

/// Append the completion instruction to the first system message, if any.
///
/// Returns whether a message was changed.
pub fn inject_completion_instruction(messages: &mut [ChatMessage], marker: &str) -> bool {
    let Some(system) = messages.iter_mut().find(|m| m.role == Role::System) else {
        return false;
    };
    system.content.push_str(&completion_instruction(marker));
    true
}

/// Builds upstream request bodies for initial and continuation rounds.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    system_prompt: String,
    fp: String,
}

impl PayloadBuilder {
    #[must_use]
    pub fn new(system_prompt: Option<&str>, fp: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.unwrap_or(DEFAULT_SYSTEM_PROMPT).to_string(),
            fp: fp.into(),
        }
    }

    /// Build the payload for one round.
    ///
    /// Continuation rounds append the prior output as an assistant turn
    /// followed by a tailored user instruction. The session id is passed
    /// through unchanged.
    #[must_use]
    pub fn build(
        &self,
        messages: &[ChatMessage],
        session_id: Option<&str>,
        is_initial: bool,
        prior_output: Option<&str>,
    ) -> UpstreamPayload {
        let now = Utc::now();
        let created_at = now.to_rfc3339_opts(SecondsFormat::Millis, true);
        let system_prompt = render_system_prompt(&self.system_prompt, &now.with_timezone(&Local));

        let mut formatted = Vec::with_capacity(messages.len() + 3);
        formatted.push(UpstreamMessage::text(
            message_id("sys"),
            created_at.clone(),
            Role::System,
            system_prompt,
        ));
        formatted.extend(messages.iter().map(|message| {
            UpstreamMessage::text(
                message_id("msg"),
                created_at.clone(),
                message.role,
                message.content.as_str(),
            )
        }));

        if !is_initial {
            let prior = prior_output.filter(|text| !text.is_empty());
            if let Some(prior) = prior {
                formatted.push(UpstreamMessage::text(
                    message_id("prev"),
                    created_at.clone(),
                    Role::Assistant,
                    prior,
                ));
            }
            formatted.push(UpstreamMessage::text(
                message_id("cont"),
                created_at,
                Role::User,
                continuation_instruction(prior),
            ));
        }

        UpstreamPayload {
            id: session_id.map(str::to_string),
            conversation_id: session_id.map(str::to_string),
            messages: formatted,
            fp: self.fp.clone(),
        }
    }
}

fn render_system_prompt(template: &str, now: &DateTime<Local>) -> String {
    if !template.contains(DATE_TIME_PLACEHOLDER) {
        return template.to_string();
    }
    let rendered = now.format("%B %d, %Y %I:%M %p").to_string();
    template.replace(DATE_TIME_PLACEHOLDER, &rendered)
}

/// `<prefix>_<base36 millis><4 random base36>`.
fn message_id(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 14);
    out.push_str(prefix);
    out.push('_');
    push_u64_base36(&mut out, unix_now_millis());
    push_random_base36(&mut out, 4);
    out
}
