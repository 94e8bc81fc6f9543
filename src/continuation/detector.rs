use std::sync::LazyLock;

use memchr::{memchr_iter, memmem};

/// Completion marker the model is asked to end with.
pub const DEFAULT_COMPLETION_MARKER: &str = "<built>";

/// Lines longer than this without closing punctuation look cut off.
const ABRUPT_LINE_MIN_CHARS: usize = 50;
/// Tolerated surplus of `{` over `}` before flagging truncation.
const BRACE_SURPLUS_ALLOWANCE: usize = 3;

static FENCE_FINDER: LazyLock<memmem::Finder<'static>> =
    LazyLock::new(|| memmem::Finder::new(b"```"));

/// Per-round completion assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionVerdict {
    pub has_marker: bool,
    pub is_truncated: bool,
}

/// True iff the trimmed text ends with `marker`.
#[must_use]
pub fn has_completion_marker(text: &str, marker: &str) -> bool {
    text.trim().ends_with(marker)
}

/// Structural truncation heuristics over the trimmed text. First match wins:
/// unbalanced code fences, a large surplus of open braces, or a long last line
/// with no closing punctuation.
#[must_use]
pub fn is_truncated(text: &str) -> bool {
    let trimmed = text.trim();
    let bytes = trimmed.as_bytes();

    if FENCE_FINDER.find_iter(bytes).count() % 2 != 0 {
        return true;
    }

    let open_braces = memchr_iter(b'{', bytes).count();
    let close_braces = memchr_iter(b'}', bytes).count();
    if open_braces > close_braces + BRACE_SURPLUS_ALLOWANCE {
        return true;
    }

    let last_line = trimmed.rsplit('\n').next().unwrap_or(trimmed);
    last_line.chars().count() > ABRUPT_LINE_MIN_CHARS
        && !last_line.ends_with(['.', '!', '?', ';', ':', ',', '}', ')', ']'])
        && !last_line.contains("```")
}

/// Assess one round's full text.
#[must_use]
pub fn verdict(text: &str, marker: &str) -> CompletionVerdict {
    CompletionVerdict {
        has_marker: has_completion_marker(text, marker),
        is_truncated: is_truncated(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_at_end() {
        assert!(has_completion_marker("Hi there<built>", "<built>"));
        assert!(has_completion_marker("Done.\n<built>\n\n  ", "<built>"));
    }

    #[test]
    fn test_marker_not_at_end() {
        assert!(!has_completion_marker("<built> and then more", "<built>"));
        assert!(!has_completion_marker("", "<built>"));
        assert!(!has_completion_marker("almost <built", "<built>"));
    }

    #[test]
    fn test_custom_marker() {
        assert!(has_completion_marker("ok [[done]]", "[[done]]"));
        assert!(!has_completion_marker("ok <built>", "[[done]]"));
    }

    #[test]
    fn test_odd_fence_count_is_truncated() {
        assert!(is_truncated("Here you go:\n```rust\nfn main() {}"));
        assert!(!is_truncated("Here you go:\n```rust\nfn main() {}\n```"));
    }

    #[test]
    fn test_fences_counted_without_overlap() {
        // Six backticks in a row are two fences.
        assert!(!is_truncated("``````"));
        // Four backticks are one fence plus a stray backtick.
        assert!(is_truncated("````"));
    }

    #[test]
    fn test_brace_surplus() {
        assert!(!is_truncated("{{{ }"));
        assert!(is_truncated("{{{{{ }"));
        assert!(!is_truncated("{{{{ }"));
    }

    #[test]
    fn test_long_unpunctuated_last_line() {
        let line = "this sentence keeps going and going without any closing mark";
        assert!(line.chars().count() > 50);
        assert!(is_truncated(&format!("intro\n{line}")));
        assert!(!is_truncated(&format!("intro\n{line}.")));
        assert!(!is_truncated(&format!("intro\n{line})")));
    }

    #[test]
    fn test_long_line_with_fence_not_truncated() {
        let line = "some words before a fence ``` and more words after it, no dot";
        assert!(!is_truncated(&format!("```\n{line}")));
    }

    #[test]
    fn test_short_unpunctuated_line_not_truncated() {
        assert!(!is_truncated("Hello there"));
        assert!(!is_truncated(""));
    }

    #[test]
    fn test_trailing_whitespace_is_ignored() {
        let line = "this sentence keeps going and going and ends with a dot.";
        assert!(!is_truncated(&format!("{line}\n\n   \n")));
    }

    #[test]
    fn test_verdict_combines_both() {
        let v = verdict("```js\nconst x = 1;\n```\n<built>", "<built>");
        assert_eq!(
            v,
            CompletionVerdict {
                has_marker: true,
                is_truncated: false,
            }
        );
    }
}
