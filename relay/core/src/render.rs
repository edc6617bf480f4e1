//! Message Rendering
//!
//! Outbound text is sent twice: as the plain body and as a hypertext
//! alternative produced by [`markdown_to_html`]. The conversion is a fixed,
//! order-sensitive substitution chain over a small markdown subset and does
//! not escape its input.

use once_cell::sync::Lazy;
use regex::Regex;

static BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*(.+?)\*\*").expect("valid regex"));
static ITALIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*(.+?)\*").expect("valid regex"));
static CODE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(\w+)?\n(.*?)```").expect("valid regex"));
static INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`(.+?)`").expect("valid regex"));

/// A reply ready to hand to the send path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    /// Plain-text body
    pub body: String,
}

impl Reply {
    /// Wrap a plain-text body
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }

    /// The hypertext alternative of the body
    #[must_use]
    pub fn html(&self) -> String {
        markdown_to_html(&self.body)
    }
}

impl From<String> for Reply {
    fn from(body: String) -> Self {
        Self::new(body)
    }
}

impl From<&str> for Reply {
    fn from(body: &str) -> Self {
        Self::new(body)
    }
}

/// Convert bold, italic, fenced code, inline code and line breaks, in that order
#[must_use]
pub fn markdown_to_html(text: &str) -> String {
    let text = BOLD.replace_all(text, "<strong>${1}</strong>");
    let text = ITALIC.replace_all(&text, "<em>${1}</em>");
    let text = CODE_BLOCK.replace_all(&text, "<pre><code>${2}</code></pre>");
    let text = INLINE_CODE.replace_all(&text, "<code>${1}</code>");
    text.replace('\n', "<br>")
}

/// Cut `text` to at most `max_chars` characters, ending with `suffix` when cut
///
/// Text at or under the limit is returned unchanged. Counts characters, not
/// bytes, so multi-byte text is never split inside a code point.
#[must_use]
pub fn truncate_response(text: &str, max_chars: usize, suffix: &str) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(suffix.chars().count());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(suffix);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_inline_markup() {
        assert_eq!(
            markdown_to_html("**bold** and *it* and `code`"),
            "<strong>bold</strong> and <em>it</em> and <code>code</code>"
        );
    }

    #[test]
    fn test_code_block_and_breaks() {
        assert_eq!(
            markdown_to_html("run:\n```sh\nls -la\n```"),
            "run:<br><pre><code>ls -la<br></code></pre>"
        );
    }

    #[test]
    fn test_no_escaping() {
        assert_eq!(markdown_to_html("a < b & c"), "a < b & c");
    }

    #[test]
    fn test_truncate_exact_length() {
        let suffix = "... [Response truncated]";
        let text = "x".repeat(5000);
        let cut = truncate_response(&text, 4000, suffix);
        assert_eq!(cut.chars().count(), 4000);
        assert!(cut.ends_with(suffix));
    }

    #[test]
    fn test_truncate_passthrough_at_limit() {
        let text = "y".repeat(4000);
        assert_eq!(truncate_response(&text, 4000, "..."), text);
        assert_eq!(truncate_response("short", 4000, "..."), "short");
    }

    #[test]
    fn test_truncate_counts_chars() {
        let text = "é".repeat(20);
        let cut = truncate_response(&text, 10, "…");
        assert_eq!(cut.chars().count(), 10);
        assert!(cut.ends_with('…'));
    }
}
