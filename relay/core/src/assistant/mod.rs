//! Assistant Process Orchestration
//!
//! One conversational turn is one bounded run of an external assistant
//! command. The [`Assistant`] trait is the seam; [`CliAssistant`] is the
//! subprocess implementation.
//!
//! # Failure Kinds
//!
//! A turn either produces an [`AssistantReply`] or one of the
//! [`AssistantError`] kinds. Each kind has its own user-facing message
//! ([`AssistantError::user_message`]), so the router never has to look at
//! raw diagnostics.
//!
//! # Continuation Ids
//!
//! The tool reports the id of the conversation it resumed or started on its
//! diagnostic stream. Extraction is best-effort pattern matching: the
//! patterns come from configuration and are tried in order, and finding
//! nothing is normal.

mod cli;

pub use cli::CliAssistant;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use thiserror::Error;

/// Characters of diagnostic output kept in a generic failure
pub const MAX_ERROR_DETAIL: usize = 500;

/// One turn to submit to the assistant
#[derive(Clone, Debug)]
pub struct AssistantRequest {
    /// The user's text
    pub message: String,
    /// Conversation to resume, if any
    pub continuation_id: Option<String>,
    /// Directory the assistant runs in
    pub working_dir: PathBuf,
    /// Context placed before the user's text
    pub preamble: Option<String>,
}

impl AssistantRequest {
    /// Create a request for a fresh conversation
    pub fn new(message: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            message: message.into(),
            continuation_id: None,
            working_dir: working_dir.into(),
            preamble: None,
        }
    }

    /// Resume an earlier conversation
    #[must_use]
    pub fn with_continuation(mut self, continuation_id: Option<String>) -> Self {
        self.continuation_id = continuation_id;
        self
    }

    /// Set the context preamble
    #[must_use]
    pub fn with_preamble(mut self, preamble: Option<String>) -> Self {
        self.preamble = preamble;
        self
    }

    /// The text written to the assistant's input
    #[must_use]
    pub fn compose_prompt(&self) -> String {
        match self.preamble.as_deref() {
            Some(preamble) => format!("{preamble}\n\nUser: {}", self.message),
            None => self.message.clone(),
        }
    }
}

/// A successful turn
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssistantReply {
    /// Primary output, trimmed
    pub text: String,
    /// Continuation id reported by the tool, if found
    pub continuation_id: Option<String>,
    /// Process exit code
    pub exit_code: i32,
}

/// Ways a turn can fail
#[derive(Debug, Error)]
pub enum AssistantError {
    /// The call exceeded its deadline; the process was killed
    #[error("Assistant timed out after {after:?}")]
    Timeout {
        /// The deadline that elapsed
        after: Duration,
    },

    /// The tool stopped at an interactive permission prompt
    #[error("Assistant requires a permission prompt")]
    PermissionRequired,

    /// The tool reported a rate limit
    #[error("Assistant is rate limited")]
    RateLimited,

    /// Any other non-zero exit, with the head of its diagnostics
    #[error("Assistant failed: {0}")]
    Generic(String),

    /// The process could not be started
    #[error("Failed to start assistant: {0}")]
    Spawn(#[source] std::io::Error),

    /// Talking to the running process failed
    #[error("Assistant I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AssistantError {
    /// The chat reply shown for this failure
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Timeout { .. } => "Request timed out. Try a simpler question.".to_string(),
            Self::PermissionRequired => "Permission prompt required. Use `/new` to start a fresh \
                 session, or enable permission bypass in the relay configuration."
                .to_string(),
            Self::RateLimited => "Rate limited. Please wait a moment and try again.".to_string(),
            Self::Generic(detail) => format!("Error from assistant: {detail}"),
            Self::Spawn(_) | Self::Io(_) => {
                "The assistant could not be run. Check the relay logs.".to_string()
            }
        }
    }
}

/// Classify the diagnostics of a failed run
///
/// "permission" wins over "rate limit"; anything else is generic.
#[must_use]
pub fn classify_failure(stderr: &str, exit_code: Option<i32>) -> AssistantError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("permission") {
        return AssistantError::PermissionRequired;
    }
    if lowered.contains("rate limit") {
        return AssistantError::RateLimited;
    }

    let detail: String = stderr.trim().chars().take(MAX_ERROR_DETAIL).collect();
    if detail.is_empty() {
        return AssistantError::Generic(match exit_code {
            Some(code) => format!("exited with status {code}"),
            None => "terminated by signal".to_string(),
        });
    }
    AssistantError::Generic(detail)
}

/// Ordered set of patterns that find a continuation id in diagnostic text
#[derive(Clone, Debug)]
pub struct ContinuationExtractor {
    patterns: Vec<Regex>,
}

impl ContinuationExtractor {
    /// Compile patterns, case-insensitively; capture group 1 is the id
    ///
    /// # Errors
    ///
    /// Returns the first pattern that fails to compile.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| RegexBuilder::new(p.as_ref()).case_insensitive(true).build())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// First id found by the first matching pattern
    #[must_use]
    pub fn extract(&self, text: &str) -> Option<String> {
        self.patterns.iter().find_map(|re| {
            re.captures(text)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
        })
    }
}

/// An assistant backend
#[async_trait]
pub trait Assistant: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Run one turn
    async fn send(&self, request: &AssistantRequest) -> Result<AssistantReply, AssistantError>;

    /// Whether the backend is usable
    async fn health_check(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CONTINUATION_PATTERNS;

    fn extractor() -> ContinuationExtractor {
        ContinuationExtractor::new(DEFAULT_CONTINUATION_PATTERNS.as_slice()).unwrap()
    }

    #[test]
    fn test_compose_prompt() {
        let request = AssistantRequest::new("hello", "/tmp");
        assert_eq!(request.compose_prompt(), "hello");

        let request = request.with_preamble(Some("You run on relay.".into()));
        assert_eq!(request.compose_prompt(), "You run on relay.\n\nUser: hello");
    }

    #[test]
    fn test_extract_session_forms() {
        let extractor = extractor();
        assert_eq!(extractor.extract("Session: abc123").as_deref(), Some("abc123"));
        assert_eq!(extractor.extract("session_id: x-y_z9").as_deref(), Some("x-y_z9"));
        assert_eq!(extractor.extract("SESSION ID abc123de").as_deref(), Some("abc123de"));
        assert_eq!(extractor.extract("Resuming 7f3e2a").as_deref(), Some("7f3e2a"));
        assert_eq!(extractor.extract("nothing useful here"), None);
        assert_eq!(extractor.extract(""), None);
    }

    #[test]
    fn test_extract_pattern_order_wins() {
        let text = "resuming first\nsession: second";
        assert_eq!(extractor().extract(text).as_deref(), Some("second"));

        let swapped = [DEFAULT_CONTINUATION_PATTERNS[1], DEFAULT_CONTINUATION_PATTERNS[0]];
        let reversed = ContinuationExtractor::new(swapped.as_slice()).unwrap();
        assert_eq!(reversed.extract(text).as_deref(), Some("first"));
    }

    #[test]
    fn test_classify_priority() {
        assert!(matches!(
            classify_failure("Rate limit hit; permission denied", Some(1)),
            AssistantError::PermissionRequired
        ));
        assert!(matches!(
            classify_failure("API Rate Limit exceeded", Some(1)),
            AssistantError::RateLimited
        ));
        match classify_failure(&"e".repeat(900), Some(2)) {
            AssistantError::Generic(detail) => assert_eq!(detail.len(), MAX_ERROR_DETAIL),
            other => panic!("unexpected {other:?}"),
        }
        match classify_failure("", Some(3)) {
            AssistantError::Generic(detail) => assert_eq!(detail, "exited with status 3"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_user_messages_distinct() {
        let messages = [
            AssistantError::Timeout { after: Duration::from_secs(1) }.user_message(),
            AssistantError::PermissionRequired.user_message(),
            AssistantError::RateLimited.user_message(),
            AssistantError::Generic("boom".into()).user_message(),
        ];
        for (i, a) in messages.iter().enumerate() {
            for b in &messages[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(messages[0].contains("timed out"));
        assert!(messages[3].ends_with("boom"));
    }
}
