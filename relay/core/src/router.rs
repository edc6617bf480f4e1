//! Command Router
//!
//! Turns one accepted message into one [`Reply`].
//!
//! Text starting with `/` is a command: the first whitespace-delimited token
//! (case-insensitive) picks the handler and the rest is its argument. All
//! other text is a conversational turn for the assistant.
//!
//! | Command | Effect |
//! |---------|--------|
//! | `/new` | reset the sender's session |
//! | `/status` | session and encryption summary (read-only) |
//! | `/cd <path>` | change the working directory if it exists |
//! | `/trust` | verify all of the sender's devices |
//! | `/help` | command summary |
//!
//! Session store failures never escape: they are logged and the user gets a
//! generic error reply.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn, Span};

use crate::assistant::{Assistant, AssistantRequest};
use crate::config::{expand_tilde, RelayConfig};
use crate::events::RoomView;
use crate::render::{truncate_response, Reply};
use crate::session::{MessageRole, Session, SessionStore, StoreError};
use crate::transport::ChatTransport;
use crate::trust::TrustManager;

/// Reply when the session store fails mid-request
pub const STORE_ERROR_REPLY: &str =
    "Something went wrong while handling your message. Please try again.";

/// Reply when the assistant produced no output
pub const EMPTY_RESPONSE_REPLY: &str = "No response from the assistant.";

const HELP_TEXT: &str = "**Relay Commands**
- `/new` - Start a fresh session (clear context)
- `/status` - Show session info and encryption status
- `/cd <path>` - Change working directory
- `/trust` - Trust all your devices for encrypted rooms
- `/help` - Show this help message

Send any other message to talk to the assistant.";

/// A parsed slash command
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// `/new`
    New,
    /// `/status`
    Status,
    /// `/cd <path>`; the argument may be empty
    Cd(String),
    /// `/trust`
    Trust,
    /// `/help`
    Help,
    /// Anything else, lowercased
    Unknown(String),
}

impl Command {
    /// Parse `text` as a command; `None` when it is free text
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if !text.starts_with('/') {
            return None;
        }
        let (head, args) = match text.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (text, ""),
        };
        Some(match head.to_lowercase().as_str() {
            "/new" => Self::New,
            "/status" => Self::Status,
            "/cd" => Self::Cd(args.to_string()),
            "/trust" => Self::Trust,
            "/help" => Self::Help,
            other => Self::Unknown(other.to_string()),
        })
    }
}

/// Router settings taken from configuration
#[derive(Clone, Debug)]
pub struct RouterSettings {
    /// Working directory for new sessions
    pub default_working_dir: PathBuf,
    /// Rendered context preamble
    pub preamble: Option<String>,
    /// Maximum characters of assistant output shown
    pub max_response_length: usize,
    /// Suffix for cut responses
    pub truncation_suffix: String,
    /// How long the typing indicator may linger if never cleared
    pub typing_timeout: Duration,
}

impl RouterSettings {
    /// Extract router settings from the relay configuration
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            default_working_dir: config.default_working_dir.clone(),
            preamble: config.rendered_preamble(),
            max_response_length: config.max_response_length,
            truncation_suffix: config.truncation_suffix.clone(),
            typing_timeout: Duration::from_secs(30),
        }
    }
}

/// Typing indicator held for the duration of an assistant call
///
/// [`TypingGuard::release`] clears it; if the guard is dropped without
/// release (cancellation, panic) the clear is spawned instead.
struct TypingGuard {
    transport: Arc<dyn ChatTransport>,
    room_id: String,
    active: bool,
    span: Span,
}

impl TypingGuard {
    async fn start(
        transport: Arc<dyn ChatTransport>,
        room_id: &str,
        timeout: Duration,
        span: Span,
    ) -> Self {
        if let Err(e) = transport.set_typing(room_id, true, timeout).await {
            warn!(parent: &span, room = %room_id, error = %e, "Failed to set typing indicator");
        }
        Self {
            transport,
            room_id: room_id.to_string(),
            active: true,
            span,
        }
    }

    async fn release(mut self) {
        self.active = false;
        if let Err(e) = self
            .transport
            .set_typing(&self.room_id, false, Duration::ZERO)
            .await
        {
            warn!(parent: &self.span, room = %self.room_id, error = %e, "Failed to clear typing indicator");
        }
    }
}

impl Drop for TypingGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let transport = Arc::clone(&self.transport);
            let room_id = std::mem::take(&mut self.room_id);
            handle.spawn(async move {
                let _ = transport.set_typing(&room_id, false, Duration::ZERO).await;
            });
        }
    }
}

/// Routes accepted messages to command handlers or the assistant
pub struct CommandRouter {
    store: Arc<dyn SessionStore>,
    assistant: Arc<dyn Assistant>,
    trust: Arc<TrustManager>,
    transport: Arc<dyn ChatTransport>,
    settings: RouterSettings,
    span: Span,
}

impl CommandRouter {
    /// Create a router
    pub fn new(
        store: Arc<dyn SessionStore>,
        assistant: Arc<dyn Assistant>,
        trust: Arc<TrustManager>,
        transport: Arc<dyn ChatTransport>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            store,
            assistant,
            trust,
            transport,
            settings,
            span: Span::none(),
        }
    }

    /// Attach the span routing is logged under
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Handle one accepted message from `sender` in `room`
    pub async fn route(&self, room: &RoomView, sender: &str, text: &str) -> Reply {
        let text = text.trim();
        let result = match Command::parse(text) {
            Some(command) => self.handle_command(room, sender, command).await,
            None => self.converse(room, sender, text).await,
        };
        result.unwrap_or_else(|e| {
            error!(parent: &self.span, user = %sender, error = %e, "Session store failure");
            Reply::new(STORE_ERROR_REPLY)
        })
    }

    async fn handle_command(
        &self,
        room: &RoomView,
        sender: &str,
        command: Command,
    ) -> Result<Reply, StoreError> {
        info!(parent: &self.span, user = %sender, command = ?command, "Handling command");
        match command {
            Command::New => {
                self.session(sender).await?;
                self.store.reset(sender).await?;
                Ok(Reply::new("Session reset. Starting fresh context."))
            }
            Command::Status => self.status(room, sender).await,
            Command::Cd(args) => self.change_dir(sender, &args).await,
            Command::Trust => {
                self.session(sender).await?;
                Ok(Reply::new(match self.trust.trust_all_devices_of(sender).await {
                    Ok(0) => "All your devices are already trusted.".to_string(),
                    Ok(n) => format!("Trusted {n} new device(s) for your account."),
                    Err(e) => {
                        warn!(parent: &self.span, user = %sender, error = %e, "Trust update failed");
                        format!("Could not update device trust: {e}")
                    }
                }))
            }
            Command::Help => {
                self.session(sender).await?;
                Ok(Reply::new(HELP_TEXT))
            }
            Command::Unknown(token) => Ok(Reply::new(format!(
                "Unknown command: `{token}`. Use `/help` for available commands."
            ))),
        }
    }

    async fn session(&self, sender: &str) -> Result<Session, StoreError> {
        self.store
            .get_or_create(sender, &self.settings.default_working_dir)
            .await
    }

    async fn status(&self, room: &RoomView, sender: &str) -> Result<Reply, StoreError> {
        let mut status = String::from("**Session Status**\n");
        match self.store.get(sender).await? {
            Some(session) => {
                match session.continuation_prefix() {
                    Some(prefix) => status.push_str(&format!("- Session ID: `{prefix}...`\n")),
                    None => status.push_str("- Session ID: none (next message starts one)\n"),
                }
                status.push_str(&format!(
                    "- Working Dir: `{}`\n",
                    session.working_dir.display()
                ));
                status.push_str(&format!(
                    "- Last Active: {}\n",
                    session.last_active.format("%Y-%m-%d %H:%M:%S UTC")
                ));
                status.push_str(&format!("- Messages: {}\n", session.message_count));
            }
            None => status.push_str("- No active session (send any message to start)\n"),
        }

        status.push_str("\n**Encryption**\n");
        status.push_str(&format!(
            "- Room Encrypted: {}\n",
            if room.encrypted { "Yes" } else { "No" }
        ));
        if room.encrypted {
            match self.trust.device_summary(sender).await {
                Ok((verified, total)) => {
                    status.push_str(&format!("- Your Verified Devices: {verified}/{total}"));
                }
                Err(e) => {
                    warn!(parent: &self.span, user = %sender, error = %e, "Device query failed");
                    status.push_str("- Your Verified Devices: unknown");
                }
            }
        }
        Ok(Reply::new(status.trim_end()))
    }

    async fn change_dir(&self, sender: &str, args: &str) -> Result<Reply, StoreError> {
        if args.is_empty() {
            return Ok(Reply::new("Usage: `/cd <path>`"));
        }

        let session = self.session(sender).await?;
        let target = resolve_dir(&session.working_dir, args);
        let is_dir = tokio::fs::metadata(&target)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Ok(Reply::new(format!("Directory not found: `{args}`")));
        }

        self.store.update_working_dir(sender, &target).await?;
        info!(parent: &self.span, user = %sender, dir = %target.display(), "Working directory changed");
        Ok(Reply::new(format!(
            "Working directory changed to: `{}`",
            target.display()
        )))
    }

    async fn converse(&self, room: &RoomView, sender: &str, text: &str) -> Result<Reply, StoreError> {
        let session = self.session(sender).await?;
        self.audit(sender, MessageRole::User, text).await;

        let request = AssistantRequest::new(text, session.working_dir.clone())
            .with_continuation(session.continuation_id.clone())
            .with_preamble(self.settings.preamble.clone());

        let typing = TypingGuard::start(
            Arc::clone(&self.transport),
            &room.room_id,
            self.settings.typing_timeout,
            self.span.clone(),
        )
        .await;
        let outcome = self.assistant.send(&request).await;
        typing.release().await;

        let reply = match outcome {
            Ok(reply) => reply,
            Err(e) => {
                warn!(parent: &self.span, user = %sender, assistant = %self.assistant.name(), error = %e, "Assistant turn failed");
                return Ok(Reply::new(e.user_message()));
            }
        };

        if let Some(id) = reply.continuation_id.as_deref() {
            if session.continuation_id.as_deref() != Some(id) {
                self.store.update_continuation_id(sender, id).await?;
            }
        }
        self.store.increment_message_count(sender).await?;
        self.audit(sender, MessageRole::Assistant, &reply.text).await;

        if reply.text.is_empty() {
            return Ok(Reply::new(EMPTY_RESPONSE_REPLY));
        }
        Ok(Reply::new(truncate_response(
            &reply.text,
            self.settings.max_response_length,
            &self.settings.truncation_suffix,
        )))
    }

    async fn audit(&self, sender: &str, role: MessageRole, content: &str) {
        if let Err(e) = self.store.add_history(sender, role, content).await {
            warn!(parent: &self.span, user = %sender, error = %e, "Failed to append history");
        }
    }
}

/// Absolute, lexically normalized form of a `/cd` argument
fn resolve_dir(current: &Path, arg: &str) -> PathBuf {
    let expanded = expand_tilde(arg);
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        current.join(expanded)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
