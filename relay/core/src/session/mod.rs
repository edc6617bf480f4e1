//! Session Management
//!
//! One [`Session`] per user identity, holding the assistant continuation id,
//! the working directory and activity bookkeeping. Sessions are created on a
//! user's first interaction and never deleted; [`SessionStore::reset`] and the
//! idle sweep only clear the continuation.
//!
//! Alongside sessions the store keeps an append-only audit log of
//! [`HistoryRecord`]s. The live pipeline only ever appends to it.
//!
//! # Concurrency
//!
//! Operations on the same user identity are linearizable. Operations on
//! different identities never wait on each other.

mod store;
mod sweep;

pub use store::SqliteSessionStore;
pub use sweep::spawn_idle_sweeper;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum characters of content kept per history record
pub const MAX_HISTORY_CONTENT: usize = 10_000;

/// Per-user conversation state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// User identity (unique key)
    pub user_id: String,
    /// Assistant continuation id, if a conversation is in progress
    pub continuation_id: Option<String>,
    /// Working directory for assistant calls
    pub working_dir: PathBuf,
    /// Last interaction
    pub last_active: DateTime<Utc>,
    /// First interaction
    pub created_at: DateTime<Utc>,
    /// Successful assistant turns since the last reset
    pub message_count: u32,
}

impl Session {
    /// First eight characters of the continuation id
    #[must_use]
    pub fn continuation_prefix(&self) -> Option<&str> {
        self.continuation_id.as_deref().map(|id| {
            let end = id.char_indices().nth(8).map_or(id.len(), |(i, _)| i);
            &id[..end]
        })
    }
}

/// Role of an audit log entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Text sent by the user
    User,
    /// Text returned by the assistant
    Assistant,
}

impl MessageRole {
    /// Stored tag
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// One audit log entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// User identity
    pub user_id: String,
    /// Who produced the content
    pub role: MessageRole,
    /// Content, capped at [`MAX_HISTORY_CONTENT`] characters
    pub content: String,
    /// When the entry was appended
    pub timestamp: DateTime<Utc>,
}

/// Aggregate counters over all sessions
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Session records
    pub total_sessions: u64,
    /// Sessions holding a continuation id
    pub active_sessions: u64,
    /// Sum of message counts
    pub total_messages: u64,
}

/// Session store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not complete the operation
    #[error("Session store unavailable: {0}")]
    Unavailable(String),

    /// The operation needs an existing session
    #[error("No session for {0}")]
    NotFound(String),

    /// A working directory must be a non-empty absolute path
    #[error("Invalid working directory: {}", .0.display())]
    InvalidPath(PathBuf),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Durable keyed storage of [`Session`]s
///
/// Every mutation bumps `last_active`, which never moves backwards. All
/// effects are durable when the call returns.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Look up a session without touching it
    async fn get(&self, user_id: &str) -> Result<Option<Session>, StoreError>;

    /// Return the existing session (bumped) or create one in `default_dir`
    async fn get_or_create(&self, user_id: &str, default_dir: &Path)
        -> Result<Session, StoreError>;

    /// Record the assistant's continuation id
    async fn update_continuation_id(
        &self,
        user_id: &str,
        continuation_id: &str,
    ) -> Result<(), StoreError>;

    /// Change the working directory
    async fn update_working_dir(&self, user_id: &str, dir: &Path) -> Result<(), StoreError>;

    /// Count one completed assistant turn
    async fn increment_message_count(&self, user_id: &str) -> Result<(), StoreError>;

    /// Clear the continuation id and message count, keeping the working directory
    async fn reset(&self, user_id: &str) -> Result<(), StoreError>;

    /// Clear continuation ids idle longer than `max_age_hours`; returns how many
    async fn sweep_idle(&self, max_age_hours: u64) -> Result<usize, StoreError>;

    /// Append to the audit log
    async fn add_history(
        &self,
        user_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<(), StoreError>;

    /// Aggregate counters
    async fn stats(&self) -> Result<SessionStats, StoreError>;
}
