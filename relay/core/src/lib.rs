//! Relay Core - Chat-to-Assistant Relay Engine
//!
//! This crate holds the message-handling engine of the chat relay: it takes
//! events from a messaging transport, decides who may talk to it, keeps one
//! conversation per user, and runs an external assistant command for every
//! conversational turn.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      ChatTransport (sync)                        │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ InboundEvent
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │  EventDispatcher ── AccessGate ── per-sender lanes               │
//! │        │                                                         │
//! │        ├── MessageHandler ── CommandRouter ──┬── SessionStore    │
//! │        │                                     └── Assistant       │
//! │        ├── InviteHandler                                         │
//! │        └── DecryptFailureHandler                                 │
//! │                                                                  │
//! │  TrustManager ── device trust + encryption-aware send path       │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ send_message(body, html)
//! ┌───────────────────────────────┴──────────────────────────────────┐
//! │                      ChatTransport (send)                        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`access`]: sender and room allow-lists
//! - [`assistant`]: external assistant process orchestration
//! - [`config`]: TOML configuration with env and CLI overrides
//! - [`dispatcher`]: handler registry, filtering and per-sender lanes
//! - [`events`]: inbound event types
//! - [`render`]: markdown subset to hypertext, truncation
//! - [`router`]: slash commands and the assistant pipeline
//! - [`session`]: per-user session persistence
//! - [`transport`]: messaging transport abstraction
//! - [`trust`]: device trust policy and outbound delivery
//!
//! # Logging
//!
//! Components never log through a hidden global context. Each one takes a
//! [`tracing::Span`] through its `with_span` builder and parents every record
//! on it, so the daemon decides the context fields.

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod access;
pub mod assistant;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod keyed_lock;
pub mod render;
pub mod router;
pub mod session;
pub mod transport;
pub mod trust;

pub use access::AccessGate;
pub use assistant::{
    classify_failure, Assistant, AssistantError, AssistantReply, AssistantRequest, CliAssistant,
    ContinuationExtractor,
};
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, RelayConfig,
};
pub use dispatcher::{
    DecryptFailureHandler, EventDispatcher, EventHandler, HandlerRegistry, InviteHandler,
    MessageHandler,
};
pub use error::RelayError;
pub use events::{EventKind, InboundEvent, RoomInvite, RoomView, TextMessage, UndecryptableEvent};
pub use keyed_lock::KeyedMutex;
pub use render::{markdown_to_html, truncate_response, Reply};
pub use router::{Command, CommandRouter, RouterSettings};
pub use session::{
    spawn_idle_sweeper, HistoryRecord, MessageRole, Session, SessionStats, SessionStore,
    SqliteSessionStore, StoreError,
};
pub use transport::{
    ChatTransport, DeviceInfo, InProcessTransport, MatrixHttpTransport, MatrixSdkTransport,
    SentMessage, TransportError,
};
pub use trust::TrustManager;
