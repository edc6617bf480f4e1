//! Transport Traits
//!
//! The relay talks to the messaging protocol only through [`ChatTransport`].
//! Sync, wire formats and cryptography live behind it.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::events::{InboundEvent, UndecryptableEvent};

/// A device belonging to a remote user, with its local trust state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device id
    pub device_id: String,
    /// Whether this device is marked verified in the local trust store
    pub verified: bool,
}

impl DeviceInfo {
    /// Create a device entry
    pub fn new(device_id: impl Into<String>, verified: bool) -> Self {
        Self {
            device_id: device_id.into(),
            verified,
        }
    }
}

/// Errors that can occur during transport operations
#[derive(Debug)]
pub enum TransportError {
    /// Connection to the homeserver failed
    ConnectionFailed(String),
    /// Connection was closed
    ConnectionClosed,
    /// Failed to send
    SendFailed(String),
    /// The homeserver rejected our credentials
    AuthenticationFailed(String),
    /// Response could not be understood
    SerializationError(String),
    /// The transport cannot perform this operation
    Unsupported(String),
    /// Transport not in expected state
    InvalidState(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::AuthenticationFailed(msg) => write!(f, "Authentication failed: {msg}"),
            Self::SerializationError(msg) => write!(f, "Serialization error: {msg}"),
            Self::Unsupported(msg) => write!(f, "Unsupported: {msg}"),
            Self::InvalidState(msg) => write!(f, "Invalid state: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::SerializationError(err.to_string())
        } else {
            Self::ConnectionFailed(err.to_string())
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Everything the relay needs from the messaging protocol
///
/// Implementations handle sync, encryption and wire formats. Device trust is
/// local state owned by the transport's device store; the relay only reads it
/// and marks devices verified.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// The bot's own user id
    fn user_id(&self) -> &str;

    /// Wait for the next batch of events
    async fn poll_events(&self) -> Result<Vec<InboundEvent>, TransportError>;

    /// Join a room
    async fn join_room(&self, room_id: &str) -> Result<(), TransportError>;

    /// Send a text message with a rendered hypertext alternative
    async fn send_message(&self, room_id: &str, body: &str, html: &str)
        -> Result<(), TransportError>;

    /// Set or clear the typing indicator
    async fn set_typing(
        &self,
        room_id: &str,
        typing: bool,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Users currently joined to a room
    async fn joined_members(&self, room_id: &str) -> Result<Vec<String>, TransportError>;

    /// Known devices of a user
    async fn user_devices(&self, user_id: &str) -> Result<Vec<DeviceInfo>, TransportError>;

    /// Mark a device verified in the local trust store
    async fn verify_device(&self, user_id: &str, device_id: &str) -> Result<(), TransportError>;

    /// Ask the sender's devices to re-share the key for a failed event
    async fn request_room_key(&self, event: &UndecryptableEvent) -> Result<(), TransportError>;
}
