//! Inbound Events
//!
//! Events the transport delivers to the relay. Each one carries the sender,
//! a read-only [`RoomView`] of the room it happened in, and the origin
//! timestamp reported by the homeserver.
//!
//! The relay never interprets the wire format; transports translate whatever
//! they receive into these types.

use serde::{Deserialize, Serialize};

/// Read-only projection of a room, supplied by the transport
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomView {
    /// Room id
    pub room_id: String,
    /// Whether the room is end-to-end encrypted
    pub encrypted: bool,
    /// Joined members as known to the transport
    pub members: Vec<String>,
}

impl RoomView {
    /// An unencrypted room with no known members
    pub fn plain(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            encrypted: false,
            members: Vec::new(),
        }
    }

    /// An encrypted room with the given members
    pub fn encrypted(room_id: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            room_id: room_id.into(),
            encrypted: true,
            members,
        }
    }
}

/// A plain-text message
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TextMessage {
    /// Room the message was sent in
    pub room: RoomView,
    /// Sender user id
    pub sender: String,
    /// Event id assigned by the homeserver
    pub event_id: String,
    /// Message body
    pub body: String,
    /// Origin timestamp (Unix ms)
    pub timestamp: u64,
}

/// An invitation to join a room
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomInvite {
    /// Room the bot was invited to
    pub room: RoomView,
    /// Who sent the invite
    pub sender: String,
    /// Who was invited
    pub invitee: String,
    /// Origin timestamp (Unix ms)
    pub timestamp: u64,
}

/// An encrypted message the transport could not decrypt
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UndecryptableEvent {
    /// Room the message was sent in
    pub room: RoomView,
    /// Sender user id
    pub sender: String,
    /// Event id assigned by the homeserver
    pub event_id: String,
    /// Megolm session the payload was encrypted with
    pub session_id: String,
    /// Curve25519 key of the sending device
    pub sender_key: String,
    /// Encryption algorithm named by the event
    pub algorithm: String,
    /// Origin timestamp (Unix ms)
    pub timestamp: u64,
}

/// Kind of an inbound event, used as the handler registry key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// [`InboundEvent::Message`]
    Message,
    /// [`InboundEvent::Invite`]
    Invite,
    /// [`InboundEvent::Undecryptable`]
    Undecryptable,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message => write!(f, "message"),
            Self::Invite => write!(f, "invite"),
            Self::Undecryptable => write!(f, "undecryptable"),
        }
    }
}

/// Events from the transport to the relay
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum InboundEvent {
    /// A decrypted or plain text message
    Message(TextMessage),
    /// A room invitation
    Invite(RoomInvite),
    /// An encrypted message that failed to decrypt
    Undecryptable(UndecryptableEvent),
}

impl InboundEvent {
    /// Registry key for this event
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Message(_) => EventKind::Message,
            Self::Invite(_) => EventKind::Invite,
            Self::Undecryptable(_) => EventKind::Undecryptable,
        }
    }

    /// Sender user id
    #[must_use]
    pub fn sender(&self) -> &str {
        match self {
            Self::Message(m) => &m.sender,
            Self::Invite(i) => &i.sender,
            Self::Undecryptable(u) => &u.sender,
        }
    }

    /// The room the event happened in
    #[must_use]
    pub fn room(&self) -> &RoomView {
        match self {
            Self::Message(m) => &m.room,
            Self::Invite(i) => &i.room,
            Self::Undecryptable(u) => &u.room,
        }
    }

    /// Origin timestamp (Unix ms)
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        match self {
            Self::Message(m) => m.timestamp,
            Self::Invite(i) => i.timestamp,
            Self::Undecryptable(u) => u.timestamp,
        }
    }

    /// Convenience constructor for a text message
    pub fn message(room: RoomView, sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self::Message(TextMessage {
            room,
            sender: sender.into(),
            event_id: new_event_id(),
            body: body.into(),
            timestamp: now_ms(),
        })
    }

    /// Convenience constructor for an invite
    pub fn invite(room: RoomView, sender: impl Into<String>, invitee: impl Into<String>) -> Self {
        Self::Invite(RoomInvite {
            room,
            sender: sender.into(),
            invitee: invitee.into(),
            timestamp: now_ms(),
        })
    }

    /// Convenience constructor for an undecryptable message
    pub fn undecryptable(room: RoomView, sender: impl Into<String>) -> Self {
        Self::Undecryptable(UndecryptableEvent {
            room,
            sender: sender.into(),
            event_id: new_event_id(),
            session_id: format!("megolm-{}", uuid::Uuid::new_v4().simple()),
            sender_key: String::new(),
            algorithm: "m.megolm.v1.aes-sha2".to_string(),
            timestamp: now_ms(),
        })
    }
}

fn new_event_id() -> String {
    format!("${}", uuid::Uuid::new_v4().simple())
}

/// Current Unix time in milliseconds
#[must_use]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let room = RoomView::encrypted("!r:x", vec!["@a:x".into()]);
        let event = InboundEvent::undecryptable(room.clone(), "@a:x");
        assert_eq!(event.kind(), EventKind::Undecryptable);
        assert_eq!(event.sender(), "@a:x");
        assert_eq!(event.room(), &room);
        assert!(event.timestamp() > 0);

        let event = InboundEvent::message(RoomView::plain("!r:x"), "@b:x", "hi");
        assert_eq!(event.kind(), EventKind::Message);
        assert!(!event.room().encrypted);
    }
}
