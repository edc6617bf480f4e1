//! Access Gate
//!
//! Allow/deny filter applied to every inbound event before anything else
//! looks at it.
//!
//! # Policy
//!
//! - A sender must be on the user allow-list. An empty user list denies
//!   everyone.
//! - A room must be on the room allow-list, unless that list is empty, in
//!   which case every room is accepted.
//!
//! Denials are logged and never answered.

use std::collections::HashSet;

use tracing::{warn, Span};

/// Sender and room allow-lists
#[derive(Clone, Debug)]
pub struct AccessGate {
    allowed_users: HashSet<String>,
    allowed_rooms: HashSet<String>,
    span: Span,
}

impl AccessGate {
    /// Create a gate from the configured lists
    pub fn new<U, R>(allowed_users: U, allowed_rooms: R) -> Self
    where
        U: IntoIterator,
        U::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            allowed_users: allowed_users.into_iter().map(Into::into).collect(),
            allowed_rooms: allowed_rooms.into_iter().map(Into::into).collect(),
            span: Span::none(),
        }
    }

    /// Attach the span denials are logged under
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Whether `sender` may talk to the relay in `room_id`
    pub fn allowed(&self, sender: &str, room_id: &str) -> bool {
        if !self.is_allowed_user(sender) {
            warn!(parent: &self.span, sender = %sender, room = %room_id, "Denied: sender not allow-listed");
            return false;
        }
        if !self.is_allowed_room(room_id) {
            warn!(parent: &self.span, sender = %sender, room = %room_id, "Denied: room not allow-listed");
            return false;
        }
        true
    }

    /// Whether `user_id` is on the user allow-list
    #[must_use]
    pub fn is_allowed_user(&self, user_id: &str) -> bool {
        self.allowed_users.contains(user_id)
    }

    /// Whether `room_id` is accepted by the room allow-list
    #[must_use]
    pub fn is_allowed_room(&self, room_id: &str) -> bool {
        self.allowed_rooms.is_empty() || self.allowed_rooms.contains(room_id)
    }

    /// Allow-listed users, sorted
    #[must_use]
    pub fn allowed_users(&self) -> Vec<String> {
        let mut users: Vec<_> = self.allowed_users.iter().cloned().collect();
        users.sort();
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_room_list_allows_every_room() {
        let gate = AccessGate::new(["@alice:x"], Vec::<String>::new());
        assert!(gate.allowed("@alice:x", "!one:x"));
        assert!(gate.allowed("@alice:x", "!two:x"));
    }

    #[test]
    fn test_room_list_restricts_rooms() {
        let gate = AccessGate::new(["@alice:x"], ["!one:x"]);
        assert!(gate.allowed("@alice:x", "!one:x"));
        assert!(!gate.allowed("@alice:x", "!two:x"));
    }

    #[test]
    fn test_unknown_sender_denied() {
        let gate = AccessGate::new(["@alice:x"], Vec::<String>::new());
        assert!(!gate.allowed("@mallory:x", "!one:x"));
    }

    #[test]
    fn test_empty_user_list_denies_everyone() {
        let gate = AccessGate::new(Vec::<String>::new(), Vec::<String>::new());
        assert!(!gate.allowed("@alice:x", "!one:x"));
        assert!(gate.allowed_users().is_empty());
    }
}
