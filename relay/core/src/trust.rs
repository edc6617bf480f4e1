//! Encryption Trust Manager
//!
//! Device-trust policy for end-to-end encrypted rooms, and the one outbound
//! send path of the relay.
//!
//! # Policy
//!
//! Trust is only ever granted to devices of allow-listed users:
//!
//! - at startup, every device of every allow-listed user
//! - on `/trust`, every device of the requesting user
//! - before a send into an encrypted room, every device of the joined
//!   members that are allow-listed
//!
//! Members who are not allow-listed stay untrusted. Trust is never revoked
//! here.
//!
//! Per-user trust updates are serialized, so two concurrent passes over the
//! same user never both count a device as newly trusted.

use std::sync::Arc;

use tracing::{debug, error, info, warn, Span};

use crate::access::AccessGate;
use crate::events::{RoomView, UndecryptableEvent};
use crate::keyed_lock::KeyedMutex;
use crate::render::Reply;
use crate::transport::{ChatTransport, TransportError};

/// Notice sent when a message could not be decrypted
pub const DECRYPT_FAILURE_NOTICE: &str = "I couldn't decrypt your message. This may be a \
     session key issue. Try sending your message again, or use `/help` for commands.";

/// Device trust bookkeeping and encryption-aware delivery
pub struct TrustManager {
    transport: Arc<dyn ChatTransport>,
    gate: Arc<AccessGate>,
    locks: KeyedMutex,
    span: Span,
}

impl TrustManager {
    /// Create a manager over `transport`, trusting only users `gate` allows
    pub fn new(transport: Arc<dyn ChatTransport>, gate: Arc<AccessGate>) -> Self {
        Self {
            transport,
            gate,
            locks: KeyedMutex::new(),
            span: Span::none(),
        }
    }

    /// Attach the span trust changes are logged under
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// The bot's own identity
    pub fn bot_user_id(&self) -> &str {
        self.transport.user_id()
    }

    /// Verify every unverified device of `user_id`; returns how many changed
    ///
    /// # Errors
    ///
    /// Propagates transport failures. Devices verified before the failure
    /// stay verified.
    pub async fn trust_all_devices_of(&self, user_id: &str) -> Result<usize, TransportError> {
        let _guard = self.locks.lock(user_id).await;
        let devices = self.transport.user_devices(user_id).await?;

        let mut trusted = 0;
        for device in devices.iter().filter(|d| !d.verified) {
            self.transport.verify_device(user_id, &device.device_id).await?;
            info!(parent: &self.span, user = %user_id, device = %device.device_id, "Trusted device");
            trusted += 1;
        }
        Ok(trusted)
    }

    /// Startup pass over the allow-list; returns the total newly trusted
    pub async fn auto_trust_allowed_users(&self, allowed_users: &[String]) -> usize {
        info!(parent: &self.span, users = allowed_users.len(), "Setting up device trust for allowed users");
        let mut total = 0;
        for user_id in allowed_users {
            match self.trust_all_devices_of(user_id).await {
                Ok(count) => total += count,
                Err(e) => {
                    warn!(parent: &self.span, user = %user_id, error = %e, "Could not trust devices");
                }
            }
        }
        total
    }

    /// `(verified, total)` device counts for `user_id`
    ///
    /// # Errors
    ///
    /// Propagates transport failures.
    pub async fn device_summary(&self, user_id: &str) -> Result<(usize, usize), TransportError> {
        let devices = self.transport.user_devices(user_id).await?;
        let verified = devices.iter().filter(|d| d.verified).count();
        Ok((verified, devices.len()))
    }

    /// Trust the devices of allow-listed members before sending into `room`
    ///
    /// # Errors
    ///
    /// Propagates transport failures.
    pub async fn ensure_keys_shared(&self, room: &RoomView) -> Result<usize, TransportError> {
        let members = self.transport.joined_members(&room.room_id).await?;
        let mut trusted = 0;
        for member in members
            .iter()
            .filter(|m| m.as_str() != self.bot_user_id() && self.gate.is_allowed_user(m))
        {
            trusted += self.trust_all_devices_of(member).await?;
        }
        if trusted > 0 {
            debug!(parent: &self.span, room = %room.room_id, trusted, "Trusted member devices before send");
        }
        Ok(trusted)
    }

    /// Handle an event that failed to decrypt
    ///
    /// Asks the sender to re-share the room key and tells them to resend.
    /// Events from the bot itself are only logged.
    pub async fn on_decrypt_failure(&self, event: &UndecryptableEvent) {
        warn!(
            parent: &self.span,
            room = %event.room.room_id,
            sender = %event.sender,
            session_id = %event.session_id,
            "Failed to decrypt message"
        );
        if event.sender == self.bot_user_id() {
            return;
        }

        match self.transport.request_room_key(event).await {
            Ok(()) => info!(parent: &self.span, sender = %event.sender, "Requested room key from sender"),
            Err(e) => error!(parent: &self.span, sender = %event.sender, error = %e, "Failed to request room key"),
        }

        if let Err(e) = self
            .deliver(&event.room, &Reply::new(DECRYPT_FAILURE_NOTICE))
            .await
        {
            error!(parent: &self.span, room = %event.room.room_id, error = %e, "Failed to send decrypt notice");
        }
    }

    /// Send `reply` to `room`, preparing encryption first when needed
    ///
    /// A failure to prepare keys is logged and the send still goes ahead.
    ///
    /// # Errors
    ///
    /// Propagates the send failure.
    pub async fn deliver(&self, room: &RoomView, reply: &Reply) -> Result<(), TransportError> {
        if room.encrypted {
            if let Err(e) = self.ensure_keys_shared(room).await {
                warn!(parent: &self.span, room = %room.room_id, error = %e, "Failed to share room keys");
            }
        }
        self.transport
            .send_message(&room.room_id, &reply.body, &reply.html())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InboundEvent;
    use crate::transport::InProcessTransport;

    const BOT: &str = "@bot:x";
    const ALICE: &str = "@alice:x";
    const EVE: &str = "@eve:x";

    fn setup() -> (Arc<InProcessTransport>, TrustManager) {
        let transport = Arc::new(InProcessTransport::new(BOT));
        let gate = Arc::new(AccessGate::new([ALICE], Vec::<String>::new()));
        let manager = TrustManager::new(transport.clone(), gate);
        (transport, manager)
    }

    #[tokio::test]
    async fn test_trust_all_is_idempotent() {
        let (transport, manager) = setup();
        transport.add_device(ALICE, "PHONE", false);
        transport.add_device(ALICE, "LAPTOP", false);
        transport.add_device(ALICE, "OLD", true);

        assert_eq!(manager.trust_all_devices_of(ALICE).await.unwrap(), 2);
        assert_eq!(manager.trust_all_devices_of(ALICE).await.unwrap(), 0);
        assert_eq!(manager.device_summary(ALICE).await.unwrap(), (3, 3));
    }

    #[tokio::test]
    async fn test_auto_trust_only_listed_users() {
        let (transport, manager) = setup();
        transport.add_device(ALICE, "PHONE", false);
        transport.add_device(EVE, "PHONE", false);

        assert_eq!(manager.auto_trust_allowed_users(&[ALICE.to_string()]).await, 1);
        assert!(transport.is_verified(ALICE, "PHONE"));
        assert!(!transport.is_verified(EVE, "PHONE"));
    }

    #[tokio::test]
    async fn test_send_into_encrypted_room_trusts_allowed_members_only() {
        let (transport, manager) = setup();
        transport.add_device(ALICE, "PHONE", false);
        transport.add_device(EVE, "PHONE", false);
        transport.set_members("!r:x", vec![BOT.into(), ALICE.into(), EVE.into()]);

        let room = RoomView::encrypted("!r:x", vec![]);
        manager.deliver(&room, &Reply::new("**hi**")).await.unwrap();

        assert!(transport.is_verified(ALICE, "PHONE"));
        assert!(!transport.is_verified(EVE, "PHONE"));
        let sent = transport.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].html, "<strong>hi</strong>");
    }

    #[tokio::test]
    async fn test_plain_room_skips_trust() {
        let (transport, manager) = setup();
        transport.add_device(ALICE, "PHONE", false);
        transport.set_members("!r:x", vec![ALICE.into()]);

        manager.deliver(&RoomView::plain("!r:x"), &Reply::new("hi")).await.unwrap();
        assert!(!transport.is_verified(ALICE, "PHONE"));
    }

    #[tokio::test]
    async fn test_decrypt_failure_requests_key_and_notifies() {
        let (transport, manager) = setup();
        let InboundEvent::Undecryptable(event) =
            InboundEvent::undecryptable(RoomView::encrypted("!r:x", vec![]), ALICE)
        else {
            unreachable!()
        };

        manager.on_decrypt_failure(&event).await;

        assert_eq!(transport.key_requests(), vec![event.event_id.clone()]);
        let sent = transport.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, DECRYPT_FAILURE_NOTICE);
    }

    #[tokio::test]
    async fn test_decrypt_failure_from_self_is_quiet() {
        let (transport, manager) = setup();
        let InboundEvent::Undecryptable(event) =
            InboundEvent::undecryptable(RoomView::encrypted("!r:x", vec![]), BOT)
        else {
            unreachable!()
        };

        manager.on_decrypt_failure(&event).await;

        assert!(transport.key_requests().is_empty());
        assert!(transport.sent_messages().is_empty());
    }
}
