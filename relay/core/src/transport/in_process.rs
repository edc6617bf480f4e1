//! In-Process Transport
//!
//! Channel-backed transport for embedding and tests. Inbound events are
//! pushed through a sender handle; every outbound call is recorded so callers
//! can inspect what the relay did.
//!
//! # Usage
//!
//! ```ignore
//! let transport = Arc::new(InProcessTransport::new("@bot:example.org"));
//! transport.add_device("@alice:example.org", "PHONE", false);
//! transport.push(InboundEvent::message(RoomView::plain("!r:x"), "@alice:example.org", "hi"));
//! // ... run the dispatcher ...
//! assert_eq!(transport.sent_messages().len(), 1);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::events::{InboundEvent, UndecryptableEvent};

use super::traits::{ChatTransport, DeviceInfo, TransportError};

/// A message the relay sent
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentMessage {
    /// Target room
    pub room_id: String,
    /// Plain body
    pub body: String,
    /// Rendered hypertext
    pub html: String,
}

/// In-process transport using tokio channels
pub struct InProcessTransport {
    user_id: String,
    event_tx: mpsc::UnboundedSender<InboundEvent>,
    event_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundEvent>>,
    sent: Mutex<Vec<SentMessage>>,
    typing: Mutex<Vec<(String, bool)>>,
    joined: Mutex<Vec<String>>,
    key_requests: Mutex<Vec<String>>,
    members: Mutex<HashMap<String, Vec<String>>>,
    devices: Mutex<HashMap<String, BTreeMap<String, bool>>>,
    fail_sends: AtomicBool,
}

impl InProcessTransport {
    /// Create a transport for the given bot identity
    pub fn new(user_id: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            user_id: user_id.into(),
            event_tx,
            event_rx: tokio::sync::Mutex::new(event_rx),
            sent: Mutex::new(Vec::new()),
            typing: Mutex::new(Vec::new()),
            joined: Mutex::new(Vec::new()),
            key_requests: Mutex::new(Vec::new()),
            members: Mutex::new(HashMap::new()),
            devices: Mutex::new(HashMap::new()),
            fail_sends: AtomicBool::new(false),
        }
    }

    /// Queue an inbound event
    pub fn push(&self, event: InboundEvent) {
        // The receiver lives as long as self, so this cannot fail
        let _ = self.event_tx.send(event);
    }

    /// Register a device for a user
    pub fn add_device(&self, user_id: &str, device_id: &str, verified: bool) {
        self.devices
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .insert(device_id.to_string(), verified);
    }

    /// Set the joined members of a room
    pub fn set_members(&self, room_id: &str, members: Vec<String>) {
        self.members.lock().insert(room_id.to_string(), members);
    }

    /// Make every subsequent send fail
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Messages sent so far
    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    /// Typing indicator changes, in order
    pub fn typing_log(&self) -> Vec<(String, bool)> {
        self.typing.lock().clone()
    }

    /// Rooms joined so far
    pub fn joined_rooms(&self) -> Vec<String> {
        self.joined.lock().clone()
    }

    /// Event ids for which a key re-share was requested
    pub fn key_requests(&self) -> Vec<String> {
        self.key_requests.lock().clone()
    }

    /// Whether a specific device is verified
    pub fn is_verified(&self, user_id: &str, device_id: &str) -> bool {
        self.devices
            .lock()
            .get(user_id)
            .and_then(|d| d.get(device_id).copied())
            .unwrap_or(false)
    }
}

#[async_trait]
impl ChatTransport for InProcessTransport {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn poll_events(&self) -> Result<Vec<InboundEvent>, TransportError> {
        let mut rx = self.event_rx.lock().await;
        let first = rx.recv().await.ok_or(TransportError::ConnectionClosed)?;
        let mut batch = vec![first];
        while let Ok(event) = rx.try_recv() {
            batch.push(event);
        }
        Ok(batch)
    }

    async fn join_room(&self, room_id: &str) -> Result<(), TransportError> {
        self.joined.lock().push(room_id.to_string());
        Ok(())
    }

    async fn send_message(
        &self,
        room_id: &str,
        body: &str,
        html: &str,
    ) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("sends disabled".to_string()));
        }
        self.sent.lock().push(SentMessage {
            room_id: room_id.to_string(),
            body: body.to_string(),
            html: html.to_string(),
        });
        Ok(())
    }

    async fn set_typing(
        &self,
        room_id: &str,
        typing: bool,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        self.typing.lock().push((room_id.to_string(), typing));
        Ok(())
    }

    async fn joined_members(&self, room_id: &str) -> Result<Vec<String>, TransportError> {
        Ok(self.members.lock().get(room_id).cloned().unwrap_or_default())
    }

    async fn user_devices(&self, user_id: &str) -> Result<Vec<DeviceInfo>, TransportError> {
        Ok(self
            .devices
            .lock()
            .get(user_id)
            .map(|devices| {
                devices
                    .iter()
                    .map(|(id, verified)| DeviceInfo::new(id.clone(), *verified))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn verify_device(&self, user_id: &str, device_id: &str) -> Result<(), TransportError> {
        let mut devices = self.devices.lock();
        match devices.get_mut(user_id).and_then(|d| d.get_mut(device_id)) {
            Some(verified) => {
                *verified = true;
                Ok(())
            }
            None => Err(TransportError::InvalidState(format!(
                "unknown device {device_id} for {user_id}"
            ))),
        }
    }

    async fn request_room_key(&self, event: &UndecryptableEvent) -> Result<(), TransportError> {
        self.key_requests.lock().push(event.event_id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RoomView;

    #[tokio::test]
    async fn test_poll_drains_batch() {
        let transport = InProcessTransport::new("@bot:x");
        transport.push(InboundEvent::message(RoomView::plain("!r:x"), "@a:x", "one"));
        transport.push(InboundEvent::message(RoomView::plain("!r:x"), "@a:x", "two"));

        let batch = transport.poll_events().await.unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn test_device_trust_roundtrip() {
        let transport = InProcessTransport::new("@bot:x");
        transport.add_device("@a:x", "PHONE", false);

        transport.verify_device("@a:x", "PHONE").await.unwrap();
        assert!(transport.is_verified("@a:x", "PHONE"));
        assert!(transport.verify_device("@a:x", "LAPTOP").await.is_err());
    }
}
