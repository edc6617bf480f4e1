//! End-to-end Encrypted Matrix Transport
//!
//! [`ChatTransport`] backed by `matrix-sdk` with its Olm/Megolm machine and a
//! persistent SQLite store. Room keys, device lists and local device trust
//! live in the store directory, so verification survives restarts.
//!
//! SDK event handlers collect timeline events while a sync is processed;
//! [`ChatTransport::poll_events`] drains them after each sync. Messages the
//! machine decrypts arrive as ordinary text. Ones it cannot decrypt stay
//! `m.room.encrypted` and surface as [`InboundEvent::Undecryptable`], and the
//! machine queues a key request for them on its own.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use matrix_sdk::config::SyncSettings;
use matrix_sdk::encryption::LocalTrust;
use matrix_sdk::matrix_auth::{MatrixSession, MatrixSessionTokens};
use matrix_sdk::ruma::api::client::error::ErrorKind;
use matrix_sdk::ruma::events::room::encrypted::{
    EncryptedEventScheme, OriginalSyncRoomEncryptedEvent,
};
use matrix_sdk::ruma::events::room::member::{MembershipState, StrippedRoomMemberEvent};
use matrix_sdk::ruma::events::room::message::{
    MessageType, OriginalSyncRoomMessageEvent, RoomMessageEventContent,
};
use matrix_sdk::ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use matrix_sdk::{Client, Room, RoomMemberships, SessionMeta};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::events::{
    now_ms, InboundEvent, RoomInvite, RoomView, TextMessage, UndecryptableEvent,
};

use super::matrix_http::MatrixHttpTransport;
use super::traits::{ChatTransport, DeviceInfo, TransportError};

/// Matrix client with end-to-end encryption
pub struct MatrixSdkTransport {
    client: Client,
    user_id: String,
    sync_timeout: Duration,
    since: Mutex<Option<String>>,
    events: Mutex<mpsc::UnboundedReceiver<InboundEvent>>,
}

impl MatrixSdkTransport {
    /// Verify the token, then open the crypto store and restore the session
    ///
    /// The token is checked with `whoami` first; the device it is bound to
    /// becomes the device whose keys the store holds.
    ///
    /// # Errors
    ///
    /// [`TransportError::AuthenticationFailed`] for a rejected token or one
    /// without a device; store or connection errors otherwise.
    pub async fn connect(
        homeserver: &str,
        access_token: &str,
        expected_user: &str,
        store_path: &Path,
        sync_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let checked =
            MatrixHttpTransport::connect(homeserver, access_token, expected_user, sync_timeout)
                .await?;
        if checked.device_id().is_empty() {
            return Err(TransportError::AuthenticationFailed(
                "token is not bound to a device; encryption needs one".to_string(),
            ));
        }
        Self::open(
            homeserver,
            access_token,
            expected_user,
            checked.device_id(),
            store_path,
            sync_timeout,
        )
        .await
    }

    /// Open the crypto store and restore a session without contacting the
    /// homeserver
    ///
    /// # Errors
    ///
    /// Fails when the ids are malformed or the store cannot be opened.
    pub async fn open(
        homeserver: &str,
        access_token: &str,
        user_id: &str,
        device_id: &str,
        store_path: &Path,
        sync_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let owned_user = parse_user(user_id)?;
        tokio::fs::create_dir_all(store_path).await.map_err(|e| {
            TransportError::InvalidState(format!(
                "cannot create crypto store {}: {e}",
                store_path.display()
            ))
        })?;

        let client = Client::builder()
            .homeserver_url(homeserver)
            .sqlite_store(store_path, None)
            .build()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("cannot build client: {e}")))?;

        let session = MatrixSession {
            meta: SessionMeta {
                user_id: owned_user,
                device_id: OwnedDeviceId::from(device_id),
            },
            tokens: MatrixSessionTokens {
                access_token: access_token.to_string(),
                refresh_token: None,
            },
        };
        client
            .matrix_auth()
            .restore_session(session)
            .await
            .map_err(sdk_error)?;

        info!(
            user = %user_id,
            device = %device_id,
            store = %store_path.display(),
            "Crypto store loaded"
        );
        Ok(Self::with_client(client, user_id, sync_timeout))
    }

    fn with_client(client: Client, user_id: &str, sync_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        register_handlers(&client, &tx, user_id);
        Self {
            client,
            user_id: user_id.to_string(),
            sync_timeout,
            since: Mutex::new(None),
            events: Mutex::new(rx),
        }
    }

    /// Run one sync to load room state and keys without dispatching its
    /// timeline
    ///
    /// # Errors
    ///
    /// Propagates sync failures.
    pub async fn initial_sync(&self) -> Result<(), TransportError> {
        self.sync(Duration::ZERO).await?;
        let skipped = self.drain().await.len();
        info!(
            rooms = self.client.joined_rooms().len(),
            skipped_events = skipped,
            "Initial sync complete"
        );
        Ok(())
    }

    async fn sync(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut since = self.since.lock().await;
        let mut settings = SyncSettings::default().timeout(timeout);
        if let Some(ref token) = *since {
            settings = settings.token(token.clone());
        }
        let response = self.client.sync_once(settings).await.map_err(sdk_error)?;
        *since = Some(response.next_batch);
        Ok(())
    }

    async fn drain(&self) -> Vec<InboundEvent> {
        let mut events = self.events.lock().await;
        let mut batch = Vec::new();
        while let Ok(event) = events.try_recv() {
            batch.push(event);
        }
        batch
    }

    fn room(&self, room_id: &str) -> Result<Room, TransportError> {
        self.client
            .get_room(&parse_room(room_id)?)
            .ok_or_else(|| TransportError::InvalidState(format!("unknown room {room_id}")))
    }
}

fn register_handlers(client: &Client, tx: &mpsc::UnboundedSender<InboundEvent>, own_user: &str) {
    let sink = tx.clone();
    client.add_event_handler(move |event: OriginalSyncRoomMessageEvent, room: Room| {
        let sink = sink.clone();
        async move {
            if let Some(message) = text_message(&event, room_view(&room).await) {
                let _ = sink.send(message);
            }
        }
    });

    let sink = tx.clone();
    client.add_event_handler(move |event: OriginalSyncRoomEncryptedEvent, room: Room| {
        let sink = sink.clone();
        async move {
            let _ = sink.send(undecryptable(&event, room_view(&room).await));
        }
    });

    let sink = tx.clone();
    let own_user = own_user.to_string();
    client.add_event_handler(move |event: StrippedRoomMemberEvent, room: Room| {
        let sink = sink.clone();
        let own_user = own_user.clone();
        async move {
            let view = RoomView {
                room_id: room.room_id().to_string(),
                encrypted: room.is_encrypted().await.unwrap_or(false),
                members: Vec::new(),
            };
            if let Some(invite) = invite(&event, &own_user, view) {
                let _ = sink.send(invite);
            }
        }
    });
}

async fn room_view(room: &Room) -> RoomView {
    let members = room
        .members_no_sync(RoomMemberships::JOIN)
        .await
        .map(|members| members.iter().map(|m| m.user_id().to_string()).collect())
        .unwrap_or_default();
    RoomView {
        room_id: room.room_id().to_string(),
        encrypted: room.is_encrypted().await.unwrap_or(false),
        members,
    }
}

fn text_message(event: &OriginalSyncRoomMessageEvent, room: RoomView) -> Option<InboundEvent> {
    let MessageType::Text(text) = &event.content.msgtype else {
        return None;
    };
    Some(InboundEvent::Message(TextMessage {
        room,
        sender: event.sender.to_string(),
        event_id: event.event_id.to_string(),
        body: text.body.clone(),
        timestamp: u64::from(event.origin_server_ts.0),
    }))
}

fn undecryptable(event: &OriginalSyncRoomEncryptedEvent, mut room: RoomView) -> InboundEvent {
    room.encrypted = true;
    #[allow(deprecated)]
    let (algorithm, session_id, sender_key) = match &event.content.scheme {
        EncryptedEventScheme::MegolmV1AesSha2(content) => (
            "m.megolm.v1.aes-sha2",
            content.session_id.clone(),
            content.sender_key.clone(),
        ),
        _ => ("unknown", String::new(), String::new()),
    };
    InboundEvent::Undecryptable(UndecryptableEvent {
        room,
        sender: event.sender.to_string(),
        event_id: event.event_id.to_string(),
        session_id,
        sender_key,
        algorithm: algorithm.to_string(),
        timestamp: u64::from(event.origin_server_ts.0),
    })
}

fn invite(event: &StrippedRoomMemberEvent, own_user: &str, room: RoomView) -> Option<InboundEvent> {
    if event.content.membership != MembershipState::Invite || event.state_key.as_str() != own_user {
        return None;
    }
    Some(InboundEvent::Invite(RoomInvite {
        room,
        sender: event.sender.to_string(),
        invitee: event.state_key.to_string(),
        timestamp: now_ms(),
    }))
}

fn parse_user(user_id: &str) -> Result<OwnedUserId, TransportError> {
    UserId::parse(user_id)
        .map_err(|e| TransportError::InvalidState(format!("bad user id {user_id:?}: {e}")))
}

fn parse_room(room_id: &str) -> Result<OwnedRoomId, TransportError> {
    RoomId::parse(room_id)
        .map_err(|e| TransportError::InvalidState(format!("bad room id {room_id:?}: {e}")))
}

fn sdk_error(err: matrix_sdk::Error) -> TransportError {
    if matches!(err.client_api_error_kind(), Some(ErrorKind::UnknownToken { .. })) {
        TransportError::AuthenticationFailed(err.to_string())
    } else {
        TransportError::ConnectionFailed(err.to_string())
    }
}

fn store_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::InvalidState(format!("crypto store: {err}"))
}

#[async_trait]
impl ChatTransport for MatrixSdkTransport {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn poll_events(&self) -> Result<Vec<InboundEvent>, TransportError> {
        self.sync(self.sync_timeout).await?;
        let events = self.drain().await;
        debug!(events = events.len(), "Sync batch received");
        Ok(events)
    }

    async fn join_room(&self, room_id: &str) -> Result<(), TransportError> {
        self.client
            .join_room_by_id(&parse_room(room_id)?)
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn send_message(
        &self,
        room_id: &str,
        body: &str,
        html: &str,
    ) -> Result<(), TransportError> {
        self.room(room_id)?
            .send(RoomMessageEventContent::text_html(body, html))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    async fn set_typing(
        &self,
        room_id: &str,
        typing: bool,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        // The SDK picks the notice timeout and renews it while typing is set
        self.room(room_id)?
            .typing_notice(typing)
            .await
            .map_err(sdk_error)
    }

    async fn joined_members(&self, room_id: &str) -> Result<Vec<String>, TransportError> {
        let members = self
            .room(room_id)?
            .members(RoomMemberships::JOIN)
            .await
            .map_err(sdk_error)?;
        Ok(members.iter().map(|m| m.user_id().to_string()).collect())
    }

    async fn user_devices(&self, user_id: &str) -> Result<Vec<DeviceInfo>, TransportError> {
        let devices = self
            .client
            .encryption()
            .get_user_devices(&parse_user(user_id)?)
            .await
            .map_err(store_error)?;
        Ok(devices
            .devices()
            .map(|device| DeviceInfo::new(device.device_id().to_string(), device.is_verified()))
            .collect())
    }

    async fn verify_device(&self, user_id: &str, device_id: &str) -> Result<(), TransportError> {
        let owned_device = OwnedDeviceId::from(device_id);
        let device = self
            .client
            .encryption()
            .get_device(&parse_user(user_id)?, &owned_device)
            .await
            .map_err(store_error)?
            .ok_or_else(|| {
                TransportError::InvalidState(format!("unknown device {device_id} of {user_id}"))
            })?;
        device
            .set_local_trust(LocalTrust::Verified)
            .await
            .map_err(store_error)
    }

    async fn request_room_key(&self, event: &UndecryptableEvent) -> Result<(), TransportError> {
        // Decryption failures already queued a request inside the machine;
        // it goes out with the next sync.
        debug!(
            room = %event.room.room_id,
            session = %event.session_id,
            "Room key request left to the crypto machine"
        );
        Ok(())
    }
}
