//! Matrix Client-Server Transport
//!
//! [`ChatTransport`] over the Matrix client-server HTTP API.
//!
//! # Endpoints
//!
//! - `GET  /account/whoami` - credential check at startup
//! - `GET  /sync` - long-poll for room events
//! - `POST /join/{room}` - accept invites
//! - `PUT  /rooms/{room}/send/m.room.message/{txn}` - replies
//! - `PUT  /rooms/{room}/typing/{user}` - typing indicator
//! - `GET  /rooms/{room}/joined_members` - membership
//! - `POST /keys/query` - device lists
//! - `PUT  /sendToDevice/m.room_key_request/{txn}` - key re-share requests
//!
//! # Encryption
//!
//! This transport carries no Olm/Megolm machine. Encrypted room events are
//! surfaced as [`InboundEvent::Undecryptable`], and sending into an encrypted
//! room is refused with [`TransportError::Unsupported`] instead of leaking
//! plaintext. Device verification is kept in memory only. Deployments with
//! encrypted rooms use [`MatrixSdkTransport`](super::MatrixSdkTransport).

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use reqwest::{StatusCode, Url};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::events::{InboundEvent, RoomInvite, RoomView, TextMessage, UndecryptableEvent};

use super::traits::{ChatTransport, DeviceInfo, TransportError};

const API_PREFIX: [&str; 3] = ["_matrix", "client", "v3"];

#[derive(Clone, Debug, Default)]
struct RoomState {
    encrypted: bool,
    members: BTreeSet<String>,
}

/// Matrix homeserver client
pub struct MatrixHttpTransport {
    homeserver: Url,
    access_token: String,
    user_id: String,
    device_id: String,
    sync_timeout: Duration,
    http_client: reqwest::Client,
    since: Mutex<Option<String>>,
    rooms: DashMap<String, RoomState>,
    verified: DashSet<(String, String)>,
}

impl MatrixHttpTransport {
    /// Connect and verify the access token
    ///
    /// Calls `whoami`; the token must belong to `expected_user`.
    ///
    /// # Errors
    ///
    /// [`TransportError::AuthenticationFailed`] when the homeserver rejects the
    /// token or it belongs to someone else; connection errors otherwise.
    pub async fn connect(
        homeserver: &str,
        access_token: &str,
        expected_user: &str,
        sync_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let homeserver = Url::parse(homeserver)
            .map_err(|e| TransportError::ConnectionFailed(format!("bad homeserver URL: {e}")))?;
        let http_client = reqwest::Client::builder()
            .timeout(sync_timeout + Duration::from_secs(30))
            .build()?;

        let mut transport = Self {
            homeserver,
            access_token: access_token.to_string(),
            user_id: expected_user.to_string(),
            device_id: String::new(),
            sync_timeout,
            http_client,
            since: Mutex::new(None),
            rooms: DashMap::new(),
            verified: DashSet::new(),
        };

        let whoami = transport
            .get_json(transport.endpoint(&["account", "whoami"])?)
            .await?;
        let user_id = whoami["user_id"].as_str().unwrap_or_default();
        if user_id != expected_user {
            return Err(TransportError::AuthenticationFailed(format!(
                "token belongs to {user_id:?}, expected {expected_user:?}"
            )));
        }
        transport.device_id = whoami["device_id"].as_str().unwrap_or_default().to_string();

        info!(user = %transport.user_id, device = %transport.device_id, "Authenticated with homeserver");
        Ok(transport)
    }

    /// Device the access token is bound to, as reported by `whoami`
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Run one sync to learn room state without dispatching its timeline
    ///
    /// # Errors
    ///
    /// Propagates sync failures.
    pub async fn initial_sync(&self) -> Result<(), TransportError> {
        let events = self.sync_once(Duration::ZERO).await?;
        info!(
            rooms = self.rooms.len(),
            skipped_events = events.len(),
            "Initial sync complete"
        );
        Ok(())
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.homeserver.clone();
        {
            let mut path = url.path_segments_mut().map_err(|()| {
                TransportError::InvalidState("homeserver URL cannot be a base".to_string())
            })?;
            path.pop_if_empty();
            for segment in API_PREFIX {
                path.push(segment);
            }
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> Result<Value, TransportError> {
        let response = self
            .http_client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn put_json(&self, url: Url, body: &Value) -> Result<Value, TransportError> {
        let response = self
            .http_client
            .put(url)
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn post_json(&self, url: Url, body: &Value) -> Result<Value, TransportError> {
        let response = self
            .http_client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, TransportError> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::AuthenticationFailed(format!("{status}: {body}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::SendFailed(format!("{status}: {body}")));
        }
        Ok(response.json::<Value>().await?)
    }

    fn room_view(&self, room_id: &str) -> RoomView {
        self.rooms
            .get(room_id)
            .map(|state| RoomView {
                room_id: room_id.to_string(),
                encrypted: state.encrypted,
                members: state.members.iter().cloned().collect(),
            })
            .unwrap_or_else(|| RoomView::plain(room_id))
    }

    fn apply_state_event(&self, room_id: &str, event: &Value) {
        let mut room = self.rooms.entry(room_id.to_string()).or_default();
        match event["type"].as_str() {
            Some("m.room.encryption") => room.encrypted = true,
            Some("m.room.member") => {
                let Some(member) = event["state_key"].as_str() else {
                    return;
                };
                match event["content"]["membership"].as_str() {
                    Some("join") => {
                        room.members.insert(member.to_string());
                    }
                    Some("leave" | "ban") => {
                        room.members.remove(member);
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn timeline_event(&self, room_id: &str, event: &Value) -> Option<InboundEvent> {
        let sender = event["sender"].as_str()?.to_string();
        let event_id = event["event_id"].as_str().unwrap_or_default().to_string();
        let timestamp = event["origin_server_ts"].as_u64().unwrap_or_default();
        let content = &event["content"];

        match event["type"].as_str()? {
            "m.room.message" if content["msgtype"].as_str() == Some("m.text") => {
                Some(InboundEvent::Message(TextMessage {
                    room: self.room_view(room_id),
                    sender,
                    event_id,
                    body: content["body"].as_str().unwrap_or_default().to_string(),
                    timestamp,
                }))
            }
            "m.room.encrypted" => Some(InboundEvent::Undecryptable(UndecryptableEvent {
                room: self.room_view(room_id),
                sender,
                event_id,
                session_id: content["session_id"].as_str().unwrap_or_default().to_string(),
                sender_key: content["sender_key"].as_str().unwrap_or_default().to_string(),
                algorithm: content["algorithm"].as_str().unwrap_or_default().to_string(),
                timestamp,
            })),
            _ => None,
        }
    }

    async fn sync_once(&self, timeout: Duration) -> Result<Vec<InboundEvent>, TransportError> {
        let mut since = self.since.lock().await;

        let mut url = self.endpoint(&["sync"])?;
        url.query_pairs_mut()
            .append_pair("timeout", &timeout.as_millis().to_string());
        if let Some(ref token) = *since {
            url.query_pairs_mut().append_pair("since", token);
        }

        let response = self.get_json(url).await?;
        let events = self.ingest_sync(&response);

        if let Some(next) = response["next_batch"].as_str() {
            *since = Some(next.to_string());
        }

        debug!(events = events.len(), "Sync batch received");
        Ok(events)
    }

    /// Fold a sync response into room state and extract its events
    fn ingest_sync(&self, response: &Value) -> Vec<InboundEvent> {
        let mut events = Vec::new();

        if let Some(joined) = response["rooms"]["join"].as_object() {
            for (room_id, room) in joined {
                let state = room["state"]["events"].as_array().into_iter().flatten();
                let timeline = room["timeline"]["events"].as_array().into_iter().flatten();
                for event in state.chain(timeline.clone()) {
                    if event.get("state_key").is_some() {
                        self.apply_state_event(room_id, event);
                    }
                }
                events.extend(timeline.filter_map(|event| self.timeline_event(room_id, event)));
            }
        }

        if let Some(invited) = response["rooms"]["invite"].as_object() {
            for (room_id, room) in invited {
                if let Some(invite) = self.invite_event(room_id, room) {
                    events.push(invite);
                }
            }
        }

        events
    }

    fn invite_event(&self, room_id: &str, room: &Value) -> Option<InboundEvent> {
        let mut encrypted = false;
        let mut sender = None;
        for event in room["invite_state"]["events"].as_array().into_iter().flatten() {
            match event["type"].as_str() {
                Some("m.room.encryption") => encrypted = true,
                Some("m.room.member")
                    if event["state_key"].as_str() == Some(self.user_id.as_str())
                        && event["content"]["membership"].as_str() == Some("invite") =>
                {
                    sender = event["sender"].as_str().map(ToString::to_string);
                }
                _ => {}
            }
        }

        Some(InboundEvent::Invite(RoomInvite {
            room: RoomView {
                room_id: room_id.to_string(),
                encrypted,
                members: Vec::new(),
            },
            sender: sender?,
            invitee: self.user_id.clone(),
            timestamp: crate::events::now_ms(),
        }))
    }
}

#[async_trait]
impl ChatTransport for MatrixHttpTransport {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn poll_events(&self) -> Result<Vec<InboundEvent>, TransportError> {
        self.sync_once(self.sync_timeout).await
    }

    async fn join_room(&self, room_id: &str) -> Result<(), TransportError> {
        self.post_json(self.endpoint(&["join", room_id])?, &json!({}))
            .await?;
        Ok(())
    }

    async fn send_message(
        &self,
        room_id: &str,
        body: &str,
        html: &str,
    ) -> Result<(), TransportError> {
        if self.rooms.get(room_id).is_some_and(|r| r.encrypted) {
            warn!(room = %room_id, "Refusing to send plaintext into an encrypted room");
            return Err(TransportError::Unsupported(
                "this transport cannot encrypt outbound messages".to_string(),
            ));
        }

        let txn = uuid::Uuid::new_v4().simple().to_string();
        let url = self.endpoint(&["rooms", room_id, "send", "m.room.message", &txn])?;
        self.put_json(
            url,
            &json!({
                "msgtype": "m.text",
                "body": body,
                "format": "org.matrix.custom.html",
                "formatted_body": html,
            }),
        )
        .await?;
        Ok(())
    }

    async fn set_typing(
        &self,
        room_id: &str,
        typing: bool,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let url = self.endpoint(&["rooms", room_id, "typing", &self.user_id])?;
        let body = if typing {
            json!({ "typing": true, "timeout": u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX) })
        } else {
            json!({ "typing": false })
        };
        self.put_json(url, &body).await?;
        Ok(())
    }

    async fn joined_members(&self, room_id: &str) -> Result<Vec<String>, TransportError> {
        let response = self
            .get_json(self.endpoint(&["rooms", room_id, "joined_members"])?)
            .await?;
        Ok(response["joined"]
            .as_object()
            .map(|joined| joined.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn user_devices(&self, user_id: &str) -> Result<Vec<DeviceInfo>, TransportError> {
        let response = self
            .post_json(
                self.endpoint(&["keys", "query"])?,
                &json!({ "device_keys": { user_id: [] } }),
            )
            .await?;
        Ok(response["device_keys"][user_id]
            .as_object()
            .map(|devices| {
                devices
                    .keys()
                    .map(|device_id| {
                        let verified = self
                            .verified
                            .contains(&(user_id.to_string(), device_id.clone()));
                        DeviceInfo::new(device_id.clone(), verified)
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn verify_device(&self, user_id: &str, device_id: &str) -> Result<(), TransportError> {
        self.verified
            .insert((user_id.to_string(), device_id.to_string()));
        Ok(())
    }

    async fn request_room_key(&self, event: &UndecryptableEvent) -> Result<(), TransportError> {
        let txn = uuid::Uuid::new_v4().simple().to_string();
        let request_id = uuid::Uuid::new_v4().simple().to_string();
        let url = self.endpoint(&["sendToDevice", "m.room_key_request", &txn])?;
        self.put_json(
            url,
            &json!({
                "messages": {
                    event.sender.as_str(): {
                        "*": {
                            "action": "request",
                            "request_id": request_id,
                            "requesting_device_id": self.device_id,
                            "body": {
                                "algorithm": event.algorithm,
                                "room_id": event.room.room_id,
                                "sender_key": event.sender_key,
                                "session_id": event.session_id,
                            }
                        }
                    }
                }
            }),
        )
        .await?;
        Ok(())
    }
}
