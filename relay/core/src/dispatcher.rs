//! Event Dispatcher
//!
//! Entry point for everything the transport delivers.
//!
//! # Flow
//!
//! ```text
//! transport.poll_events()
//!     -> drop self-originated events
//!     -> access gate (denied: logged, dropped)
//!     -> per-sender lane
//!     -> HandlerRegistry[event.kind()].handle(event)
//! ```
//!
//! # Ordering
//!
//! Each sender gets a lane: an unbounded queue drained by one task. Events
//! from one sender are handled strictly in arrival order, while a slow
//! assistant call for one sender never delays another.
//!
//! Handlers can also be invoked directly with [`EventDispatcher::dispatch`],
//! which applies the same filtering but runs inline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Span};

use crate::access::AccessGate;
use crate::error::RelayError;
use crate::events::{EventKind, InboundEvent};
use crate::router::CommandRouter;
use crate::transport::{ChatTransport, TransportError};
use crate::trust::TrustManager;

const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Handles one kind of inbound event
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process an event that already passed filtering
    async fn handle(&self, event: InboundEvent) -> Result<(), RelayError>;
}

/// Map from event kind to handler
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any earlier one
    #[must_use]
    pub fn with(mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    /// Register `handler` for `kind`, replacing any earlier one
    pub fn register(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Handler for `kind`
    pub fn get(&self, kind: EventKind) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(&kind).cloned()
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Routes text messages and sends the reply
pub struct MessageHandler {
    router: Arc<CommandRouter>,
    trust: Arc<TrustManager>,
    span: Span,
}

impl MessageHandler {
    /// Create the handler
    pub fn new(router: Arc<CommandRouter>, trust: Arc<TrustManager>, span: Span) -> Self {
        Self {
            router,
            trust,
            span,
        }
    }
}

#[async_trait]
impl EventHandler for MessageHandler {
    async fn handle(&self, event: InboundEvent) -> Result<(), RelayError> {
        let InboundEvent::Message(message) = event else {
            return Ok(());
        };
        let body = message.body.trim();
        let mut preview: String = body.chars().take(50).collect();
        if preview.len() < body.len() {
            preview.push_str("...");
        }
        info!(
            parent: &self.span,
            user = %message.sender,
            room = %message.room.room_id,
            message = %preview,
            "Received message"
        );

        let reply = self.router.route(&message.room, &message.sender, body).await;
        self.trust.deliver(&message.room, &reply).await?;
        Ok(())
    }
}

/// Joins rooms the bot is invited to by allow-listed users
pub struct InviteHandler {
    transport: Arc<dyn ChatTransport>,
    gate: Arc<AccessGate>,
    span: Span,
}

impl InviteHandler {
    /// Create the handler
    pub fn new(transport: Arc<dyn ChatTransport>, gate: Arc<AccessGate>, span: Span) -> Self {
        Self {
            transport,
            gate,
            span,
        }
    }
}

#[async_trait]
impl EventHandler for InviteHandler {
    async fn handle(&self, event: InboundEvent) -> Result<(), RelayError> {
        let InboundEvent::Invite(invite) = event else {
            return Ok(());
        };
        if invite.invitee != self.transport.user_id() {
            return Ok(());
        }
        if !self.gate.is_allowed_user(&invite.sender) {
            warn!(parent: &self.span, room = %invite.room.room_id, from_user = %invite.sender, "Rejecting invite from unauthorized user");
            return Ok(());
        }

        info!(parent: &self.span, room = %invite.room.room_id, from_user = %invite.sender, "Accepting invite");
        self.transport.join_room(&invite.room.room_id).await?;
        Ok(())
    }
}

/// Hands undecryptable events to the trust manager
pub struct DecryptFailureHandler {
    trust: Arc<TrustManager>,
}

impl DecryptFailureHandler {
    /// Create the handler
    pub fn new(trust: Arc<TrustManager>) -> Self {
        Self { trust }
    }
}

#[async_trait]
impl EventHandler for DecryptFailureHandler {
    async fn handle(&self, event: InboundEvent) -> Result<(), RelayError> {
        if let InboundEvent::Undecryptable(failed) = event {
            self.trust.on_decrypt_failure(&failed).await;
        }
        Ok(())
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

struct Lane {
    tx: mpsc::UnboundedSender<InboundEvent>,
    task: JoinHandle<()>,
}

/// Filters events and fans them out to per-sender lanes
pub struct EventDispatcher {
    registry: HandlerRegistry,
    gate: Arc<AccessGate>,
    bot_user: String,
    lanes: Mutex<HashMap<String, Lane>>,
    span: Span,
}

impl EventDispatcher {
    /// Create a dispatcher for the bot identity `bot_user`
    pub fn new(registry: HandlerRegistry, gate: Arc<AccessGate>, bot_user: impl Into<String>) -> Self {
        Self {
            registry,
            gate,
            bot_user: bot_user.into(),
            lanes: Mutex::new(HashMap::new()),
            span: Span::none(),
        }
    }

    /// Attach the span dispatch is logged under
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Whether `event` may reach a handler
    pub fn admit(&self, event: &InboundEvent) -> bool {
        let sender = event.sender();
        if sender == self.bot_user {
            debug!(parent: &self.span, kind = %event.kind(), "Ignoring own event");
            return false;
        }
        match event {
            InboundEvent::Invite(_) => {
                let allowed = self.gate.is_allowed_user(sender);
                if !allowed {
                    warn!(parent: &self.span, sender = %sender, room = %event.room().room_id, "Rejecting invite from unauthorized user");
                }
                allowed
            }
            _ => self.gate.allowed(sender, &event.room().room_id),
        }
    }

    /// Filter and handle one event inline
    pub async fn dispatch(&self, event: InboundEvent) {
        if self.admit(&event) {
            self.invoke(event).await;
        }
    }

    async fn invoke(&self, event: InboundEvent) {
        let kind = event.kind();
        let Some(handler) = self.registry.get(kind) else {
            debug!(parent: &self.span, kind = %kind, "No handler registered");
            return;
        };
        let sender = event.sender().to_string();
        if let Err(e) = handler.handle(event).await {
            error!(parent: &self.span, kind = %kind, sender = %sender, error = %e, "Event handler failed");
        }
    }

    /// Filter `event` and queue it on its sender's lane
    pub fn enqueue(self: &Arc<Self>, event: InboundEvent) {
        if !self.admit(&event) {
            return;
        }
        let sender = event.sender().to_string();
        let mut lanes = self.lanes.lock();

        let event = match lanes.get(&sender) {
            Some(lane) => match lane.tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        // No lane yet, or its task died: start a fresh one
        let lane = self.spawn_lane(&sender);
        let _ = lane.tx.send(event);
        lanes.insert(sender, lane);
    }

    fn spawn_lane(self: &Arc<Self>, sender: &str) -> Lane {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let this = Arc::clone(self);
        debug!(parent: &self.span, sender = %sender, "Opening lane");
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                this.invoke(event).await;
            }
        });
        Lane { tx, task }
    }

    /// Number of sender lanes opened so far
    pub fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Poll `transport` and dispatch until `shutdown` is set
    ///
    /// Transient poll failures are retried after a pause. On shutdown, queued
    /// events are drained before this returns.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport closes or rejects credentials.
    pub async fn run(
        self: Arc<Self>,
        transport: Arc<dyn ChatTransport>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        info!(parent: &self.span, "Dispatcher running");
        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
                batch = transport.poll_events() => match batch {
                    Ok(events) => {
                        for event in events {
                            self.enqueue(event);
                        }
                    }
                    Err(e @ (TransportError::ConnectionClosed | TransportError::AuthenticationFailed(_))) => {
                        error!(parent: &self.span, error = %e, "Transport stopped");
                        break Err(e);
                    }
                    Err(e) => {
                        warn!(parent: &self.span, error = %e, retry_in = ?POLL_RETRY_DELAY, "Sync failed");
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            () = tokio::time::sleep(POLL_RETRY_DELAY) => {}
                        }
                    }
                },
            }
        };

        self.drain().await;
        info!(parent: &self.span, "Dispatcher stopped");
        result
    }

    /// Close every lane and wait for queued events to finish
    pub async fn drain(&self) {
        let lanes: Vec<Lane> = self.lanes.lock().drain().map(|(_, lane)| lane).collect();
        for Lane { tx, task } in lanes {
            drop(tx);
            if let Err(e) = task.await {
                error!(parent: &self.span, error = %e, "Lane task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RoomView;
    use crate::transport::InProcessTransport;
    use tokio::sync::Notify;

    const BOT: &str = "@bot:x";
    const ALICE: &str = "@alice:x";
    const BOB: &str = "@bob:x";

    /// Records message bodies; blocks Alice's "wait" until released
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, String)>>,
        release: Notify,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: InboundEvent) -> Result<(), RelayError> {
            if let InboundEvent::Message(m) = event {
                if m.body == "wait" {
                    self.release.notified().await;
                }
                if m.body.starts_with("slow") {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                }
                self.seen.lock().push((m.sender, m.body));
            }
            Ok(())
        }
    }

    fn dispatcher(recorder: Arc<Recorder>, rooms: Vec<String>) -> Arc<EventDispatcher> {
        let gate = Arc::new(AccessGate::new([ALICE, BOB], rooms));
        let registry = HandlerRegistry::new().with(EventKind::Message, recorder);
        Arc::new(EventDispatcher::new(registry, gate, BOT))
    }

    fn msg(sender: &str, body: &str) -> InboundEvent {
        InboundEvent::message(RoomView::plain("!r:x"), sender, body)
    }

    async fn wait_for(recorder: &Recorder, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.seen.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("events were not handled in time");
    }

    #[tokio::test]
    async fn test_dispatch_filters_self_and_strangers() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher(recorder.clone(), vec![]);

        dispatcher.dispatch(msg(BOT, "echo")).await;
        dispatcher.dispatch(msg("@mallory:x", "hi")).await;
        dispatcher.dispatch(msg(ALICE, "hi")).await;

        assert_eq!(recorder.seen.lock().clone(), vec![(ALICE.to_string(), "hi".to_string())]);
    }

    #[tokio::test]
    async fn test_room_allow_list_applies() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher(recorder.clone(), vec!["!other:x".into()]);

        dispatcher.dispatch(msg(ALICE, "hi")).await;
        assert!(recorder.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_ignored() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher(recorder.clone(), vec![]);
        dispatcher
            .dispatch(InboundEvent::undecryptable(RoomView::plain("!r:x"), ALICE))
            .await;
        assert!(recorder.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_lane_preserves_sender_order() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher(recorder.clone(), vec![]);

        dispatcher.enqueue(msg(ALICE, "slow one"));
        dispatcher.enqueue(msg(ALICE, "two"));
        dispatcher.enqueue(msg(ALICE, "slow three"));
        dispatcher.enqueue(msg(ALICE, "four"));
        wait_for(&recorder, 4).await;

        let bodies: Vec<_> = recorder.seen.lock().iter().map(|(_, b)| b.clone()).collect();
        assert_eq!(bodies, vec!["slow one", "two", "slow three", "four"]);
        assert_eq!(dispatcher.lane_count(), 1);
    }

    #[tokio::test]
    async fn test_slow_sender_does_not_block_others() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher(recorder.clone(), vec![]);

        dispatcher.enqueue(msg(ALICE, "wait"));
        dispatcher.enqueue(msg(BOB, "hello"));
        wait_for(&recorder, 1).await;
        assert_eq!(recorder.seen.lock()[0].0, BOB);

        recorder.release.notify_one();
        wait_for(&recorder, 2).await;
        assert_eq!(recorder.seen.lock()[1].0, ALICE);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_drains() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher(recorder.clone(), vec![]);
        let transport = Arc::new(InProcessTransport::new(BOT));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        transport.push(msg(ALICE, "slow a"));
        transport.push(msg(BOB, "b"));
        let runner = tokio::spawn(Arc::clone(&dispatcher).run(transport, shutdown_rx));
        wait_for(&recorder, 1).await;

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
        assert_eq!(recorder.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_invite_handler() {
        let transport = Arc::new(InProcessTransport::new(BOT));
        let gate = Arc::new(AccessGate::new([ALICE], Vec::<String>::new()));
        let handler = Arc::new(InviteHandler::new(transport.clone(), gate.clone(), Span::none()));
        let dispatcher = EventDispatcher::new(
            HandlerRegistry::new().with(EventKind::Invite, handler),
            gate,
            BOT,
        );

        dispatcher
            .dispatch(InboundEvent::invite(RoomView::plain("!ok:x"), ALICE, BOT))
            .await;
        dispatcher
            .dispatch(InboundEvent::invite(RoomView::plain("!spam:x"), "@mallory:x", BOT))
            .await;
        dispatcher
            .dispatch(InboundEvent::invite(RoomView::plain("!notme:x"), ALICE, "@carol:x"))
            .await;

        assert_eq!(transport.joined_rooms(), vec!["!ok:x".to_string()]);
    }
}
