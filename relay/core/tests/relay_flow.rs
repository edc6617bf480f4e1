//! End-to-end relay flows
//!
//! Wires the real store, router, trust manager and dispatcher over the
//! in-process transport, with a shell script standing in for the assistant.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use relay_core::config::DEFAULT_CONTINUATION_PATTERNS;
use relay_core::router::STORE_ERROR_REPLY;
use relay_core::{
    AccessGate, ChatTransport, CliAssistant, CommandRouter, ContinuationExtractor,
    DecryptFailureHandler, EventDispatcher, EventKind, HandlerRegistry, InProcessTransport,
    InboundEvent, InviteHandler, MessageHandler, RoomView, RouterSettings, SessionStore,
    SqliteSessionStore, TrustManager,
};
use tempfile::TempDir;
use tokio::sync::watch;
use tracing::Span;

const BOT: &str = "@relay:example.org";
const ALICE: &str = "@alice:example.org";
const MALLORY: &str = "@mallory:example.org";
const ROOM: &str = "!chat:example.org";

const ASSISTANT_SCRIPT: &str = r#"prompt=$(cat)
case "$prompt" in
  *slow*) sleep 30 ;;
  *long*) printf 'abcdefghijklmnopqrstuvwxyz0123456789abcdefghijklmnop' ;;
  *broken*) echo 'Error: rate limit exceeded' >&2; exit 1 ;;
  *) echo "echo: $prompt"; echo "Session ID: abc123de" >&2 ;;
esac"#;

struct Relay {
    _dirs: (TempDir, TempDir),
    workdir: PathBuf,
    transport: Arc<InProcessTransport>,
    store: Arc<SqliteSessionStore>,
    dispatcher: Arc<EventDispatcher>,
}

impl Relay {
    async fn start() -> Self {
        let state = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let workdir = work.path().to_path_buf();

        let script = state.path().join("assistant.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{ASSISTANT_SCRIPT}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let transport = Arc::new(InProcessTransport::new(BOT));
        let chat: Arc<dyn ChatTransport> = transport.clone();
        let store = Arc::new(
            SqliteSessionStore::open(state.path().join("sessions.db"))
                .await
                .unwrap(),
        );
        let assistant = Arc::new(
            CliAssistant::new(script.to_string_lossy(), &workdir, Duration::from_secs(2))
                .with_extractor(
                    ContinuationExtractor::new(DEFAULT_CONTINUATION_PATTERNS.as_slice()).unwrap(),
                ),
        );

        let gate = Arc::new(AccessGate::new([ALICE], Vec::<String>::new()));
        let trust = Arc::new(TrustManager::new(chat.clone(), gate.clone()));
        let settings = RouterSettings {
            default_working_dir: workdir.clone(),
            preamble: None,
            max_response_length: 30,
            truncation_suffix: "...".to_string(),
            typing_timeout: Duration::from_secs(30),
        };
        let router = Arc::new(CommandRouter::new(
            store.clone(),
            assistant,
            trust.clone(),
            chat.clone(),
            settings,
        ));

        let registry = HandlerRegistry::new()
            .with(
                EventKind::Message,
                Arc::new(MessageHandler::new(router, trust.clone(), Span::none())),
            )
            .with(
                EventKind::Invite,
                Arc::new(InviteHandler::new(chat, gate.clone(), Span::none())),
            )
            .with(EventKind::Undecryptable, Arc::new(DecryptFailureHandler::new(trust)));
        let dispatcher = Arc::new(EventDispatcher::new(registry, gate, BOT));

        Self {
            _dirs: (state, work),
            workdir,
            transport,
            store,
            dispatcher,
        }
    }

    async fn say(&self, sender: &str, text: &str) -> Option<String> {
        let before = self.transport.sent_messages().len();
        self.dispatcher
            .dispatch(InboundEvent::message(RoomView::plain(ROOM), sender, text))
            .await;
        self.transport
            .sent_messages()
            .get(before)
            .map(|m| m.body.clone())
    }
}

#[tokio::test]
async fn test_first_message_creates_session_and_stores_continuation() {
    let relay = Relay::start().await;

    let reply = relay.say(ALICE, "hello").await.unwrap();
    assert_eq!(reply, "echo: hello");

    let session = relay.store.get(ALICE).await.unwrap().unwrap();
    assert_eq!(session.working_dir, relay.workdir);
    assert_eq!(session.continuation_id.as_deref(), Some("abc123de"));
    assert_eq!(session.message_count, 1);

    // Typing was shown for the turn and cleared afterwards
    assert_eq!(
        relay.transport.typing_log(),
        vec![(ROOM.to_string(), true), (ROOM.to_string(), false)]
    );
}

#[tokio::test]
async fn test_unauthorized_sender_gets_nothing() {
    let relay = Relay::start().await;

    assert_eq!(relay.say(MALLORY, "hello").await, None);
    assert_eq!(relay.say(MALLORY, "/new").await, None);

    assert!(relay.store.get(MALLORY).await.unwrap().is_none());
    assert!(relay.transport.sent_messages().is_empty());
    assert!(relay.transport.typing_log().is_empty());
}

#[tokio::test]
async fn test_status_before_any_interaction() {
    let relay = Relay::start().await;

    let reply = relay.say(ALICE, "/status").await.unwrap();
    assert!(reply.contains("No active session"), "{reply}");
    assert!(relay.store.get(ALICE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_new_clears_continuation_but_keeps_directory() {
    let relay = Relay::start().await;
    let sub = relay.workdir.join("project");
    std::fs::create_dir(&sub).unwrap();

    relay.say(ALICE, "hello").await.unwrap();
    let reply = relay.say(ALICE, "/cd project").await.unwrap();
    assert!(reply.contains("Working directory changed"), "{reply}");

    relay.say(ALICE, "/new").await.unwrap();
    let session = relay.store.get(ALICE).await.unwrap().unwrap();
    assert_eq!(session.continuation_id, None);
    assert_eq!(session.message_count, 0);
    assert_eq!(session.working_dir, sub);
}

#[tokio::test]
async fn test_cd_to_missing_directory() {
    let relay = Relay::start().await;
    relay.say(ALICE, "hello").await.unwrap();

    let reply = relay.say(ALICE, "/cd does-not-exist").await.unwrap();
    assert!(reply.starts_with("Directory not found"), "{reply}");
    let session = relay.store.get(ALICE).await.unwrap().unwrap();
    assert_eq!(session.working_dir, relay.workdir);
}

#[tokio::test]
async fn test_trust_twice_reports_nothing_new() {
    let relay = Relay::start().await;
    relay.transport.add_device(ALICE, "PHONE", false);
    relay.transport.add_device(ALICE, "LAPTOP", false);

    let first = relay.say(ALICE, "/trust").await.unwrap();
    assert_eq!(first, "Trusted 2 new device(s) for your account.");
    let second = relay.say(ALICE, "/trust").await.unwrap();
    assert_eq!(second, "All your devices are already trusted.");
}

#[tokio::test]
async fn test_long_response_is_truncated_to_limit() {
    let relay = Relay::start().await;

    let reply = relay.say(ALICE, "something long").await.unwrap();
    assert_eq!(reply.chars().count(), 30);
    assert_eq!(reply, "abcdefghijklmnopqrstuvwxyz0...");
}

#[tokio::test]
async fn test_timeout_reply_and_session_untouched() {
    let relay = Relay::start().await;

    let reply = relay.say(ALICE, "be slow").await.unwrap();
    assert_eq!(reply, "Request timed out. Try a simpler question.");

    let session = relay.store.get(ALICE).await.unwrap().unwrap();
    assert_eq!(session.continuation_id, None);
    assert_eq!(session.message_count, 0);
}

#[tokio::test]
async fn test_classified_failure_reply() {
    let relay = Relay::start().await;

    let reply = relay.say(ALICE, "broken").await.unwrap();
    assert_eq!(reply, "Rate limited. Please wait a moment and try again.");
}

#[tokio::test]
async fn test_store_failure_gives_generic_reply() {
    let relay = Relay::start().await;
    relay.say(ALICE, "hello").await.unwrap();

    // Replace the database file with a directory so every open fails
    let path = relay.store.path().to_path_buf();
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
    std::fs::create_dir(&path).unwrap();

    let reply = relay.say(ALICE, "hello again").await.unwrap();
    assert_eq!(reply, STORE_ERROR_REPLY);
}

#[tokio::test]
async fn test_run_loop_handles_invite_then_message() {
    let relay = Relay::start().await;
    let (tx, rx) = watch::channel(false);
    let transport: Arc<dyn ChatTransport> = relay.transport.clone();
    let running = tokio::spawn(relay.dispatcher.clone().run(transport, rx));

    relay
        .transport
        .push(InboundEvent::invite(RoomView::plain(ROOM), ALICE, BOT));
    relay
        .transport
        .push(InboundEvent::message(RoomView::plain(ROOM), ALICE, "hello"));
    relay
        .transport
        .push(InboundEvent::message(RoomView::plain(ROOM), BOT, "echo: hello"));

    tokio::time::timeout(Duration::from_secs(10), async {
        while relay.transport.sent_messages().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no reply from the run loop");

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(relay.transport.joined_rooms(), vec![ROOM.to_string()]);
    let sent = relay.transport.sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body, "echo: hello");
}
