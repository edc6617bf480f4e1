//! Relay server wiring
//!
//! Builds every component from a validated [`RelayConfig`] and runs the
//! dispatcher until shutdown. Startup order matters: credentials are checked
//! before anything touches the database, and the first sync runs before
//! device trust so room state is known.
//!
//! With `matrix.encryption` set (the default) the relay runs on the
//! end-to-end encrypted client; otherwise on the plain HTTP client, which
//! only serves unencrypted rooms.

use std::path::Path;
use std::sync::Arc;

use relay_core::{
    AccessGate, Assistant, ChatTransport, CliAssistant, CommandRouter, DecryptFailureHandler,
    EventDispatcher, EventKind, HandlerRegistry, InviteHandler, MatrixHttpTransport,
    MatrixSdkTransport, MessageHandler, RelayConfig, RelayError, RouterSettings, SessionStore,
    SqliteSessionStore, TransportError, TrustManager,
};
use tokio::sync::watch;
use tracing::{info, info_span, warn};

/// The homeserver client the relay runs on
enum Homeserver {
    Encrypted(Arc<MatrixSdkTransport>),
    Plain(Arc<MatrixHttpTransport>),
}

impl Homeserver {
    async fn connect(config: &RelayConfig, token: &str) -> Result<Self, TransportError> {
        if config.encryption {
            let transport = MatrixSdkTransport::connect(
                &config.homeserver,
                token,
                &config.bot_user,
                &config.store_path,
                config.sync_timeout,
            )
            .await?;
            Ok(Self::Encrypted(Arc::new(transport)))
        } else {
            warn!("Encryption disabled; encrypted rooms will not be served");
            let transport = MatrixHttpTransport::connect(
                &config.homeserver,
                token,
                &config.bot_user,
                config.sync_timeout,
            )
            .await?;
            Ok(Self::Plain(Arc::new(transport)))
        }
    }

    async fn initial_sync(&self) -> Result<(), TransportError> {
        match self {
            Self::Encrypted(transport) => transport.initial_sync().await,
            Self::Plain(transport) => transport.initial_sync().await,
        }
    }

    fn chat(&self) -> Arc<dyn ChatTransport> {
        match self {
            Self::Encrypted(transport) => transport.clone(),
            Self::Plain(transport) => transport.clone(),
        }
    }
}

/// A fully wired relay, ready to run
pub struct RelayServer {
    config: RelayConfig,
    transport: Arc<dyn ChatTransport>,
    store: Arc<SqliteSessionStore>,
    dispatcher: Arc<EventDispatcher>,
}

impl RelayServer {
    /// Authenticate, open storage and build the handler graph
    ///
    /// # Errors
    ///
    /// [`RelayError::AuthFailure`] for a missing, empty or rejected token;
    /// store or config errors otherwise.
    pub async fn start(config: RelayConfig) -> Result<Self, RelayError> {
        let token = read_access_token(config.access_token_file.as_deref()).await?;

        let homeserver = Homeserver::connect(&config, &token)
            .await
            .map_err(classify_transport_error)?;

        let store = SqliteSessionStore::open(config.database_path.clone())
            .await?
            .with_span(info_span!("store"));
        let store = Arc::new(store);
        info!(path = ?store.path(), "Session store ready");

        let assistant =
            CliAssistant::from_config(&config)?.with_span(info_span!("assistant", command = %config.assistant_command));
        if assistant.health_check().await {
            info!(command = %config.assistant_command, "Assistant command available");
        } else {
            warn!(command = %config.assistant_command, "Assistant health check failed; turns will report errors");
        }
        let assistant: Arc<dyn Assistant> = Arc::new(assistant);

        homeserver
            .initial_sync()
            .await
            .map_err(classify_transport_error)?;

        let chat = homeserver.chat();
        let gate = Arc::new(
            AccessGate::new(config.allowed_users.clone(), config.allowed_rooms.clone())
                .with_span(info_span!("access")),
        );
        let trust = Arc::new(
            TrustManager::new(chat.clone(), gate.clone()).with_span(info_span!("trust")),
        );
        let trusted = trust.auto_trust_allowed_users(&config.allowed_users).await;
        info!(trusted, "Device trust pass complete");

        let sessions: Arc<dyn SessionStore> = store.clone();
        let router = Arc::new(
            CommandRouter::new(
                sessions,
                assistant,
                trust.clone(),
                chat.clone(),
                RouterSettings::from_config(&config),
            )
            .with_span(info_span!("router")),
        );

        let registry = HandlerRegistry::new()
            .with(
                EventKind::Message,
                Arc::new(MessageHandler::new(router, trust.clone(), info_span!("message"))),
            )
            .with(
                EventKind::Invite,
                Arc::new(InviteHandler::new(chat, gate.clone(), info_span!("invite"))),
            )
            .with(
                EventKind::Undecryptable,
                Arc::new(DecryptFailureHandler::new(trust)),
            );
        let dispatcher = Arc::new(
            EventDispatcher::new(registry, gate, config.bot_user.clone())
                .with_span(info_span!("dispatcher")),
        );

        Ok(Self {
            config,
            transport: homeserver.chat(),
            store,
            dispatcher,
        })
    }

    /// Run until `shutdown` flips, then stop background work
    ///
    /// # Errors
    ///
    /// Returns the transport error that ended the sync loop, if any.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
        self.log_stats("startup").await;

        let sweeper = relay_core::spawn_idle_sweeper(
            self.store.clone(),
            self.config.max_idle_hours,
            self.config.sweep_interval,
            shutdown.clone(),
            info_span!("sweeper"),
        );

        info!(user = %self.config.bot_user, "Relay listening for messages");
        let result = self
            .dispatcher
            .clone()
            .run(self.transport.clone(), shutdown)
            .await
            .map_err(classify_transport_error);

        sweeper.abort();
        if let Err(e) = sweeper.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Idle sweeper ended abnormally");
            }
        }

        self.log_stats("shutdown").await;
        result
    }

    async fn log_stats(&self, phase: &str) {
        match self.store.stats().await {
            Ok(stats) => info!(
                phase,
                total_sessions = stats.total_sessions,
                active_sessions = stats.active_sessions,
                total_messages = stats.total_messages,
                "Session stats"
            ),
            Err(e) => warn!(phase, error = %e, "Could not read session stats"),
        }
    }
}

/// Read the token file; the token is the first non-blank line
async fn read_access_token(path: Option<&Path>) -> Result<String, RelayError> {
    let path = path.ok_or_else(|| {
        RelayError::AuthFailure("no access token file configured".to_string())
    })?;
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        RelayError::AuthFailure(format!("cannot read access token file {}: {e}", path.display()))
    })?;
    content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| {
            RelayError::AuthFailure(format!("access token file {} is empty", path.display()))
        })
}

fn classify_transport_error(e: TransportError) -> RelayError {
    match e {
        TransportError::AuthenticationFailed(reason) => RelayError::AuthFailure(reason),
        other => RelayError::Transport(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_token_is_first_nonblank_line() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "\n  syt_secret  \nignored").unwrap();
        let token = read_access_token(Some(file.path())).await.unwrap();
        assert_eq!(token, "syt_secret");
    }

    #[tokio::test]
    async fn test_missing_token_file_is_fatal() {
        let err = read_access_token(Some(Path::new("/nonexistent/relay-token")))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, RelayError::AuthFailure(_)));
    }

    #[tokio::test]
    async fn test_empty_token_file_is_fatal() {
        let file = NamedTempFile::new().unwrap();
        let err = read_access_token(Some(file.path())).await.unwrap_err();
        assert!(matches!(err, RelayError::AuthFailure(_)));
    }

    #[test]
    fn test_rejected_credentials_map_to_auth_failure() {
        let err = classify_transport_error(TransportError::AuthenticationFailed("401".into()));
        assert!(err.is_fatal());
        let err = classify_transport_error(TransportError::ConnectionClosed);
        assert!(!err.is_fatal());
    }
}
