//! Relay Daemon - Chat-to-Assistant Bridge
//!
//! Logs a bot account into a homeserver and answers allow-listed users by
//! running a command-line assistant on their behalf, one session per user.
//!
//! # Usage
//!
//! ```bash
//! # Start with ~/.config/chat-relay/relay.toml
//! relay-daemon
//!
//! # Explicit config file
//! relay-daemon --config /etc/chat-relay/config.toml
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: graceful shutdown; in-flight turns finish first

mod server;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use relay_core::{load_config_from_path, ConfigOverrides};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;

use server::RelayServer;

/// Relay Daemon - bridge a chat bot account to a command-line assistant
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Session database path; overrides the config file
    #[arg(long, env = "RELAY_DATABASE_PATH", value_name = "PATH")]
    database: Option<PathBuf>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(level) = &self.log_level {
            overrides = overrides.with_log_level(level);
        }
        if let Some(path) = &self.database {
            overrides = overrides.with_database_path(path);
        }
        overrides
    }
}

/// Initialize logging; the guard must live as long as the process
fn init_logging(level: &str, file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let (subscriber, guard) = build_subscriber(level, file)?;
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install the log subscriber")?;
    Ok(guard)
}

/// Subscriber writing to `file` when set, stderr otherwise
fn build_subscriber(
    level: &str,
    file: Option<&Path>,
) -> Result<(impl tracing::Subscriber + Send + Sync, Option<WorkerGuard>)> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    let (writer, ansi, guard) = match file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {dir:?}"))?;
            let name = path
                .file_name()
                .context("log file path has no file name")?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            (BoxMakeWriter::new(writer), false, Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), true, None),
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(ansi)
            .with_writer(writer),
    );
    Ok((subscriber, guard))
}

/// Flip `shutdown` on the first SIGTERM or SIGINT
fn spawn_signal_handler(shutdown: watch::Sender<bool>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        let _ = shutdown.send(true);
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config_from_path(args.config.clone()).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let _log_guard = init_logging(&config.log_level, config.log_file.as_deref())?;

    info!("Relay daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(source = ?config.source(), path = ?config.config_file_path, "Configuration loaded");
    info!(
        homeserver = %config.homeserver,
        user = %config.bot_user,
        allowed_users = config.allowed_users.len(),
        allowed_rooms = config.allowed_rooms.len(),
        "Relay identity"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx)?;

    let result = match RelayServer::start(config).await {
        Ok(server) => server.run(shutdown_rx).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            info!("Relay daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            let kind = if e.is_fatal() { "fatal" } else { "runtime" };
            error!(error = %e, kind, "Relay daemon stopped with error");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_reach_config() {
        let args = Args::parse_from([
            "relay-daemon",
            "--log-level",
            "debug",
            "--database",
            "/var/lib/relay/s.db",
        ]);
        let mut config = relay_core::RelayConfig::default();
        args.overrides().apply(&mut config);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.database_path, PathBuf::from("/var/lib/relay/s.db"));
    }

    #[test]
    fn test_log_file_receives_records() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("logs").join("relay.log");

        let (subscriber, guard) = build_subscriber("info", Some(&path)).unwrap();
        let guard = guard.expect("file logging returns a flush guard");
        tracing::subscriber::with_default(subscriber, || {
            info!(target: "relay_daemon", "written to the log file");
        });
        drop(guard);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("written to the log file"), "{content}");
        assert!(!content.contains('\u{1b}'), "no ANSI escapes in files");
    }

    #[test]
    fn test_stderr_logging_has_no_guard() {
        let (_subscriber, guard) = build_subscriber("info", None).unwrap();
        assert!(guard.is_none());
    }

    #[test]
    fn test_no_flags_leave_config_alone() {
        let args = Args::parse_from(["relay-daemon"]);
        let mut config = relay_core::RelayConfig::default();
        let before = config.log_level.clone();
        args.overrides().apply(&mut config);
        assert_eq!(config.log_level, before);
    }
}
