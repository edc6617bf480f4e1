//! Periodic idle-session sweep

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Span};

use super::SessionStore;

/// Run [`SessionStore::sweep_idle`] every `interval` until `shutdown` is set
///
/// The first sweep runs immediately.
pub fn spawn_idle_sweeper(
    store: Arc<dyn SessionStore>,
    max_idle_hours: u64,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    span: Span,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match store.sweep_idle(max_idle_hours).await {
                        Ok(cleared) => debug!(parent: &span, cleared, "Idle sweep complete"),
                        Err(e) => {
                            error!(parent: &span, error = %e, "Idle sweep failed");
                            continue;
                        }
                    }
                    match store.stats().await {
                        Ok(stats) => info!(
                            parent: &span,
                            total_sessions = stats.total_sessions,
                            active_sessions = stats.active_sessions,
                            total_messages = stats.total_messages,
                            "Session stats"
                        ),
                        Err(e) => warn!(parent: &span, error = %e, "Could not read session stats"),
                    }
                }
            }
        }
        debug!(parent: &span, "Idle sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SqliteSessionStore;
    use std::path::Path;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sweeper_runs_and_stops() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            SqliteSessionStore::open(dir.path().join("s.db"))
                .await
                .unwrap(),
        );
        store.get_or_create("@a:x", Path::new("/srv")).await.unwrap();
        store.update_continuation_id("@a:x", "abc").await.unwrap();

        let (tx, rx) = watch::channel(false);
        // Zero hours: anything not touched in this instant counts as idle
        let handle = spawn_idle_sweeper(
            store.clone(),
            0,
            Duration::from_millis(20),
            rx,
            Span::none(),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let session = store.get("@a:x").await.unwrap().unwrap();
                if session.continuation_id.is_none() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sweep never cleared the continuation");

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
