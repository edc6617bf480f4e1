//! SQLite-backed session store
//!
//! Each operation opens its own connection on a blocking worker, so no
//! connection is ever shared between tasks. Timestamps are stored as
//! fixed-width RFC 3339 strings (microseconds, `Z` suffix), which makes
//! lexical and chronological order agree inside SQL.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use tracing::{debug, info, Span};

use crate::keyed_lock::KeyedMutex;

use super::{
    HistoryRecord, MessageRole, Session, SessionStats, SessionStore, StoreError,
    MAX_HISTORY_CONTENT,
};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
    user_id         TEXT PRIMARY KEY,
    continuation_id TEXT,
    working_dir     TEXT NOT NULL,
    last_active     TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    message_count   INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_sessions_last_active ON sessions(last_active);

CREATE TABLE IF NOT EXISTS message_history (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id   TEXT NOT NULL,
    role      TEXT NOT NULL,
    content   TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_user ON message_history(user_id);
";

const SESSION_COLUMNS: &str =
    "user_id, continuation_id, working_dir, last_active, created_at, message_count";

/// [`SessionStore`] over a SQLite database file
pub struct SqliteSessionStore {
    path: Arc<PathBuf>,
    locks: KeyedMutex,
    span: Span,
}

impl SqliteSessionStore {
    /// Open (creating if needed) the database at `path`
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the file or schema cannot be created.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self {
            path: Arc::new(path.into()),
            locks: KeyedMutex::new(),
            span: Span::none(),
        };
        store
            .run(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(store)
    }

    /// Attach the span store events are logged under
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Database location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Audit log entries for a user, oldest first
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] on database failure.
    pub async fn history(&self, user_id: &str) -> Result<Vec<HistoryRecord>, StoreError> {
        let user_id = user_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, role, content, timestamp FROM message_history
                 WHERE user_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                let tag: String = row.get(1)?;
                let role = MessageRole::parse(&tag).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        1,
                        Type::Text,
                        format!("unknown role {tag:?}").into(),
                    )
                })?;
                Ok(HistoryRecord {
                    user_id: row.get(0)?,
                    role,
                    content: row.get(2)?,
                    timestamp: timestamp_column(row, 3)?,
                })
            })?;
            let records = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let path = Arc::clone(&self.path);
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&path)?;
            op(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store worker failed: {e}")))?
    }

    /// Run a single-row update that also bumps `last_active`
    async fn touch(
        &self,
        user_id: &str,
        assignments: &'static str,
        value: Option<String>,
    ) -> Result<(), StoreError> {
        let _guard = self.locks.lock(user_id).await;
        let user_id = user_id.to_string();
        let now = timestamp(Utc::now());
        self.run(move |conn| {
            let sql = format!(
                "UPDATE sessions SET {assignments}, last_active = MAX(last_active, ?1)
                 WHERE user_id = ?2"
            );
            let changed = match value {
                Some(value) => conn.execute(&sql, params![now, user_id, value])?,
                None => conn.execute(&sql, params![now, user_id])?,
            };
            if changed == 0 {
                return Err(StoreError::NotFound(user_id));
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, user_id: &str) -> Result<Option<Session>, StoreError> {
        let _guard = self.locks.lock(user_id).await;
        let user_id = user_id.to_string();
        self.run(move |conn| select_session(conn, &user_id)).await
    }

    async fn get_or_create(
        &self,
        user_id: &str,
        default_dir: &Path,
    ) -> Result<Session, StoreError> {
        let working_dir = checked_dir(default_dir)?;
        let _guard = self.locks.lock(user_id).await;
        let user_id = user_id.to_string();
        let now = timestamp(Utc::now());

        let (session, created) = self
            .run(move |conn| {
                let tx = conn.transaction()?;
                let created = tx.execute(
                    "INSERT INTO sessions (user_id, working_dir, last_active, created_at, message_count)
                     VALUES (?1, ?2, ?3, ?3, 0)
                     ON CONFLICT(user_id) DO NOTHING",
                    params![user_id, working_dir, now],
                )? == 1;
                if !created {
                    tx.execute(
                        "UPDATE sessions SET last_active = MAX(last_active, ?1) WHERE user_id = ?2",
                        params![now, user_id],
                    )?;
                }
                let session = select_session(&tx, &user_id)?
                    .ok_or_else(|| StoreError::NotFound(user_id.clone()))?;
                tx.commit()?;
                Ok((session, created))
            })
            .await?;

        if created {
            info!(parent: &self.span, user = %session.user_id, dir = %session.working_dir.display(), "Created session");
        }
        Ok(session)
    }

    async fn update_continuation_id(
        &self,
        user_id: &str,
        continuation_id: &str,
    ) -> Result<(), StoreError> {
        debug!(parent: &self.span, user = %user_id, "Updating continuation id");
        self.touch(user_id, "continuation_id = ?3", Some(continuation_id.to_string()))
            .await
    }

    async fn update_working_dir(&self, user_id: &str, dir: &Path) -> Result<(), StoreError> {
        let dir = checked_dir(dir)?;
        debug!(parent: &self.span, user = %user_id, dir = %dir, "Updating working directory");
        self.touch(user_id, "working_dir = ?3", Some(dir)).await
    }

    async fn increment_message_count(&self, user_id: &str) -> Result<(), StoreError> {
        self.touch(user_id, "message_count = message_count + 1", None)
            .await
    }

    async fn reset(&self, user_id: &str) -> Result<(), StoreError> {
        info!(parent: &self.span, user = %user_id, "Resetting session");
        self.touch(user_id, "continuation_id = NULL, message_count = 0", None)
            .await
    }

    async fn sweep_idle(&self, max_age_hours: u64) -> Result<usize, StoreError> {
        let age = i64::try_from(max_age_hours)
            .ok()
            .and_then(TimeDelta::try_hours);
        let Some(cutoff) = age.and_then(|age| Utc::now().checked_sub_signed(age)) else {
            return Ok(0);
        };
        let cutoff = timestamp(cutoff);

        let cleared = self
            .run(move |conn| {
                Ok(conn.execute(
                    "UPDATE sessions SET continuation_id = NULL
                     WHERE last_active < ?1 AND continuation_id IS NOT NULL",
                    params![cutoff],
                )?)
            })
            .await?;

        if cleared > 0 {
            info!(parent: &self.span, cleared, max_age_hours, "Swept idle sessions");
        }
        Ok(cleared)
    }

    async fn add_history(
        &self,
        user_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<(), StoreError> {
        let user_id = user_id.to_string();
        let content: String = content.chars().take(MAX_HISTORY_CONTENT).collect();
        let now = timestamp(Utc::now());
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO message_history (user_id, role, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, role.as_str(), content, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn stats(&self) -> Result<SessionStats, StoreError> {
        self.run(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*),
                        COUNT(continuation_id),
                        COALESCE(SUM(message_count), 0)
                 FROM sessions",
                [],
                |row| {
                    Ok(SessionStats {
                        total_sessions: row.get::<_, i64>(0)?.unsigned_abs(),
                        active_sessions: row.get::<_, i64>(1)?.unsigned_abs(),
                        total_messages: row.get::<_, i64>(2)?.unsigned_abs(),
                    })
                },
            )?)
        })
        .await
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|err| {
            StoreError::Unavailable(format!("cannot create {}: {err}", parent.display()))
        })?;
    }

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    Ok(conn)
}

fn select_session(conn: &Connection, user_id: &str) -> Result<Option<Session>, StoreError> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ?1");
    Ok(conn
        .query_row(&sql, params![user_id], session_from_row)
        .optional()?)
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        user_id: row.get(0)?,
        continuation_id: row.get(1)?,
        working_dir: PathBuf::from(row.get::<_, String>(2)?),
        last_active: timestamp_column(row, 3)?,
        created_at: timestamp_column(row, 4)?,
        message_count: row.get(5)?,
    })
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn checked_dir(dir: &Path) -> Result<String, StoreError> {
    if dir.as_os_str().is_empty() || !dir.is_absolute() {
        return Err(StoreError::InvalidPath(dir.to_path_buf()));
    }
    Ok(dir.to_string_lossy().into_owned())
}
