//! SQLite session store.
//!
//! Two tables:
//! - `sessions`: one row per conversation
//! - `turns`: ordered by an autoincrement `seq`, tagged with the invocation
//!   that produced them
//!
//! Every mutation runs in a single transaction that starts with a write, so
//! the SQLite write lock is taken before anything is read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mentorlink_core::error::StoreError;
use mentorlink_core::message::{Conversation, Role, SessionId, Turn};
use mentorlink_core::session::{Exchange, SessionLocks, SessionStore, SessionSummary, TruncateLimit};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// A durable session store backed by SQLite.
pub struct SqliteSessionStore {
    pool: SqlitePool,
    locks: SessionLocks,
}

impl SqliteSessionStore {
    /// Open (or create) the database at `path`.
    ///
    /// Accepts a plain file path or a `sqlite:` URL.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite://{path}")
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self::from_pool(pool).await?;
        info!("SQLite session store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            locks: SessionLocks::new(),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id          TEXT PRIMARY KEY,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("sessions table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS turns (
                seq            INTEGER PRIMARY KEY AUTOINCREMENT,
                id             TEXT UNIQUE NOT NULL,
                session_id     TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                role           TEXT NOT NULL,
                content        TEXT NOT NULL,
                citations      TEXT NOT NULL DEFAULT '[]',
                invocation_id  TEXT,
                created_at     TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("turns table: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id, seq)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("session index: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_turns_invocation ON turns(session_id, invocation_id)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("invocation index: {e}")))?;

        debug!("SQLite session migrations complete");
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("begin transaction: {e}")))
    }

    /// Insert the session row if missing and bump `updated_at`.
    async fn touch(tx: &mut Transaction<'static, Sqlite>, id: &SessionId) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO sessions (id, created_at, updated_at) VALUES (?1, ?2, ?2)
             ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(&id.0)
        .bind(&now)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("touch session: {e}")))?;
        Ok(())
    }

    async fn insert_turn(tx: &mut Transaction<'static, Sqlite>, id: &SessionId, turn: &Turn) -> Result<(), StoreError> {
        let citations = serde_json::to_string(&turn.citations)
            .map_err(|e| StoreError::QueryFailed(format!("encode citations: {e}")))?;
        sqlx::query(
            "INSERT INTO turns (id, session_id, role, content, citations, invocation_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&turn.id)
        .bind(&id.0)
        .bind(turn.role.as_str())
        .bind(&turn.content)
        .bind(citations)
        .bind(&turn.invocation_id)
        .bind(turn.created_at.to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("insert turn: {e}")))?;
        Ok(())
    }

    async fn load(executor: &mut sqlx::SqliteConnection, id: &SessionId) -> Result<Option<Conversation>, StoreError> {
        let Some(session) = sqlx::query("SELECT created_at, updated_at FROM sessions WHERE id = ?1")
            .bind(&id.0)
            .fetch_optional(&mut *executor)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("load session: {e}")))?
        else {
            return Ok(None);
        };

        let rows = sqlx::query(
            "SELECT id, role, content, citations, invocation_id, created_at
             FROM turns WHERE session_id = ?1 ORDER BY seq ASC",
        )
        .bind(&id.0)
        .fetch_all(&mut *executor)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("load turns: {e}")))?;

        let turns = rows.iter().map(row_to_turn).collect::<Result<Vec<_>, _>>()?;

        Ok(Some(Conversation {
            id: id.clone(),
            turns,
            created_at: parse_time(&session.try_get::<String, _>("created_at").map_err(column_error)?)?,
            updated_at: parse_time(&session.try_get::<String, _>("updated_at").map_err(column_error)?)?,
        }))
    }

    async fn load_existing(executor: &mut sqlx::SqliteConnection, id: &SessionId) -> Result<Conversation, StoreError> {
        Self::load(executor, id)
            .await?
            .ok_or_else(|| StoreError::QueryFailed(format!("session '{id}' has no row")))
    }
}

fn column_error(e: sqlx::Error) -> StoreError {
    StoreError::QueryFailed(format!("column: {e}"))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{s}': {e}")))
}

/// Parse a `Turn` from a SQLite row.
fn row_to_turn(row: &sqlx::sqlite::SqliteRow) -> Result<Turn, StoreError> {
    let role: String = row.try_get("role").map_err(column_error)?;
    let citations: String = row.try_get("citations").map_err(column_error)?;
    let created_at: String = row.try_get("created_at").map_err(column_error)?;

    Ok(Turn {
        id: row.try_get("id").map_err(column_error)?,
        role: Role::parse(&role).ok_or_else(|| StoreError::Corrupt(format!("unknown role '{role}'")))?,
        content: row.try_get("content").map_err(column_error)?,
        citations: serde_json::from_str(&citations)
            .map_err(|e| StoreError::Corrupt(format!("citations '{citations}': {e}")))?,
        invocation_id: row.try_get("invocation_id").map_err(column_error)?,
        created_at: parse_time(&created_at)?,
    })
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, id: &SessionId) -> Result<Conversation, StoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("INSERT OR IGNORE INTO sessions (id, created_at, updated_at) VALUES (?1, ?2, ?2)")
            .bind(&id.0)
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("create session: {e}")))?;

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StoreError::Storage(format!("acquire connection: {e}")))?;
        Self::load_existing(&mut conn, id).await
    }

    async fn find(&self, id: &SessionId) -> Result<Option<Conversation>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StoreError::Storage(format!("acquire connection: {e}")))?;
        Self::load(&mut conn, id).await
    }

    async fn append(&self, id: &SessionId, turn: Turn) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        Self::touch(&mut tx, id).await?;
        Self::insert_turn(&mut tx, id, &turn).await?;
        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("commit append: {e}")))
    }

    async fn commit_exchange(&self, id: &SessionId, exchange: Exchange) -> Result<bool, StoreError> {
        let mut tx = self.begin().await?;
        Self::touch(&mut tx, id).await?;

        let existing = sqlx::query("SELECT 1 FROM turns WHERE session_id = ?1 AND invocation_id = ?2 LIMIT 1")
            .bind(&id.0)
            .bind(&exchange.invocation_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("check invocation: {e}")))?;
        if existing.is_some() {
            debug!(session_id = %id, invocation_id = %exchange.invocation_id, "Exchange already committed");
            // Dropping the transaction rolls back the touch.
            return Ok(false);
        }

        for turn in exchange.into_turns() {
            Self::insert_turn(&mut tx, id, &turn).await?;
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("commit exchange: {e}")))?;
        Ok(true)
    }

    async fn truncate(&self, id: &SessionId, limit: TruncateLimit) -> Result<usize, StoreError> {
        let mut tx = self.begin().await?;
        Self::touch(&mut tx, id).await?;

        let mut conv = Self::load_existing(&mut tx, id).await?;
        let dropped = limit.apply(&mut conv);
        if dropped == 0 {
            return Ok(0);
        }

        sqlx::query(
            "DELETE FROM turns WHERE seq IN
             (SELECT seq FROM turns WHERE session_id = ?1 ORDER BY seq ASC LIMIT ?2)",
        )
        .bind(&id.0)
        .bind(dropped as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("truncate: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("commit truncate: {e}")))?;
        Ok(dropped)
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT s.id, s.created_at, s.updated_at, COUNT(t.seq) AS turn_count
             FROM sessions s LEFT JOIN turns t ON t.session_id = s.id
             GROUP BY s.id ORDER BY s.updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("list sessions: {e}")))?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(column_error)?;
                let created_at: String = row.try_get("created_at").map_err(column_error)?;
                let updated_at: String = row.try_get("updated_at").map_err(column_error)?;
                let turn_count: i64 = row.try_get("turn_count").map_err(column_error)?;
                Ok(SessionSummary {
                    id: SessionId(id),
                    turn_count: turn_count as usize,
                    created_at: parse_time(&created_at)?,
                    updated_at: parse_time(&updated_at)?,
                })
            })
            .collect()
    }

    async fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        let mut tx = self.begin().await?;
        sqlx::query("DELETE FROM turns WHERE session_id = ?1")
            .bind(&id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("delete turns: {e}")))?;
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(&id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("delete session: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("commit delete: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    fn locks(&self) -> &SessionLocks {
        &self.locks
    }
}
