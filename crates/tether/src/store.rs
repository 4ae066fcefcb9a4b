//! Durable event log and projections, backed by SQLite.
//!
//! The `events` table is append-only; its AUTOINCREMENT rowid is the cursor
//! and the sole ordering contract for replay. Threads, turns, items, pending
//! approvals, and the auth state are denormalized projections updated from
//! the same notifications.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::debug;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use tether_protocol::RuntimeEvent;

/// Upper bound on events returned by one replay query.
pub const REPLAY_PAGE_SIZE: i64 = 500;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    cursor INTEGER PRIMARY KEY AUTOINCREMENT,
    thread_id TEXT,
    turn_id TEXT,
    method TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_thread ON events(thread_id, cursor);

CREATE TABLE IF NOT EXISTS threads (
    id TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS turns (
    id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS items (
    id TEXT PRIMARY KEY,
    thread_id TEXT,
    turn_id TEXT,
    status TEXT NOT NULL,
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS approvals (
    request_id TEXT PRIMARY KEY,
    method TEXT NOT NULL,
    thread_id TEXT,
    params TEXT,
    decision TEXT,
    requested_at TEXT NOT NULL,
    resolved_at TEXT
);

CREATE TABLE IF NOT EXISTS auth_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    mode TEXT,
    account TEXT,
    updated_at TEXT NOT NULL
);
"#;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the event log at the given path.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .with_context(|| format!("opening event log {}", path.display()))?;
        Self::from_pool(pool).await
    }

    /// In-memory log. One connection, since each SQLite memory DB is private
    /// to its connection.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("opening in-memory event log")?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("creating event log schema")?;
        Ok(Self { pool })
    }

    /// Append one event. The cursor is assigned here and nowhere else.
    pub async fn insert_event(
        &self,
        thread_id: Option<&str>,
        turn_id: Option<&str>,
        method: &str,
        payload: &Value,
    ) -> Result<RuntimeEvent> {
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO events (thread_id, turn_id, method, payload, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(thread_id)
        .bind(turn_id)
        .bind(method)
        .bind(payload.to_string())
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("appending event")?;

        let cursor = result.last_insert_rowid();
        debug!("event {} appended at cursor {}", method, cursor);
        Ok(RuntimeEvent {
            cursor,
            thread_id: thread_id.map(str::to_string),
            turn_id: turn_id.map(str::to_string),
            method: method.to_string(),
            payload: payload.clone(),
            created_at,
        })
    }

    /// Events with cursor strictly greater than `cursor`, ascending, capped
    /// at `limit`. A thread id narrows the scope to that thread.
    pub async fn list_events_since(
        &self,
        thread_id: Option<&str>,
        cursor: i64,
        limit: i64,
    ) -> Result<Vec<RuntimeEvent>> {
        let rows = match thread_id {
            Some(thread_id) => {
                sqlx::query(
                    "SELECT cursor, thread_id, turn_id, method, payload, created_at
                     FROM events WHERE cursor > ? AND thread_id = ?
                     ORDER BY cursor ASC LIMIT ?",
                )
                .bind(cursor)
                .bind(thread_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT cursor, thread_id, turn_id, method, payload, created_at
                     FROM events WHERE cursor > ?
                     ORDER BY cursor ASC LIMIT ?",
                )
                .bind(cursor)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("reading events")?;

        rows.iter().map(event_from_row).collect()
    }

    pub async fn upsert_thread(&self, id: &str, payload: &Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO threads (id, payload, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload,
                                           updated_at = excluded.updated_at",
        )
        .bind(id)
        .bind(payload.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("upserting thread")?;
        Ok(())
    }

    pub async fn upsert_turn(&self, thread_id: &str, id: &str, payload: &Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO turns (id, thread_id, payload, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload,
                                           updated_at = excluded.updated_at",
        )
        .bind(id)
        .bind(thread_id)
        .bind(payload.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("upserting turn")?;
        Ok(())
    }

    pub async fn upsert_item(
        &self,
        thread_id: Option<&str>,
        turn_id: Option<&str>,
        id: &str,
        status: &str,
        payload: &Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO items (id, thread_id, turn_id, status, payload, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET thread_id = excluded.thread_id,
                                           turn_id = excluded.turn_id,
                                           status = excluded.status,
                                           payload = excluded.payload,
                                           updated_at = excluded.updated_at",
        )
        .bind(thread_id)
        .bind(turn_id)
        .bind(id)
        .bind(status)
        .bind(payload.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("upserting item")?;
        Ok(())
    }

    pub async fn insert_approval(
        &self,
        request_id: &str,
        method: &str,
        thread_id: Option<&str>,
        params: &Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO approvals (request_id, method, thread_id, params, requested_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(request_id)
        .bind(method)
        .bind(thread_id)
        .bind(params.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("recording approval request")?;
        Ok(())
    }

    /// Record an approval decision. Returns false when the request id is
    /// unknown or already resolved.
    pub async fn resolve_approval(&self, request_id: &str, decision: &Value) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE approvals SET decision = ?, resolved_at = ?
             WHERE request_id = ? AND decision IS NULL",
        )
        .bind(decision.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(request_id)
        .execute(&self.pool)
        .await
        .context("recording approval decision")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn upsert_auth_state(&self, mode: Option<&str>, account: &Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO auth_state (id, mode, account, updated_at) VALUES (1, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET mode = excluded.mode,
                                           account = excluded.account,
                                           updated_at = excluded.updated_at",
        )
        .bind(mode)
        .bind(account.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("upserting auth state")?;
        Ok(())
    }
}

fn event_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<RuntimeEvent> {
    let payload: String = row.get("payload");
    let created_at: String = row.get("created_at");
    Ok(RuntimeEvent {
        cursor: row.get("cursor"),
        thread_id: row.get("thread_id"),
        turn_id: row.get("turn_id"),
        method: row.get("method"),
        payload: serde_json::from_str(&payload).context("decoding event payload")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .context("decoding event timestamp")?
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn cursors_are_assigned_in_insert_order() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let first = store
            .insert_event(Some("t1"), None, "thread/started", &json!({"threadId": "t1"}))
            .await
            .unwrap();
        let second = store
            .insert_event(Some("t1"), Some("u1"), "turn/started", &json!({"turnId": "u1"}))
            .await
            .unwrap();
        assert!(second.cursor > first.cursor);
    }

    #[tokio::test]
    async fn replay_is_ascending_and_strictly_after_cursor() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        for i in 0..5 {
            store
                .insert_event(Some("t1"), None, "item/updated", &json!({"i": i}))
                .await
                .unwrap();
        }
        let events = store.list_events_since(None, 2, 100).await.unwrap();
        let cursors: Vec<i64> = events.iter().map(|e| e.cursor).collect();
        assert_eq!(cursors, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn replay_filters_by_thread_and_honors_limit() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        for i in 0..4 {
            let thread = if i % 2 == 0 { "t1" } else { "t2" };
            store
                .insert_event(Some(thread), None, "item/updated", &json!({"i": i}))
                .await
                .unwrap();
        }
        let t1 = store.list_events_since(Some("t1"), 0, 100).await.unwrap();
        assert_eq!(t1.len(), 2);
        assert!(t1.iter().all(|e| e.thread_id.as_deref() == Some("t1")));

        let capped = store.list_events_since(None, 0, 3).await.unwrap();
        assert_eq!(capped.len(), 3);
    }

    #[tokio::test]
    async fn round_trips_payload_and_timestamp() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let payload = json!({"item": {"id": "i1", "text": "hello"}});
        let inserted = store
            .insert_event(Some("t1"), Some("u1"), "item/completed", &payload)
            .await
            .unwrap();
        let read = store
            .list_events_since(None, 0, 10)
            .await
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(read.cursor, inserted.cursor);
        assert_eq!(read.payload, payload);
        assert_eq!(read.method, "item/completed");
        assert_eq!(read.turn_id.as_deref(), Some("u1"));
        assert!((read.created_at - inserted.created_at).num_seconds().abs() < 1);
    }

    #[tokio::test]
    async fn approval_resolves_at_most_once() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store
            .insert_approval("42", "item/commandExecution/requestApproval", Some("t1"), &json!({}))
            .await
            .unwrap();

        assert!(store.resolve_approval("42", &json!("accept")).await.unwrap());
        assert!(!store.resolve_approval("42", &json!("reject")).await.unwrap());
        assert!(!store.resolve_approval("unknown", &json!("accept")).await.unwrap());
    }

    #[tokio::test]
    async fn projections_upsert_in_place() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store
            .upsert_thread("t1", &json!({"title": "first"}))
            .await
            .unwrap();
        store
            .upsert_thread("t1", &json!({"title": "second"}))
            .await
            .unwrap();
        store
            .upsert_turn("t1", "u1", &json!({"status": "active"}))
            .await
            .unwrap();
        store
            .upsert_item(Some("t1"), Some("u1"), "i1", "started", &json!({}))
            .await
            .unwrap();
        store
            .upsert_item(Some("t1"), Some("u1"), "i1", "completed", &json!({}))
            .await
            .unwrap();
        store
            .upsert_auth_state(Some("chatgpt"), &json!({"email": "dev@example.com"}))
            .await
            .unwrap();
    }
}
