//! SQLite-backed review storage

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{InboxError, Result};

use super::{ReviewQueueEntry, ReviewStatus, ReviewStore};

const REVIEW_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS review_entries (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL,
    status TEXT NOT NULL,
    revision INTEGER NOT NULL,
    draft_json TEXT NOT NULL,
    original_body TEXT,
    deferred_until TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_review_entries_status
    ON review_entries (status, created_at);
";

const SELECT_COLUMNS: &str = "id, status, revision, draft_json, original_body, deferred_until, created_at, updated_at";

#[derive(Clone)]
pub struct SqliteReviewStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteReviewStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        schema_version(&conn)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|p| p.into_inner());
            f(&conn)
        })
        .await
        .map_err(|e| InboxError::Storage {
            message: format!("storage task failed: {}", e),
        })?
    }
}

fn schema_version(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn migrate(conn: &Connection) -> Result<()> {
    let current = schema_version(conn)?;
    if current > REVIEW_SCHEMA_VERSION {
        return Err(InboxError::Storage {
            message: format!(
                "review database schema {} is newer than supported {}",
                current, REVIEW_SCHEMA_VERSION
            ),
        });
    }
    if current < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        conn.execute("PRAGMA user_version = 1", [])?;
        tracing::info!("review database migrated to schema 1");
    }
    Ok(())
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

struct RawRow {
    id: String,
    status: String,
    revision: u32,
    draft_json: String,
    original_body: Option<String>,
    deferred_until: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            revision: row.get(2)?,
            draft_json: row.get(3)?,
            original_body: row.get(4)?,
            deferred_until: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_entry(self) -> Result<ReviewQueueEntry> {
        Ok(ReviewQueueEntry {
            status: self.status.parse()?,
            draft: serde_json::from_str(&self.draft_json)?,
            revision: self.revision,
            original_body: self.original_body,
            deferred_until: self
                .deferred_until
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
        })
    }
}

#[async_trait]
impl ReviewStore for SqliteReviewStore {
    async fn save(&self, entry: &ReviewQueueEntry) -> Result<()> {
        let draft_json = serde_json::to_string(&entry.draft)?;
        let entry = entry.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "
                INSERT INTO review_entries (
                    id, message_id, status, revision, draft_json,
                    original_body, deferred_until, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    revision = excluded.revision,
                    draft_json = excluded.draft_json,
                    original_body = excluded.original_body,
                    deferred_until = excluded.deferred_until,
                    updated_at = excluded.updated_at
                ",
                params![
                    entry.id,
                    entry.draft.message_id,
                    entry.status.as_str(),
                    entry.revision,
                    draft_json,
                    entry.original_body,
                    entry.deferred_until.as_ref().map(timestamp),
                    timestamp(&entry.created_at),
                    timestamp(&entry.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn load(&self, id: &str) -> Result<Option<ReviewQueueEntry>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {} FROM review_entries WHERE id = ?1", SELECT_COLUMNS),
                    [&id],
                    RawRow::from_row,
                )
                .optional()?;
            raw.map(RawRow::into_entry).transpose()
        })
        .await
    }

    async fn list(&self, status: Option<ReviewStatus>) -> Result<Vec<ReviewQueueEntry>> {
        self.with_conn(move |conn| {
            let rows = match status {
                Some(status) => {
                    let mut statement = conn.prepare(&format!(
                        "SELECT {} FROM review_entries WHERE status = ?1 ORDER BY created_at, id",
                        SELECT_COLUMNS
                    ))?;
                    let rows = statement
                        .query_map([status.as_str()], RawRow::from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
                None => {
                    let mut statement = conn.prepare(&format!(
                        "SELECT {} FROM review_entries ORDER BY created_at, id",
                        SELECT_COLUMNS
                    ))?;
                    let rows = statement
                        .query_map([], RawRow::from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
            };
            rows.into_iter().map(RawRow::into_entry).collect()
        })
        .await
    }
}
