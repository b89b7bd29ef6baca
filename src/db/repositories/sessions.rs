use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::{
    helpers::{parse_datetime, parse_source, to_i64, to_u64},
    models::{SessionRecord, SessionSource},
    Database,
};
use crate::ledger::{seconds_to_hours, SessionLedger};

fn row_to_session(row: &Row) -> Result<SessionRecord> {
    let started_at: String = row.get("started_at")?;
    let ended_at: String = row.get("ended_at")?;
    let duration_seconds: i64 = row.get("duration_seconds")?;
    let source: String = row.get("source")?;

    Ok(SessionRecord {
        id: row.get("id")?,
        started_at: parse_datetime(&started_at, "started_at")?,
        ended_at: parse_datetime(&ended_at, "ended_at")?,
        duration_seconds: to_u64(duration_seconds, "duration_seconds")?,
        pose: row.get("pose")?,
        discipline: row.get("discipline")?,
        source: parse_source(&source)?,
    })
}

fn insert_row(conn: &rusqlite::Connection, record: &SessionRecord) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO sessions (id, started_at, ended_at, duration_seconds, pose, discipline, source, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.id,
            record.started_at.to_rfc3339(),
            record.ended_at.to_rfc3339(),
            to_i64(record.duration_seconds)?,
            record.pose,
            record.discipline,
            record.source.as_str(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(inserted == 1)
}

impl Database {
    pub async fn session_exists(&self, session_id: &str) -> Result<bool> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM sessions WHERE id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    /// Returns `false` when a row with this identifier already existed.
    pub async fn insert_session(&self, record: &SessionRecord) -> Result<bool> {
        let record = record.clone();
        self.execute(move |conn| insert_row(conn, &record).context("failed to insert session"))
            .await
    }

    pub async fn sum_session_seconds(&self) -> Result<u64> {
        self.execute(|conn| {
            let total: i64 = conn.query_row(
                "SELECT COALESCE(SUM(duration_seconds), 0) FROM sessions",
                [],
                |row| row.get(0),
            )?;
            to_u64(total, "total seconds")
        })
        .await
    }

    /// Records a session practiced with the app and charges the hour bank for
    /// it in the same transaction.
    pub async fn record_local_session(
        &self,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        pose: Option<String>,
        discipline: Option<String>,
    ) -> Result<SessionRecord> {
        let duration_seconds = (ended_at - started_at).num_seconds().max(0) as u64;
        let record = SessionRecord {
            id: Uuid::new_v4().to_string(),
            started_at,
            ended_at,
            duration_seconds,
            pose,
            discipline,
            source: SessionSource::App,
        };

        let row = record.clone();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            insert_row(&tx, &row)?;
            tx.execute(
                "INSERT OR IGNORE INTO hour_bank_entries (kind, tag, hours, created_at)
                 VALUES ('debit', ?1, ?2, ?3)",
                params![
                    row.id,
                    seconds_to_hours(row.duration_seconds),
                    Utc::now().to_rfc3339()
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?;

        Ok(record)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, started_at, ended_at, duration_seconds, pose, discipline, source
                 FROM sessions
                 WHERE id = ?1",
            )?;
            let mut rows = stmt.query(params![session_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, started_at, ended_at, duration_seconds, pose, discipline, source
                 FROM sessions
                 ORDER BY started_at DESC",
            )?;

            let mut rows = stmt.query([])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }

            Ok(sessions)
        })
        .await
    }

    /// Removes a session from the ledger. Its hour-bank debit stays: hours
    /// spent are not refunded by editing history, and the debit keeps a
    /// band that re-offers the session from importing it again.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let rows_affected =
                conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
            Ok(rows_affected > 0)
        })
        .await
    }
}

#[async_trait]
impl SessionLedger for Database {
    async fn exists(&self, id: &str) -> Result<bool> {
        self.session_exists(id).await
    }

    async fn insert(&self, record: &SessionRecord) -> Result<()> {
        self.insert_session(record).await.map(|_| ())
    }

    async fn total_seconds(&self) -> Result<u64> {
        self.sum_session_seconds().await
    }
}
