use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::db::Database;
use crate::ledger::HourBank;

fn check_hours(hours: f64) -> Result<()> {
    if !hours.is_finite() || hours < 0.0 {
        bail!("hour amount must be a non-negative number, got {hours}");
    }
    Ok(())
}

impl Database {
    /// Charges `hours` to the session `tag`. A second debit for the same tag
    /// is ignored.
    pub async fn debit_hours(&self, hours: f64, tag: &str) -> Result<bool> {
        check_hours(hours)?;
        self.insert_entry("debit", hours, tag).await
    }

    pub async fn has_debit(&self, tag: &str) -> Result<bool> {
        let tag = tag.to_string();
        self.execute(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM hour_bank_entries WHERE kind = 'debit' AND tag = ?1",
                    params![tag],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    /// Credits the bank, e.g. with a purchase identified by `tag`.
    pub async fn grant_hours(&self, hours: f64, tag: &str) -> Result<bool> {
        check_hours(hours)?;
        self.insert_entry("grant", hours, tag).await
    }

    /// Grants minus debits. Negative when the user practiced on credit.
    pub async fn balance_hours(&self) -> Result<f64> {
        self.execute(|conn| {
            let balance: f64 = conn.query_row(
                "SELECT COALESCE(SUM(CASE kind WHEN 'grant' THEN hours ELSE -hours END), 0.0)
                 FROM hour_bank_entries",
                [],
                |row| row.get(0),
            )?;
            Ok(balance)
        })
        .await
    }

    async fn insert_entry(&self, kind: &'static str, hours: f64, tag: &str) -> Result<bool> {
        let tag = tag.to_string();
        self.execute(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO hour_bank_entries (kind, tag, hours, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![kind, tag, hours, Utc::now().to_rfc3339()],
            )?;
            Ok(inserted == 1)
        })
        .await
    }
}

#[async_trait]
impl HourBank for Database {
    async fn consume_hours(&self, hours: f64, tag: &str) -> Result<()> {
        self.debit_hours(hours, tag).await.map(|_| ())
    }

    async fn has_consumed(&self, tag: &str) -> Result<bool> {
        self.has_debit(tag).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_tag_is_charged_at_most_once() {
        let db = Database::open_in_memory().unwrap();
        db.grant_hours(10.0, "purchase-1").await.unwrap();

        assert!(db.debit_hours(0.5, "session-a").await.unwrap());
        assert!(!db.debit_hours(0.5, "session-a").await.unwrap());

        assert!(db.has_consumed("session-a").await.unwrap());
        assert!(!db.has_consumed("session-b").await.unwrap());
        assert!((db.balance_hours().await.unwrap() - 9.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn grant_tags_do_not_count_as_debits() {
        let db = Database::open_in_memory().unwrap();
        db.grant_hours(1.0, "shared").await.unwrap();
        assert!(!db.has_debit("shared").await.unwrap());
    }

    #[tokio::test]
    async fn rejects_negative_and_non_finite_amounts() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.consume_hours(-1.0, "a").await.is_err());
        assert!(db.consume_hours(f64::NAN, "b").await.is_err());
        assert!(db.grant_hours(f64::INFINITY, "c").await.is_err());
        assert_eq!(db.balance_hours().await.unwrap(), 0.0);
    }
}
