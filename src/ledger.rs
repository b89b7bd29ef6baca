//! Collaborators the sync engine reads from and appends to.
//!
//! The local ledger is the single source of truth for practice time. The
//! orchestrator only ever inserts rows it has just checked for, debits the
//! hour bank for those rows and reads today's plans.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;

use crate::db::{PlanRecord, SessionRecord};

#[async_trait]
pub trait SessionLedger: Send + Sync {
    async fn exists(&self, id: &str) -> Result<bool>;

    /// Inserting an identifier that is already present is a no-op.
    async fn insert(&self, record: &SessionRecord) -> Result<()>;

    async fn total_seconds(&self) -> Result<u64>;
}

#[async_trait]
pub trait HourBank: Send + Sync {
    /// Debits `hours` from the bank on behalf of the session `tag`.
    async fn consume_hours(&self, hours: f64, tag: &str) -> Result<()>;

    /// Whether a debit tagged `tag` has already been taken.
    async fn has_consumed(&self, tag: &str) -> Result<bool>;
}

#[async_trait]
pub trait PlanningStore: Send + Sync {
    async fn plans_for_date(&self, date: NaiveDate) -> Result<Vec<PlanRecord>>;
}

pub fn seconds_to_hours(seconds: u64) -> f64 {
    seconds as f64 / 3600.0
}
