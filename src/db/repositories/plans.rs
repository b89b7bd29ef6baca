use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Row};

use crate::db::{
    helpers::{parse_date, parse_optional_time, DATE_FORMAT, TIME_FORMAT},
    models::PlanRecord,
    Database,
};
use crate::ledger::PlanningStore;

fn row_to_plan(row: &Row) -> Result<PlanRecord> {
    let plan_date: String = row.get("plan_date")?;
    let planned_time: Option<String> = row.get("planned_time")?;
    let duration_minutes: Option<i64> = row.get("duration_minutes")?;

    Ok(PlanRecord {
        id: row.get("id")?,
        date: parse_date(&plan_date, "plan_date")?,
        planned_time: parse_optional_time(planned_time, "planned_time")?,
        duration_minutes: duration_minutes
            .map(u32::try_from)
            .transpose()
            .map_err(|_| anyhow::anyhow!("duration_minutes out of range"))?,
        title: row.get("title")?,
        discipline: row.get("discipline")?,
        enforce_goal: row.get::<_, i64>("enforce_goal")? != 0,
    })
}

impl Database {
    /// Inserts or replaces the plan with this identifier.
    pub async fn insert_plan(&self, plan: &PlanRecord) -> Result<()> {
        let plan = plan.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO planned_sessions
                    (id, plan_date, planned_time, duration_minutes, title, discipline, enforce_goal, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    plan.id,
                    plan.date.format(DATE_FORMAT).to_string(),
                    plan.planned_time.map(|t| t.format(TIME_FORMAT).to_string()),
                    plan.duration_minutes,
                    plan.title,
                    plan.discipline,
                    plan.enforce_goal as i64,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_plan(&self, plan_id: &str) -> Result<bool> {
        let plan_id = plan_id.to_string();
        self.execute(move |conn| {
            let rows_affected =
                conn.execute("DELETE FROM planned_sessions WHERE id = ?1", params![plan_id])?;
            Ok(rows_affected > 0)
        })
        .await
    }

    /// Plans for one calendar day; timed plans first, earliest first.
    pub async fn plans_on(&self, date: NaiveDate) -> Result<Vec<PlanRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, plan_date, planned_time, duration_minutes, title, discipline, enforce_goal
                 FROM planned_sessions
                 WHERE plan_date = ?1
                 ORDER BY planned_time IS NULL, planned_time, created_at",
            )?;

            let mut rows = stmt.query(params![date.format(DATE_FORMAT).to_string()])?;
            let mut plans = Vec::new();
            while let Some(row) = rows.next()? {
                plans.push(row_to_plan(row)?);
            }

            Ok(plans)
        })
        .await
    }
}

#[async_trait]
impl PlanningStore for Database {
    async fn plans_for_date(&self, date: NaiveDate) -> Result<Vec<PlanRecord>> {
        self.plans_on(date).await
    }
}
