use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// A practice the user intends to do on `date`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanRecord {
    pub id: String,
    pub date: NaiveDate,
    pub planned_time: Option<NaiveTime>,
    pub duration_minutes: Option<u32>,
    pub title: Option<String>,
    pub discipline: Option<String>,
    /// Hard commitment: the band ends the session when the goal is reached.
    pub enforce_goal: bool,
}

impl PlanRecord {
    pub fn new(id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            id: id.into(),
            date,
            planned_time: None,
            duration_minutes: None,
            title: None,
            discipline: None,
            enforce_goal: false,
        }
    }
}
