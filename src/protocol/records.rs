use chrono::{DateTime, Duration, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Timestamps before 2020-01-01T00:00:00Z cannot come from a synced wall
/// clock; the band falls back to its uptime counter when it has no time source.
const WALL_CLOCK_FLOOR_MS: i64 = 1_577_836_800_000;

/// A practice interval recorded on the band while untethered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSession {
    pub uuid: String,
    /// Milliseconds since the epoch, as stamped by the band.
    pub start_time: i64,
    pub end_time: i64,
    pub duration_seconds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discipline: Option<String>,
}

impl DeviceSession {
    pub fn new(uuid: impl Into<String>, start_time: i64, end_time: i64, duration_seconds: u32) -> Self {
        Self {
            uuid: uuid.into(),
            start_time,
            end_time,
            duration_seconds,
            pose: None,
            discipline: None,
        }
    }

    pub fn has_wall_clock_times(&self) -> bool {
        self.start_time >= WALL_CLOCK_FLOOR_MS && self.end_time >= self.start_time
    }

    /// Start and end of the session on the app's clock.
    ///
    /// Sessions stamped from the band's uptime counter are re-anchored so they
    /// end at `received_at` with their reported duration.
    pub fn wall_clock_span(&self, received_at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        if self.has_wall_clock_times() {
            let start = DateTime::from_timestamp_millis(self.start_time);
            let end = DateTime::from_timestamp_millis(self.end_time);
            if let (Some(start), Some(end)) = (start, end) {
                return (start, end);
            }
        }

        let start = received_at - Duration::seconds(i64::from(self.duration_seconds));
        (start, received_at)
    }
}

/// The app's description of today's intended practice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePlan {
    /// Local midnight of the plan's day, milliseconds since the epoch.
    pub date: i64,
    /// "HH:MM", 24-hour clock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_time: Option<String>,
    /// Minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discipline: Option<String>,
    pub enforce_goal: bool,
}

impl DevicePlan {
    pub fn for_day(date: NaiveDate) -> Self {
        Self {
            date: day_start_millis(date),
            planned_time: None,
            duration: None,
            title: None,
            discipline: None,
            enforce_goal: false,
        }
    }

    pub fn with_planned_time(mut self, time: NaiveTime) -> Self {
        self.planned_time = Some(format_planned_time(time));
        self
    }
}

/// Local midnight of `date` in epoch milliseconds.
pub fn day_start_millis(date: NaiveDate) -> i64 {
    let midnight = date.and_time(NaiveTime::MIN);
    match Local.from_local_datetime(&midnight).earliest() {
        Some(local) => local.timestamp_millis(),
        // Midnight skipped by a DST jump; fall back to the UTC reading.
        None => midnight.and_utc().timestamp_millis(),
    }
}

pub fn format_planned_time(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}
