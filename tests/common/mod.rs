#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use bandsync::{
    db::{PlanRecord, SessionRecord},
    ledger::{HourBank, PlanningStore, SessionLedger},
    link::{simulated::SimulatedBand, LinkManager},
    protocol::DeviceSession,
    sync::{FixedClock, SyncOrchestrator},
};
use chrono::{NaiveDate, TimeZone, Utc};
use tokio::sync::Notify;

pub const BAND_ID: &str = "band-1";

/// In-memory ledger with per-identifier failure injection and an optional
/// gate that holds inserts until released.
#[derive(Default)]
pub struct MemoryLedger {
    rows: Mutex<HashMap<String, SessionRecord>>,
    failing: Mutex<HashSet<String>>,
    gate: Mutex<Option<Arc<Notify>>>,
    pub insert_started: Notify,
}

impl MemoryLedger {
    pub fn fail_inserts_of(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// Inserts block until the returned handle is notified.
    pub fn hold_inserts(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn seed(&self, record: SessionRecord) {
        self.rows.lock().unwrap().insert(record.id.clone(), record);
    }

    pub fn ids(&self) -> HashSet<String> {
        self.rows.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl SessionLedger for MemoryLedger {
    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.rows.lock().unwrap().contains_key(id))
    }

    async fn insert(&self, record: &SessionRecord) -> Result<()> {
        self.insert_started.notify_one();
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.failing.lock().unwrap().contains(&record.id) {
            bail!("disk full while inserting {}", record.id);
        }
        self.rows
            .lock()
            .unwrap()
            .entry(record.id.clone())
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn total_seconds(&self) -> Result<u64> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .map(|row| row.duration_seconds)
            .sum())
    }
}

/// Records every debit call, duplicates included, so double charging shows.
#[derive(Default)]
pub struct MemoryBank {
    debits: Mutex<Vec<(String, f64)>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryBank {
    pub fn fail_debits_of(&self, tag: &str) {
        self.failing.lock().unwrap().insert(tag.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn debits_for(&self, tag: &str) -> usize {
        self.debits
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == tag)
            .count()
    }

    pub fn total_hours(&self) -> f64 {
        self.debits.lock().unwrap().iter().map(|(_, h)| h).sum()
    }

    pub fn debit_count(&self) -> usize {
        self.debits.lock().unwrap().len()
    }
}

#[async_trait]
impl HourBank for MemoryBank {
    async fn consume_hours(&self, hours: f64, tag: &str) -> Result<()> {
        if self.failing.lock().unwrap().contains(tag) {
            bail!("hour bank unavailable for {tag}");
        }
        self.debits.lock().unwrap().push((tag.to_string(), hours));
        Ok(())
    }

    async fn has_consumed(&self, tag: &str) -> Result<bool> {
        Ok(self.debits_for(tag) > 0)
    }
}

#[derive(Default)]
pub struct MemoryPlanner {
    plans: Mutex<Vec<PlanRecord>>,
    pub fail: Mutex<bool>,
    /// Hands back every plan whatever date is asked for.
    pub ignore_date: Mutex<bool>,
}

impl MemoryPlanner {
    pub fn replace(&self, plans: Vec<PlanRecord>) {
        *self.plans.lock().unwrap() = plans;
    }
}

#[async_trait]
impl PlanningStore for MemoryPlanner {
    async fn plans_for_date(&self, date: NaiveDate) -> Result<Vec<PlanRecord>> {
        if *self.fail.lock().unwrap() {
            bail!("planning store offline");
        }
        let ignore_date = *self.ignore_date.lock().unwrap();
        Ok(self
            .plans
            .lock()
            .unwrap()
            .iter()
            .filter(|plan| ignore_date || plan.date == date)
            .cloned()
            .collect())
    }
}

pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 2).unwrap()
}

pub fn clock() -> FixedClock {
    FixedClock {
        now: Utc.with_ymd_and_hms(2024, 5, 2, 9, 0, 0).unwrap(),
        today: today(),
    }
}

/// A session stamped from the band's uptime counter.
pub fn band_session(id: &str, seconds: u32) -> DeviceSession {
    DeviceSession::new(id, 1_000, 1_000 + i64::from(seconds) * 1_000, seconds)
}

pub struct Harness {
    pub band: SimulatedBand,
    pub link: LinkManager,
    pub ledger: Arc<MemoryLedger>,
    pub bank: Arc<MemoryBank>,
    pub planner: Arc<MemoryPlanner>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        let band = SimulatedBand::new(BAND_ID, "Meditation Band");
        let link = LinkManager::new(
            Arc::new(band.clone()),
            Duration::from_millis(500),
            Duration::from_millis(100),
        );
        let ledger = Arc::new(MemoryLedger::default());
        let bank = Arc::new(MemoryBank::default());
        let planner = Arc::new(MemoryPlanner::default());
        let orchestrator = Arc::new(
            SyncOrchestrator::new(link.clone(), ledger.clone(), bank.clone(), planner.clone())
                .with_clock(Arc::new(clock())),
        );

        Self {
            band,
            link,
            ledger,
            bank,
            planner,
            orchestrator,
        }
    }

    pub async fn connected() -> Self {
        let harness = Self::new();
        assert!(harness.link.connect(BAND_ID).await);
        harness
    }
}
