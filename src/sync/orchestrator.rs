use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};

use crate::db::{PlanRecord, SessionRecord, SessionSource};
use crate::ledger::{seconds_to_hours, HourBank, PlanningStore, SessionLedger};
use crate::link::LinkManager;
use crate::protocol::{
    self, records::format_planned_time, Characteristic, DevicePlan, DeviceSession,
    MAX_ATTRIBUTE_LEN,
};

use super::{
    clock::{Clock, SystemClock},
    SyncOutcome, SyncResult, StepOutcome,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

const DEFAULT_APPLY_CONCURRENCY: usize = 4;

/// What step 3 did with one pending session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Inserted,
    AlreadyPresent,
    /// Already in the ledger but its debit had never landed.
    DebitRepaired,
}

/// Runs reconciliation cycles against the connected band.
///
/// At most one cycle is in flight at a time; a call that finds one running
/// returns [`SyncOutcome::AlreadyRunning`] without touching the link.
pub struct SyncOrchestrator {
    link: LinkManager,
    ledger: Arc<dyn SessionLedger>,
    bank: Arc<dyn HourBank>,
    planner: Arc<dyn PlanningStore>,
    clock: Arc<dyn Clock>,
    apply_concurrency: usize,
    running: AtomicBool,
}

/// Clears the running flag however the cycle ends, including when the
/// caller's future is dropped mid-cycle.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncOrchestrator {
    pub fn new(
        link: LinkManager,
        ledger: Arc<dyn SessionLedger>,
        bank: Arc<dyn HourBank>,
        planner: Arc<dyn PlanningStore>,
    ) -> Self {
        Self {
            link,
            ledger,
            bank,
            planner,
            clock: Arc::new(SystemClock),
            apply_concurrency: DEFAULT_APPLY_CONCURRENCY,
            running: AtomicBool::new(false),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sessions applied at once in step 3. Zero is treated as one.
    pub fn with_apply_concurrency(mut self, concurrency: usize) -> Self {
        self.apply_concurrency = concurrency.max(1);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn perform_full_sync(&self) -> SyncResult {
        self.run_cycle(false).await
    }

    /// Cycle triggered by a session recorded in the app. When the band had
    /// nothing pending the total is still pushed so its idle display picks up
    /// the new session.
    pub async fn sync_after_local_session(&self) -> SyncResult {
        self.run_cycle(true).await
    }

    /// Writes the ledger's total to the band. Fails if a cycle is in flight.
    pub async fn push_authoritative_total(&self) -> Result<u32> {
        let _guard = self
            .acquire()
            .context("a sync cycle is already writing to the band")?;
        self.write_total().await
    }

    fn acquire(&self) -> Option<FlightGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard(&self.running))
    }

    async fn run_cycle(&self, push_total_when_idle: bool) -> SyncResult {
        let started_at = self.clock.now();
        let Some(_guard) = self.acquire() else {
            log_info!("sync already in progress; skipping");
            return SyncResult::already_running(started_at);
        };

        let mut result = SyncResult::started(started_at);
        self.cycle(&mut result, push_total_when_idle).await;
        log_info!("{}", result.summary());
        result
    }

    async fn cycle(&self, result: &mut SyncResult, push_total_when_idle: bool) {
        // 1. Plans first; a failure here keeps session import out of this cycle.
        match self.push_plans().await {
            Ok(count) => {
                log_info!("pushed {count} plan(s)");
                result.push_plans = StepOutcome::Succeeded;
            }
            Err(err) => {
                log_warn!("plan push failed: {err:#}");
                result.push_plans = StepOutcome::failed(format!("{err:#}"));
                result.outcome = SyncOutcome::Aborted;
                return;
            }
        }

        // 2. Pull.
        let pending = match self.pull_pending().await {
            Ok(pending) => {
                result.pull_sessions = StepOutcome::Succeeded;
                pending
            }
            Err(err) => {
                log_warn!("pending session read failed: {err:#}");
                result.pull_sessions = StepOutcome::failed(format!("{err:#}"));
                result.outcome = SyncOutcome::Aborted;
                return;
            }
        };

        if pending.is_empty() {
            result.outcome = SyncOutcome::NothingPending;
            if push_total_when_idle {
                self.push_total_step(result).await;
            }
            return;
        }

        // 3. Apply.
        let received_at = self.clock.now();
        let applied = self.apply_sessions(pending, received_at).await;
        let mut acknowledged = Vec::with_capacity(applied.len());
        for (id, outcome) in applied {
            match outcome {
                Ok(Applied::Inserted) => {
                    result.applied += 1;
                    acknowledged.push(id);
                }
                Ok(Applied::AlreadyPresent) => {
                    result.already_present += 1;
                    acknowledged.push(id);
                }
                Ok(Applied::DebitRepaired) => {
                    log_info!("repaired missing debit for session {id}");
                    result.already_present += 1;
                    acknowledged.push(id);
                }
                Err(err) => {
                    log_error!("failed to apply session {id}: {err:#}");
                    result.failed.push(id);
                }
            }
        }
        result.apply_sessions = if result.failed.is_empty() {
            StepOutcome::Succeeded
        } else {
            StepOutcome::Failed(format!("{} session(s) not applied", result.failed.len()))
        };

        // 4. Acknowledge only what landed.
        if !acknowledged.is_empty() {
            result.acknowledge = match self
                .link
                .write(Characteristic::SyncAck, &protocol::encode_ack(&acknowledged))
                .await
            {
                Ok(()) => {
                    result.acknowledged = acknowledged;
                    StepOutcome::Succeeded
                }
                Err(err) => {
                    log_warn!("acknowledgment write failed: {err}");
                    StepOutcome::failed(err)
                }
            };
        }

        // 5. The ledger's total wins over whatever the band computed.
        self.push_total_step(result).await;
    }

    async fn push_plans(&self) -> Result<usize> {
        let today = self.clock.today();
        let plans: Vec<DevicePlan> = self
            .planner
            .plans_for_date(today)
            .await
            .context("failed to load today's plans")?
            .iter()
            .filter(|plan| plan.date == today)
            .map(device_plan)
            .collect();

        let payload = protocol::encode_plans(&plans);
        if payload.len() > MAX_ATTRIBUTE_LEN {
            log_warn!(
                "plan payload is {} bytes, over the {MAX_ATTRIBUTE_LEN}-byte attribute limit",
                payload.len()
            );
        }

        self.link
            .write(Characteristic::PlannedSessions, &payload)
            .await
            .context("failed to write plans")?;
        Ok(plans.len())
    }

    async fn pull_pending(&self) -> Result<Vec<DeviceSession>> {
        let bytes = self
            .link
            .read(Characteristic::PendingSessions)
            .await
            .context("failed to read pending sessions")?;
        let sessions = protocol::decode_sessions(&bytes)?;

        // The same identifier can show up twice if the band re-queued it.
        let mut seen = HashSet::new();
        let unique: Vec<_> = sessions
            .into_iter()
            .filter(|session| seen.insert(session.uuid.clone()))
            .collect();
        Ok(unique)
    }

    /// Applies the batch with bounded concurrency. Identifiers are unique
    /// within the batch, so no identifier is ever in flight twice. Results
    /// come back in the band's order.
    async fn apply_sessions(
        &self,
        pending: Vec<DeviceSession>,
        received_at: DateTime<Utc>,
    ) -> Vec<(String, Result<Applied>)> {
        stream::iter(pending)
            .map(|session| async move {
                let outcome = self.apply_one(&session, received_at).await;
                (session.uuid, outcome)
            })
            .buffered(self.apply_concurrency)
            .collect()
            .await
    }

    async fn apply_one(&self, session: &DeviceSession, received_at: DateTime<Utc>) -> Result<Applied> {
        let id = session.uuid.as_str();
        let hours = seconds_to_hours(u64::from(session.duration_seconds));

        if self.ledger.exists(id).await? {
            if self.bank.has_consumed(id).await? {
                return Ok(Applied::AlreadyPresent);
            }
            self.bank.consume_hours(hours, id).await?;
            return Ok(Applied::DebitRepaired);
        }

        // Debited but no longer in the ledger: the user deleted it after an
        // earlier cycle whose acknowledgment was lost. Don't bring it back.
        if self.bank.has_consumed(id).await? {
            return Ok(Applied::AlreadyPresent);
        }

        self.ledger
            .insert(&ledger_record(session, received_at))
            .await
            .context("ledger insert failed")?;
        self.bank
            .consume_hours(hours, id)
            .await
            .context("hour bank debit failed")?;
        Ok(Applied::Inserted)
    }

    async fn push_total_step(&self, result: &mut SyncResult) {
        result.push_total = match self.write_total().await {
            Ok(total) => {
                result.pushed_total = Some(total);
                StepOutcome::Succeeded
            }
            Err(err) => {
                log_warn!("total push failed: {err:#}");
                StepOutcome::failed(format!("{err:#}"))
            }
        };
    }

    async fn write_total(&self) -> Result<u32> {
        let seconds = self
            .ledger
            .total_seconds()
            .await
            .context("failed to total the ledger")?;
        let total = u32::try_from(seconds).unwrap_or_else(|_| {
            log_warn!("ledger total {seconds}s does not fit the band's counter; saturating");
            u32::MAX
        });

        self.link
            .write(Characteristic::TotalSeconds, &protocol::encode_seconds(total))
            .await
            .context("failed to write total")?;
        Ok(total)
    }
}

fn device_plan(plan: &PlanRecord) -> DevicePlan {
    DevicePlan {
        planned_time: plan.planned_time.map(format_planned_time),
        duration: plan.duration_minutes,
        title: plan.title.clone(),
        discipline: plan.discipline.clone(),
        enforce_goal: plan.enforce_goal,
        ..DevicePlan::for_day(plan.date)
    }
}

fn ledger_record(session: &DeviceSession, received_at: DateTime<Utc>) -> SessionRecord {
    let (started_at, ended_at) = session.wall_clock_span(received_at);
    SessionRecord {
        id: session.uuid.clone(),
        started_at,
        ended_at,
        duration_seconds: u64::from(session.duration_seconds),
        pose: session.pose.clone(),
        discipline: session.discipline.clone(),
        source: SessionSource::Device,
    }
}
