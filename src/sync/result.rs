use chrono::{DateTime, Utc};
use serde::Serialize;

/// How a single step of a cycle went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "camelCase")]
pub enum StepOutcome {
    Succeeded,
    Failed(String),
    /// An earlier step ended the cycle, or there was nothing to do.
    NotAttempted,
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }

    pub(crate) fn failed(err: impl std::fmt::Display) -> Self {
        StepOutcome::Failed(err.to_string())
    }
}

/// Why a cycle stopped where it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncOutcome {
    /// Every step ran. Individual steps may still have failed.
    Completed,
    /// The band had nothing pending.
    NothingPending,
    /// A step the rest of the cycle depends on failed.
    Aborted,
    /// Another cycle was in flight; nothing was done.
    AlreadyRunning,
}

/// Report of one reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub started_at: DateTime<Utc>,
    pub outcome: SyncOutcome,
    pub push_plans: StepOutcome,
    pub pull_sessions: StepOutcome,
    pub apply_sessions: StepOutcome,
    pub acknowledge: StepOutcome,
    pub push_total: StepOutcome,
    /// Sessions newly written to the ledger this cycle.
    pub applied: usize,
    /// Sessions the ledger already held.
    pub already_present: usize,
    pub failed: Vec<String>,
    pub acknowledged: Vec<String>,
    pub pushed_total: Option<u32>,
}

impl SyncResult {
    pub(crate) fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: at,
            outcome: SyncOutcome::Completed,
            push_plans: StepOutcome::NotAttempted,
            pull_sessions: StepOutcome::NotAttempted,
            apply_sessions: StepOutcome::NotAttempted,
            acknowledge: StepOutcome::NotAttempted,
            push_total: StepOutcome::NotAttempted,
            applied: 0,
            already_present: 0,
            failed: Vec::new(),
            acknowledged: Vec::new(),
            pushed_total: None,
        }
    }

    pub(crate) fn already_running(at: DateTime<Utc>) -> Self {
        Self {
            outcome: SyncOutcome::AlreadyRunning,
            ..Self::started(at)
        }
    }

    pub fn is_already_running(&self) -> bool {
        self.outcome == SyncOutcome::AlreadyRunning
    }

    /// True when the cycle ran and no step failed.
    pub fn is_success(&self) -> bool {
        !matches!(
            self.outcome,
            SyncOutcome::Aborted | SyncOutcome::AlreadyRunning
        ) && ![
            &self.push_plans,
            &self.pull_sessions,
            &self.apply_sessions,
            &self.acknowledge,
            &self.push_total,
        ]
        .iter()
        .any(|step| step.is_failed())
    }

    pub(crate) fn summary(&self) -> String {
        format!(
            "sync {:?}: applied={} present={} failed={} acked={} total={}",
            self.outcome,
            self.applied,
            self.already_present,
            self.failed.len(),
            self.acknowledged.len(),
            self.pushed_total
                .map(|total| total.to_string())
                .unwrap_or_else(|| "-".into()),
        )
    }
}
