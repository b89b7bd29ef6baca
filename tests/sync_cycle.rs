mod common;

use std::sync::Arc;

use bandsync::{
    db::PlanRecord,
    ledger::HourBank,
    protocol::{
        decode_ack, decode_plans, decode_seconds, records::day_start_millis, Characteristic,
    },
    sync::{StepOutcome, SyncOutcome},
};
use chrono::NaiveTime;
use common::{band_session, today, Harness};

fn acks(harness: &Harness) -> Vec<Vec<String>> {
    harness
        .band
        .writes_to(Characteristic::SyncAck)
        .iter()
        .map(|payload| decode_ack(payload).unwrap())
        .collect()
}

fn totals(harness: &Harness) -> Vec<u32> {
    harness
        .band
        .writes_to(Characteristic::TotalSeconds)
        .iter()
        .map(|payload| decode_seconds(Characteristic::TotalSeconds, payload).unwrap())
        .collect()
}

#[tokio::test]
async fn imports_two_sessions_into_an_empty_ledger() {
    let harness = Harness::connected().await;
    harness.band.record_session(band_session("a", 600));
    harness.band.record_session(band_session("b", 300));

    let result = harness.orchestrator.perform_full_sync().await;

    assert_eq!(result.outcome, SyncOutcome::Completed);
    assert!(result.is_success());
    assert_eq!(result.applied, 2);
    assert_eq!(result.acknowledged, ["a", "b"]);
    assert_eq!(result.pushed_total, Some(900));

    assert_eq!(harness.ledger.len(), 2);
    assert_eq!(harness.bank.debits_for("a"), 1);
    assert_eq!(harness.bank.debits_for("b"), 1);
    assert!((harness.bank.total_hours() * 3600.0 - 900.0).abs() < 1e-6);

    assert_eq!(acks(&harness), vec![vec!["a".to_string(), "b".to_string()]]);
    assert_eq!(totals(&harness), vec![900]);
    assert!(harness.band.pending().is_empty());
    assert_eq!(harness.band.total_seconds(), 900);
}

#[tokio::test]
async fn a_lost_acknowledgment_does_not_double_count() {
    let harness = Harness::connected().await;
    harness.band.record_session(band_session("a", 600));
    harness.band.fail_writes_of(Characteristic::SyncAck);

    let first = harness.orchestrator.perform_full_sync().await;
    assert!(first.acknowledge.is_failed());
    assert_eq!(first.applied, 1);
    assert_eq!(harness.band.pending().len(), 1);

    harness.band.clear_faults();
    let second = harness.orchestrator.perform_full_sync().await;
    assert_eq!(second.applied, 0);
    assert_eq!(second.already_present, 1);
    assert_eq!(second.acknowledged, ["a"]);

    assert_eq!(harness.ledger.len(), 1);
    assert_eq!(harness.bank.debits_for("a"), 1);
    assert!(harness.band.pending().is_empty());
}

#[tokio::test]
async fn a_debited_session_missing_from_the_ledger_is_not_inserted_again() {
    let harness = Harness::connected().await;
    harness.band.record_session(band_session("a", 600));
    harness.bank.consume_hours(600.0 / 3600.0, "a").await.unwrap();

    let result = harness.orchestrator.perform_full_sync().await;
    assert_eq!(result.applied, 0);
    assert_eq!(result.already_present, 1);
    assert_eq!(result.acknowledged, ["a"]);
    assert_eq!(harness.ledger.len(), 0);
    assert_eq!(harness.bank.debits_for("a"), 1);
    assert!(harness.band.pending().is_empty());
}

#[tokio::test]
async fn one_failing_session_does_not_block_the_others() {
    let harness = Harness::connected().await;
    for (id, seconds) in [("a", 60), ("b", 120), ("c", 180)] {
        harness.band.record_session(band_session(id, seconds));
    }
    harness.ledger.fail_inserts_of("b");

    let result = harness.orchestrator.perform_full_sync().await;
    assert_eq!(result.applied, 2);
    assert_eq!(result.failed, ["b"]);
    assert!(result.apply_sessions.is_failed());
    assert_eq!(result.acknowledged, ["a", "c"]);
    assert_eq!(result.pushed_total, Some(240));
    let pending: Vec<_> = harness.band.pending().into_iter().map(|s| s.uuid).collect();
    assert_eq!(pending, ["b"]);

    harness.ledger.heal();
    let retry = harness.orchestrator.perform_full_sync().await;
    assert_eq!(retry.applied, 1);
    assert_eq!(retry.acknowledged, ["b"]);
    assert_eq!(retry.pushed_total, Some(360));
    for id in ["a", "b", "c"] {
        assert_eq!(harness.bank.debits_for(id), 1, "debits for {id}");
    }
}

#[tokio::test]
async fn a_missing_debit_is_taken_on_the_next_cycle() {
    let harness = Harness::connected().await;
    harness.band.record_session(band_session("a", 900));
    harness.bank.fail_debits_of("a");

    let first = harness.orchestrator.perform_full_sync().await;
    assert_eq!(first.failed, ["a"]);
    assert!(first.acknowledged.is_empty());
    assert_eq!(first.acknowledge, StepOutcome::NotAttempted);
    assert_eq!(harness.ledger.len(), 1);
    assert_eq!(harness.bank.debits_for("a"), 0);

    harness.bank.heal();
    let second = harness.orchestrator.perform_full_sync().await;
    assert_eq!(second.acknowledged, ["a"]);
    assert_eq!(harness.ledger.len(), 1);
    assert_eq!(harness.bank.debits_for("a"), 1);
}

#[tokio::test]
async fn repeated_identifiers_in_one_read_apply_once() {
    let harness = Harness::connected().await;
    harness.band.record_session(band_session("a", 600));
    harness.band.record_session(band_session("a", 600));

    let result = harness.orchestrator.perform_full_sync().await;
    assert_eq!(result.applied, 1);
    assert_eq!(result.acknowledged, ["a"]);
    assert_eq!(harness.bank.debit_count(), 1);
}

#[tokio::test]
async fn authoritative_total_overwrites_the_band() {
    for stale in [0, 900] {
        let harness = Harness::connected().await;
        for (id, seconds) in [("a", 600), ("b", 600), ("c", 600)] {
            harness.band.record_session(band_session(id, seconds));
        }
        harness.band.set_total_seconds(stale);

        let result = harness.orchestrator.perform_full_sync().await;
        assert_eq!(result.pushed_total, Some(1800));
        assert_eq!(totals(&harness), vec![1800]);
        assert_eq!(harness.band.total_seconds(), 1800);
    }
}

#[tokio::test]
async fn plans_replace_what_the_band_held() {
    let harness = Harness::connected().await;

    let mut morning = PlanRecord::new("morning", today());
    morning.planned_time = NaiveTime::from_hms_opt(7, 0, 0);
    morning.duration_minutes = Some(20);
    harness.planner.replace(vec![morning]);
    harness.orchestrator.perform_full_sync().await;
    assert_eq!(harness.band.plans().len(), 1);

    let mut evening = PlanRecord::new("evening", today());
    evening.planned_time = NaiveTime::from_hms_opt(20, 15, 0);
    evening.title = Some("Wind down".into());
    evening.enforce_goal = true;
    let untimed = PlanRecord::new("anytime", today());
    harness.planner.replace(vec![evening, untimed]);
    harness.orchestrator.perform_full_sync().await;

    let held = harness.band.plans();
    assert_eq!(held.len(), 2);
    assert_eq!(held[0].planned_time.as_deref(), Some("20:15"));
    assert_eq!(held[0].title.as_deref(), Some("Wind down"));
    assert!(held[0].enforce_goal);
    assert_eq!(held[1].planned_time, None);

    let writes = harness.band.writes_to(Characteristic::PlannedSessions);
    assert_eq!(writes.len(), 2);
    assert_eq!(decode_plans(&writes[1]).unwrap(), held);
}

#[tokio::test]
async fn only_todays_plans_reach_the_band() {
    let harness = Harness::connected().await;
    *harness.planner.ignore_date.lock().unwrap() = true;

    let tomorrow = today().succ_opt().unwrap();
    let mut later = PlanRecord::new("tomorrow", tomorrow);
    later.planned_time = NaiveTime::from_hms_opt(8, 0, 0);
    let mut now = PlanRecord::new("today", today());
    now.planned_time = NaiveTime::from_hms_opt(18, 0, 0);
    harness.planner.replace(vec![later, now]);

    let result = harness.orchestrator.perform_full_sync().await;
    assert_eq!(result.push_plans, StepOutcome::Succeeded);

    let held = harness.band.plans();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].date, day_start_millis(today()));
    assert_eq!(held[0].planned_time.as_deref(), Some("18:00"));
}

#[tokio::test]
async fn an_empty_queue_still_pushes_plans_and_nothing_else() {
    let harness = Harness::connected().await;

    let result = harness.orchestrator.perform_full_sync().await;
    assert_eq!(result.outcome, SyncOutcome::NothingPending);
    assert!(result.is_success());
    assert_eq!(result.push_plans, StepOutcome::Succeeded);
    assert_eq!(harness.band.writes_to(Characteristic::PlannedSessions).len(), 1);
    assert!(acks(&harness).is_empty());
    assert!(totals(&harness).is_empty());
}

#[tokio::test]
async fn a_recorded_session_pushes_the_total_even_when_nothing_is_pending() {
    let harness = Harness::connected().await;
    harness.ledger.seed(bandsync::db::SessionRecord {
        id: "local".into(),
        started_at: chrono::Utc::now(),
        ended_at: chrono::Utc::now(),
        duration_seconds: 1200,
        pose: None,
        discipline: None,
        source: bandsync::db::SessionSource::App,
    });

    let result = harness.orchestrator.sync_after_local_session().await;
    assert_eq!(result.outcome, SyncOutcome::NothingPending);
    assert_eq!(result.pushed_total, Some(1200));
    assert_eq!(totals(&harness), vec![1200]);
}

#[tokio::test]
async fn a_failed_plan_push_keeps_sessions_on_the_band() {
    let harness = Harness::connected().await;
    harness.band.record_session(band_session("a", 600));
    harness.band.fail_writes_of(Characteristic::PlannedSessions);

    let result = harness.orchestrator.perform_full_sync().await;
    assert_eq!(result.outcome, SyncOutcome::Aborted);
    assert!(result.push_plans.is_failed());
    assert_eq!(result.pull_sessions, StepOutcome::NotAttempted);
    assert_eq!(harness.ledger.len(), 0);
    assert_eq!(harness.band.pending().len(), 1);
}

#[tokio::test]
async fn a_planning_store_error_aborts_before_import() {
    let harness = Harness::connected().await;
    harness.band.record_session(band_session("a", 600));
    *harness.planner.fail.lock().unwrap() = true;

    let result = harness.orchestrator.perform_full_sync().await;
    assert_eq!(result.outcome, SyncOutcome::Aborted);
    assert_eq!(harness.band.operation_count(), 0);
    assert_eq!(harness.ledger.len(), 0);
}

#[tokio::test]
async fn a_malformed_queue_is_discarded_for_the_cycle() {
    let harness = Harness::connected().await;
    harness.band.record_session(band_session("a", 600));
    harness
        .band
        .override_read(Characteristic::PendingSessions, b"[{\"uuid\":".to_vec());

    let result = harness.orchestrator.perform_full_sync().await;
    assert_eq!(result.outcome, SyncOutcome::Aborted);
    assert_eq!(result.push_plans, StepOutcome::Succeeded);
    assert!(result.pull_sessions.is_failed());
    assert_eq!(harness.ledger.len(), 0);

    harness.band.clear_faults();
    let next = harness.orchestrator.perform_full_sync().await;
    assert_eq!(next.acknowledged, ["a"]);
}

#[tokio::test]
async fn nothing_is_attempted_without_a_link() {
    let harness = Harness::new();
    harness.band.record_session(band_session("a", 600));

    let result = harness.orchestrator.perform_full_sync().await;
    assert_eq!(result.outcome, SyncOutcome::Aborted);
    assert!(result.push_plans.is_failed());
    assert_eq!(harness.band.operation_count(), 0);
    assert_eq!(harness.ledger.len(), 0);
}

#[tokio::test]
async fn a_second_call_during_import_returns_at_once() {
    let harness = Harness::connected().await;
    harness.band.record_session(band_session("a", 600));
    let gate = harness.ledger.hold_inserts();

    let orchestrator = harness.orchestrator.clone();
    let first = tokio::spawn(async move { orchestrator.perform_full_sync().await });

    harness.ledger.insert_started.notified().await;
    assert!(harness.orchestrator.is_running());
    let operations = harness.band.operation_count();

    let second = harness.orchestrator.perform_full_sync().await;
    assert!(second.is_already_running());
    assert_eq!(harness.band.operation_count(), operations);

    gate.notify_one();
    let first = first.await.unwrap();
    assert_eq!(first.acknowledged, ["a"]);
    assert!(!harness.orchestrator.is_running());

    let third = harness.orchestrator.perform_full_sync().await;
    assert!(!third.is_already_running());
}

#[tokio::test]
async fn concurrent_apply_keeps_the_band_order() {
    let harness = Harness::connected().await;
    let ids: Vec<String> = (0..12).map(|n| format!("s{n:02}")).collect();
    for id in &ids {
        harness.band.record_session(band_session(id, 60));
    }

    let orchestrator = Arc::new(
        bandsync::sync::SyncOrchestrator::new(
            harness.link.clone(),
            harness.ledger.clone(),
            harness.bank.clone(),
            harness.planner.clone(),
        )
        .with_apply_concurrency(3),
    );
    let result = orchestrator.perform_full_sync().await;
    assert_eq!(result.acknowledged, ids);
    assert_eq!(result.pushed_total, Some(720));
}
