use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use clinicflow_core::event_bus::CaptureSink;
use clinicflow_core::types::EngineEventType;
use clinicflow_rules::{DateRange, RecipientSnapshot, RuleSet};
use clinicflow_scenario::clock::{Clock, ManualClock};
use clinicflow_scenario::providers::{InMemoryAttributeProvider, RecordingActionExecutor};
use clinicflow_scenario::types::{
    Delay, EnrollmentStatus, ExitAction, ExitCheck, ScenarioDefinition, StepAction,
    StepDefinition, StepOutcome, Trigger,
};
use clinicflow_scenario::{
    EngineContext, EventKind, ScenarioEngine, StepRun, TriggerEvent,
};

struct Harness {
    engine: ScenarioEngine,
    clock: Arc<ManualClock>,
    actions: Arc<RecordingActionExecutor>,
    attributes: Arc<InMemoryAttributeProvider>,
    sink: Arc<CaptureSink>,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 9, 14, 9, 30, 0).unwrap()
}

fn harness_with(actions: RecordingActionExecutor) -> Harness {
    let clock = Arc::new(ManualClock::new(t0()));
    let attributes = Arc::new(InMemoryAttributeProvider::new(clock.clone()));
    let actions = Arc::new(actions);
    let sink = Arc::new(CaptureSink::new());
    let ctx = EngineContext::new(attributes.clone(), actions.clone())
        .with_clock(clock.clone())
        .with_event_sink(sink.clone());
    Harness {
        engine: ScenarioEngine::new(ctx),
        clock,
        actions,
        attributes,
        sink,
    }
}

fn harness() -> Harness {
    harness_with(RecordingActionExecutor::new())
}

fn send(step_order: usize, delay: Delay, text: &str) -> StepDefinition {
    StepDefinition {
        step_order,
        delay,
        action: StepAction::send_text(text),
        exit_check: None,
    }
}

fn scenario(trigger: Trigger, steps: Vec<StepDefinition>) -> ScenarioDefinition {
    ScenarioDefinition {
        id: Uuid::new_v4(),
        name: "Follow-up".into(),
        enabled: true,
        trigger,
        entry_condition: None,
        steps,
        allow_concurrent_runs: false,
        version: 0,
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn follow_then_two_messages_a_day_apart() {
    let h = harness();
    h.engine
        .save_scenario(scenario(
            Trigger::Follow,
            vec![
                send(0, Delay::minutes(0), "Hi"),
                send(1, Delay::days(1), "Day1"),
            ],
        ))
        .unwrap();

    let created = h
        .engine
        .handle_event(&TriggerEvent::new("friend-1", EventKind::Follow))
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    let id = created[0].id;
    assert_eq!(created[0].current_step_order, 0);
    assert_eq!(created[0].next_run_at, Some(t0()));

    let sweeper = h.engine.sweeper();
    sweeper.sweep_once().await;
    let e = h.engine.get_enrollment(&id).unwrap();
    assert_eq!(h.actions.sent_texts(), vec!["Hi"]);
    assert_eq!(e.current_step_order, 1);
    assert_eq!(e.next_run_at, Some(t0() + Duration::days(1)));

    h.clock.advance(Duration::hours(23));
    let report = sweeper.sweep_once().await;
    assert_eq!(report.executed, 0);
    assert_eq!(h.actions.call_count(), 1);

    h.clock.set(t0() + Duration::days(1));
    sweeper.sweep_once().await;
    let e = h.engine.get_enrollment(&id).unwrap();
    assert_eq!(h.actions.sent_texts(), vec!["Hi", "Day1"]);
    assert_eq!(e.current_step_order, 2);
    assert_eq!(e.status, EnrollmentStatus::Completed);
    assert_eq!(e.next_run_at, None);

    let log = h.engine.execution_log(&id);
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|l| l.outcome == StepOutcome::Success));
    assert_eq!(h.sink.count_type(EngineEventType::EnrollmentCompleted), 1);
}

#[tokio::test]
async fn concurrent_runs_execute_the_action_once() {
    let h = harness_with(RecordingActionExecutor::new().with_delay(StdDuration::from_millis(50)));
    let s = h
        .engine
        .save_scenario(scenario(
            Trigger::Manual,
            vec![send(0, Delay::minutes(0), "Once"), send(1, Delay::days(1), "Later")],
        ))
        .unwrap();
    let e = h.engine.enroll_manual(&s.id, "p-1").unwrap().unwrap();

    let (first, second) = tokio::join!(h.engine.run_step(e.id), h.engine.run_step(e.id));
    let runs = [first.unwrap(), second.unwrap()];

    let ran = runs.iter().filter(|r| matches!(r, StepRun::Ran { .. })).count();
    let contended = runs
        .iter()
        .filter(|r| matches!(r, StepRun::LockContended))
        .count();
    assert_eq!(ran, 1);
    assert_eq!(contended, 1);
    assert_eq!(h.actions.call_count(), 1);
    assert_eq!(h.engine.execution_log(&e.id).len(), 1);
}

#[tokio::test]
async fn exit_check_stops_before_the_action() {
    let h = harness();
    let mut reminder = send(0, Delay::minutes(0), "Please book your visit");
    reminder.exit_check = Some(ExitCheck {
        rule_set: serde_json::from_value(json!({
            "combinator": "AND",
            "rules": [{ "type": "tag", "tag_ids": ["booked"] }]
        }))
        .unwrap(),
        action: ExitAction::Exit,
        jump_target: None,
    });
    let s = h
        .engine
        .save_scenario(scenario(Trigger::Manual, vec![reminder]))
        .unwrap();
    h.attributes
        .upsert(RecipientSnapshot::new("p-1", t0()).with_tag("booked"));
    let e = h.engine.enroll_manual(&s.id, "p-1").unwrap().unwrap();

    h.engine.sweeper().sweep_once().await;

    let after = h.engine.get_enrollment(&e.id).unwrap();
    assert_eq!(after.status, EnrollmentStatus::Exited);
    assert_eq!(after.next_run_at, None);
    assert_eq!(h.actions.call_count(), 0);
    assert_eq!(h.engine.execution_log(&e.id)[0].outcome, StepOutcome::Exited);
}

#[tokio::test]
async fn pause_during_a_step_wins_and_resume_does_not_resend() {
    let h = harness_with(RecordingActionExecutor::new().with_delay(StdDuration::from_millis(200)));
    let s = h
        .engine
        .save_scenario(scenario(
            Trigger::Manual,
            vec![send(0, Delay::minutes(0), "Hi"), send(1, Delay::days(2), "Again")],
        ))
        .unwrap();
    let e = h.engine.enroll_manual(&s.id, "p-1").unwrap().unwrap();

    let engine = h.engine.clone();
    let in_flight = tokio::spawn(async move { engine.run_step(e.id).await });
    tokio::time::sleep(StdDuration::from_millis(50)).await;

    let paused = h.engine.pause(&e.id).unwrap();
    assert_eq!(paused.status, EnrollmentStatus::Paused);

    match in_flight.await.unwrap().unwrap() {
        StepRun::Conflict { current } => {
            assert_eq!(current.status, EnrollmentStatus::Paused);
            assert_eq!(current.next_run_at, None);
        }
        other => panic!("expected conflict, got {:?}", other),
    }
    let still = h.engine.get_enrollment(&e.id).unwrap();
    assert_eq!(still.status, EnrollmentStatus::Paused);
    assert_eq!(still.current_step_order, 0);

    // The message went out before the pause landed; resuming must not repeat it.
    h.engine.resume(&e.id).unwrap();
    let run = h.engine.run_step(e.id).await.unwrap();
    assert_eq!(run.enrollment().unwrap().current_step_order, 1);
    assert_eq!(h.actions.call_count(), 1);
}

#[tokio::test]
async fn in_flight_enrollments_keep_their_definition_version() {
    let h = harness();
    let draft = scenario(
        Trigger::Manual,
        vec![send(0, Delay::hours(1), "Original text")],
    );
    let v1 = h.engine.save_scenario(draft.clone()).unwrap();
    let old = h.engine.enroll_manual(&v1.id, "old").unwrap().unwrap();

    let mut edited = draft;
    edited.steps[0].action = StepAction::send_text("Edited text");
    let v2 = h.engine.save_scenario(edited).unwrap();
    assert_eq!(v2.version, 2);
    let new = h.engine.enroll_manual(&v2.id, "new").unwrap().unwrap();
    assert_eq!(old.scenario_version, 1);
    assert_eq!(new.scenario_version, 2);

    h.clock.advance(Duration::hours(1));
    h.engine.sweeper().sweep_once().await;

    let mut sent: Vec<(String, String)> = h
        .actions
        .calls()
        .into_iter()
        .map(|c| match c.action {
            StepAction::SendMessage { content, .. } => (c.recipient_id, content.unwrap_or_default()),
            other => (c.recipient_id, other.label().to_string()),
        })
        .collect();
    sent.sort();
    assert_eq!(
        sent,
        vec![
            ("new".to_string(), "Edited text".to_string()),
            ("old".to_string(), "Original text".to_string()),
        ]
    );
}

#[tokio::test]
async fn purchase_threshold_entry_condition() {
    let h = harness();
    let mut s = scenario(
        Trigger::PaymentCompleted,
        vec![send(0, Delay::minutes(0), "Thank you for your continued trust")],
    );
    s.entry_condition = Some(
        serde_json::from_value::<RuleSet>(json!({
            "combinator": "AND",
            "rules": [{
                "type": "purchase_amount",
                "operator": ">=",
                "value": "10000",
                "date_range": "90d"
            }]
        }))
        .unwrap(),
    );
    h.engine.save_scenario(s).unwrap();

    h.attributes.upsert(
        RecipientSnapshot::new("loyal", t0()).with_purchase_amount(DateRange::Days90, 12000.0),
    );
    h.attributes.upsert(
        RecipientSnapshot::new("casual", t0()).with_purchase_amount(DateRange::Days90, 9000.0),
    );

    let loyal = h
        .engine
        .handle_event(&TriggerEvent::new("loyal", EventKind::PaymentCompleted))
        .await
        .unwrap();
    let casual = h
        .engine
        .handle_event(&TriggerEvent::new("casual", EventKind::PaymentCompleted))
        .await
        .unwrap();
    assert_eq!(loyal.len(), 1);
    assert!(casual.is_empty());
}

#[tokio::test]
async fn send_time_in_the_past_rolls_to_tomorrow() {
    let h = harness();
    let ten = chrono::NaiveTime::from_hms_opt(10, 0, 0).unwrap();
    h.clock.set(Utc.with_ymd_and_hms(2026, 9, 14, 15, 0, 0).unwrap());
    let s = h
        .engine
        .save_scenario(scenario(
            Trigger::Manual,
            vec![StepDefinition {
                step_order: 0,
                delay: Delay::days_at(0, ten),
                action: StepAction::send_text("Good morning"),
                exit_check: None,
            }],
        ))
        .unwrap();

    let e = h.engine.enroll_manual(&s.id, "p-1").unwrap().unwrap();
    assert_eq!(
        e.next_run_at,
        Some(Utc.with_ymd_and_hms(2026, 9, 15, 10, 0, 0).unwrap())
    );
    assert!(e.next_run_at.unwrap() > h.clock.now());
}
