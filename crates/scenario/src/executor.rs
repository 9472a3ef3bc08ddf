//! Step execution: advances one enrollment by one step.
//!
//! Each run holds the enrollment's lease for its whole duration, appends
//! exactly one execution log entry, and persists the new state only if
//! nobody else (an operator pause/exit) changed the row in the meantime.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use clinicflow_core::event_bus::make_event;
use clinicflow_core::types::EngineEventType;
use clinicflow_core::{ClinicFlowError, ClinicFlowResult};
use clinicflow_rules::RecipientSnapshot;

use crate::context::EngineContext;
use crate::providers::{ActionError, ActionRequest};
use crate::state_machine::EnrollmentStateMachine;
use crate::store::CommitOutcome;
use crate::types::{
    Enrollment, EnrollmentStatus, ExecutionLogEntry, ExitAction, ScenarioDefinition, StepAction,
    StepOutcome,
};

/// What happened when the executor was asked to run an enrollment.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum StepRun {
    /// A step was attempted and its result persisted.
    Ran {
        enrollment: Enrollment,
        outcome: StepOutcome,
    },
    /// Another worker holds the lease; try again on a later sweep.
    LockContended,
    /// Nothing to do for this enrollment right now.
    Skipped { reason: SkipReason },
    /// The row changed while the step ran; the step's write was dropped.
    Conflict { current: Enrollment },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotActive,
    NotDue,
}

impl StepRun {
    pub fn enrollment(&self) -> Option<&Enrollment> {
        match self {
            StepRun::Ran { enrollment, .. } => Some(enrollment),
            _ => None,
        }
    }

    pub fn outcome(&self) -> Option<StepOutcome> {
        match self {
            StepRun::Ran { outcome, .. } => Some(*outcome),
            _ => None,
        }
    }
}

/// Next state plus the log entry describing how we got there.
struct Transition {
    next: Enrollment,
    entry: ExecutionLogEntry,
}

pub struct StepExecutor {
    ctx: EngineContext,
}

impl StepExecutor {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Runs the current step of enrollment `id` if it is due.
    ///
    /// At most one run per enrollment is in flight at a time: a second
    /// caller gets `StepRun::LockContended` without touching anything.
    pub async fn run_step(&self, id: Uuid) -> ClinicFlowResult<StepRun> {
        let owner = self.ctx.settings.node_id.as_str();
        let now = self.ctx.clock.now();

        let Some(leased) =
            self.ctx
                .enrollments
                .try_acquire_lease(&id, owner, now, self.ctx.settings.lease)?
        else {
            debug!(enrollment_id = %id, "Lease held elsewhere, skipping");
            metrics::counter!("scenario.steps.lock_contended").increment(1);
            return Ok(StepRun::LockContended);
        };

        if !leased.is_due(now) {
            self.ctx.enrollments.release_lease(&id, owner);
            let reason = if leased.status == EnrollmentStatus::Active {
                SkipReason::NotDue
            } else {
                SkipReason::NotActive
            };
            return Ok(StepRun::Skipped { reason });
        }

        let Some(scenario) = self
            .ctx
            .scenarios
            .get_version(&leased.scenario_id, leased.scenario_version)
        else {
            self.ctx.enrollments.release_lease(&id, owner);
            return Err(ClinicFlowError::ScenarioNotFound(leased.scenario_id));
        };

        let started = Instant::now();
        let transition = match self.advance(&scenario, &leased, now).await {
            Ok(t) => t,
            Err(e) => {
                self.ctx.enrollments.release_lease(&id, owner);
                return Err(e);
            }
        };
        let outcome = transition.entry.outcome;
        let step_order = transition.entry.step_order;

        self.ctx.log.append(transition.entry.clone());

        let mut next = transition.next;
        next.locked_by = None;
        next.locked_until = None;
        let committed = match self.ctx.enrollments.commit(next, leased.version) {
            Ok(CommitOutcome::Committed(e)) => e,
            Ok(CommitOutcome::Conflict(current)) => {
                self.ctx.enrollments.release_lease(&id, owner);
                warn!(
                    enrollment_id = %id,
                    step_order,
                    status = %current.status,
                    "Enrollment changed during step, discarding result"
                );
                metrics::counter!("scenario.steps.conflicts").increment(1);
                return Ok(StepRun::Conflict { current });
            }
            Err(e) => {
                self.ctx.enrollments.release_lease(&id, owner);
                return Err(e);
            }
        };

        metrics::histogram!("scenario.step.duration_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);
        metrics::counter!("scenario.steps.executed").increment(1);
        self.report(&committed, step_order, &transition.entry);

        Ok(StepRun::Ran {
            enrollment: committed,
            outcome,
        })
    }

    async fn advance(
        &self,
        scenario: &ScenarioDefinition,
        current: &Enrollment,
        now: DateTime<Utc>,
    ) -> ClinicFlowResult<Transition> {
        let order = current.current_step_order;
        let Some(step) = scenario.steps.get(order) else {
            let next = self.finish(current, EnrollmentStatus::Completed, now)?;
            return Ok(self.transition(current, next, StepOutcome::Success, now));
        };

        let mut snapshot: Option<RecipientSnapshot> = None;

        if let Some(check) = &step.exit_check {
            let snap = match self.ctx.attributes.snapshot(&current.recipient_id).await {
                Ok(s) => s,
                Err(e) => return self.failure(scenario, current, ActionError::retryable(e.to_string()), now),
            };
            if self.ctx.evaluator.evaluate(&check.rule_set, &snap) {
                return match check.action {
                    ExitAction::Exit => {
                        let next = self.finish(current, EnrollmentStatus::Exited, now)?;
                        Ok(self.transition(current, next, StepOutcome::Exited, now))
                    }
                    ExitAction::Skip => {
                        let next = self.move_to(scenario, current, order + 1, now)?;
                        Ok(self.transition(current, next, StepOutcome::Skipped, now))
                    }
                    ExitAction::Jump => {
                        let target = check.jump_target.unwrap_or(order + 1);
                        let next = self.move_to(scenario, current, target, now)?;
                        Ok(self.transition(current, next, StepOutcome::Branched, now))
                    }
                };
            }
            snapshot = Some(snap);
        }

        match &step.action {
            StepAction::Condition {
                rule_set,
                on_true,
                on_false,
            } => {
                let snap = match snapshot {
                    Some(s) => s,
                    None => match self.ctx.attributes.snapshot(&current.recipient_id).await {
                        Ok(s) => s,
                        Err(e) => {
                            return self.failure(scenario, current, ActionError::retryable(e.to_string()), now)
                        }
                    },
                };
                let matched = self.ctx.evaluator.evaluate(rule_set, &snap);
                let target = if matched { *on_true } else { *on_false };
                let next = self.move_to(scenario, current, target.unwrap_or(order + 1), now)?;
                debug!(
                    enrollment_id = %current.id,
                    step_order = order,
                    matched,
                    next_step = next.current_step_order,
                    "Condition evaluated"
                );
                Ok(self.transition(current, next, StepOutcome::Branched, now))
            }
            StepAction::Wait => {
                let next = self.move_to(scenario, current, order + 1, now)?;
                Ok(self.transition(current, next, StepOutcome::Success, now))
            }
            action => {
                let key = current.idempotency_key();
                if let Some(prior) = self.ctx.log.find_success(&current.id, &key) {
                    // Sent by an earlier run whose state write was lost.
                    info!(enrollment_id = %current.id, idempotency_key = %key, "Action already performed, advancing");
                    metrics::counter!("scenario.actions.deduplicated").increment(1);
                    let next = self.move_to(scenario, current, order + 1, now)?;
                    let mut t = self.transition(current, next, StepOutcome::Success, now);
                    t.entry.action_result = prior.action_result;
                    return Ok(t);
                }

                let request = ActionRequest {
                    enrollment_id: current.id,
                    scenario_id: current.scenario_id,
                    step_order: order,
                    recipient_id: current.recipient_id.clone(),
                    idempotency_key: key,
                    action: action.clone(),
                };
                let result = tokio::time::timeout(
                    self.ctx.settings.action_timeout,
                    self.ctx.actions.execute(&request),
                )
                .await
                .unwrap_or_else(|_| Err(ActionError::retryable("action timed out")));

                match result {
                    Ok(outcome) => {
                        let next = self.move_to(scenario, current, order + 1, now)?;
                        let mut t = self.transition(current, next, StepOutcome::Success, now);
                        t.entry.action_result = outcome.result;
                        Ok(t)
                    }
                    Err(err) => self.failure(scenario, current, err, now),
                }
            }
        }
    }

    /// Retryable failures keep the step and back off; terminal failures,
    /// and retryable ones that ran out of attempts, move past the step.
    fn failure(
        &self,
        scenario: &ScenarioDefinition,
        current: &Enrollment,
        err: ActionError,
        now: DateTime<Utc>,
    ) -> ClinicFlowResult<Transition> {
        let attempt = current.attempts + 1;
        let retry = err.is_retryable() && self.ctx.retry.should_retry(attempt);

        let (next, retry_at) = if retry {
            let retry_at = now + self.ctx.retry.backoff(attempt);
            let mut next = current.clone();
            next.attempts = attempt;
            next.next_run_at = Some(retry_at);
            next.updated_at = now;
            (next, Some(retry_at))
        } else {
            let next = self.move_to(scenario, current, current.current_step_order + 1, now)?;
            (next, None)
        };

        warn!(
            enrollment_id = %current.id,
            step_order = current.current_step_order,
            attempt,
            error = %err,
            will_retry = retry,
            "Step failed"
        );
        metrics::counter!("scenario.steps.failed").increment(1);

        let mut t = self.transition(current, next, StepOutcome::Failed, now);
        t.entry.error = Some(err.to_string());
        t.entry.retry_at = retry_at;
        Ok(t)
    }

    /// Positions the enrollment at `target`, completing it when `target`
    /// is past the last step.
    fn move_to(
        &self,
        scenario: &ScenarioDefinition,
        current: &Enrollment,
        target: usize,
        now: DateTime<Utc>,
    ) -> ClinicFlowResult<Enrollment> {
        let Some(step) = scenario.steps.get(target) else {
            let mut done = self.finish(current, EnrollmentStatus::Completed, now)?;
            done.current_step_order = target.max(scenario.steps.len());
            return Ok(done);
        };
        let mut next = current.clone();
        next.current_step_order = target;
        next.cursor += 1;
        next.attempts = 0;
        next.next_run_at = Some(self.ctx.scheduler.compute_next_run(now, &step.delay));
        next.updated_at = now;
        Ok(next)
    }

    fn finish(
        &self,
        current: &Enrollment,
        status: EnrollmentStatus,
        now: DateTime<Utc>,
    ) -> ClinicFlowResult<Enrollment> {
        EnrollmentStateMachine::at(current.status).transition(status)?;
        let mut next = current.clone();
        next.status = status;
        next.next_run_at = None;
        next.cursor += 1;
        next.attempts = 0;
        next.updated_at = now;
        Ok(next)
    }

    fn transition(
        &self,
        current: &Enrollment,
        next: Enrollment,
        outcome: StepOutcome,
        now: DateTime<Utc>,
    ) -> Transition {
        let entry = ExecutionLogEntry {
            id: Uuid::new_v4(),
            enrollment_id: current.id,
            scenario_id: current.scenario_id,
            step_order: current.current_step_order,
            attempted_at: now,
            outcome,
            error: None,
            action_result: None,
            idempotency_key: Some(current.idempotency_key()),
            retry_at: None,
        };
        Transition { next, entry }
    }

    fn report(&self, committed: &Enrollment, step_order: usize, entry: &ExecutionLogEntry) {
        info!(
            enrollment_id = %committed.id,
            scenario_id = %committed.scenario_id,
            step_order,
            outcome = ?entry.outcome,
            status = %committed.status,
            next_step = committed.current_step_order,
            next_run_at = ?committed.next_run_at,
            "Step executed"
        );

        let event_type = match entry.outcome {
            StepOutcome::Success => EngineEventType::StepExecuted,
            StepOutcome::Skipped => EngineEventType::StepSkipped,
            StepOutcome::Branched => EngineEventType::StepBranched,
            StepOutcome::Failed => EngineEventType::StepFailed,
            StepOutcome::Exited => EngineEventType::EnrollmentExited,
        };
        let mut event = make_event(
            event_type,
            committed.scenario_id,
            committed.id,
            committed.recipient_id.as_str(),
            Some(step_order),
        );
        event.detail = entry.error.clone();
        self.ctx.emit(event);

        match committed.status {
            EnrollmentStatus::Completed => {
                metrics::counter!("scenario.enrollments.completed").increment(1);
                self.ctx.emit(make_event(
                    EngineEventType::EnrollmentCompleted,
                    committed.scenario_id,
                    committed.id,
                    committed.recipient_id.as_str(),
                    None,
                ));
            }
            EnrollmentStatus::Exited => {
                metrics::counter!("scenario.enrollments.exited").increment(1);
            }
            _ => {}
        }
    }
}
