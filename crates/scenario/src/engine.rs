use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use clinicflow_core::event_bus::make_event;
use clinicflow_core::types::EngineEventType;
use clinicflow_core::{ClinicFlowError, ClinicFlowResult};

use crate::context::EngineContext;
use crate::dispatcher::{enroll, TriggerDispatcher, TriggerEvent};
use crate::executor::{StepExecutor, StepRun};
use crate::state_machine::EnrollmentStateMachine;
use crate::store::CommitOutcome;
use crate::sweeper::Sweeper;
use crate::types::{
    Enrollment, EnrollmentStatus, ExecutionLogEntry, ScenarioDefinition, ScenarioStats,
};

/// Operator retries when an enrollment is written concurrently.
const OPERATOR_WRITE_ATTEMPTS: usize = 3;

/// Operator-facing facade over the scenario engine: definitions,
/// inbound events, manual enrollment and enrollment lifecycle control.
#[derive(Clone)]
pub struct ScenarioEngine {
    ctx: EngineContext,
    dispatcher: Arc<TriggerDispatcher>,
    executor: Arc<StepExecutor>,
}

impl std::fmt::Debug for ScenarioEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioEngine")
            .field("ctx", &self.ctx)
            .finish()
    }
}

impl ScenarioEngine {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            dispatcher: Arc::new(TriggerDispatcher::new(ctx.clone())),
            executor: Arc::new(StepExecutor::new(ctx.clone())),
            ctx,
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// A sweeper sharing this engine's executor.
    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(self.ctx.clone(), self.executor.clone())
    }

    // ─── Definitions ────────────────────────────────────────────────────

    pub fn save_scenario(&self, scenario: ScenarioDefinition) -> ClinicFlowResult<Arc<ScenarioDefinition>> {
        self.ctx.scenarios.save(scenario)
    }

    pub fn get_scenario(&self, id: &Uuid) -> Option<Arc<ScenarioDefinition>> {
        self.ctx.scenarios.latest(id)
    }

    pub fn list_scenarios(&self) -> Vec<Arc<ScenarioDefinition>> {
        self.ctx.scenarios.list()
    }

    pub fn set_scenario_enabled(&self, id: &Uuid, enabled: bool) -> ClinicFlowResult<Arc<ScenarioDefinition>> {
        info!(scenario_id = %id, enabled, "Setting scenario enabled flag");
        self.ctx.scenarios.set_enabled(id, enabled)
    }

    // ─── Enrollment ─────────────────────────────────────────────────────

    pub async fn handle_event(&self, event: &TriggerEvent) -> ClinicFlowResult<Vec<Enrollment>> {
        self.dispatcher.on_event(event).await
    }

    /// Enrolls one recipient regardless of trigger and entry condition.
    /// Returns `None` if the recipient is already enrolled.
    pub fn enroll_manual(&self, scenario_id: &Uuid, recipient_id: &str) -> ClinicFlowResult<Option<Enrollment>> {
        let scenario = self
            .get_scenario(scenario_id)
            .ok_or(ClinicFlowError::ScenarioNotFound(*scenario_id))?;
        info!(scenario_id = %scenario_id, recipient_id = %recipient_id, "Manual enrollment");
        enroll(&self.ctx, &scenario, recipient_id)
    }

    /// Evaluates the scenario's entry condition for each recipient and
    /// enrolls those that match.
    pub async fn apply_to_all(
        &self,
        scenario_id: &Uuid,
        recipient_ids: &[String],
    ) -> ClinicFlowResult<Vec<Enrollment>> {
        let scenario = self
            .get_scenario(scenario_id)
            .ok_or(ClinicFlowError::ScenarioNotFound(*scenario_id))?;

        let mut created = Vec::new();
        for recipient_id in recipient_ids {
            if let Some(condition) = &scenario.entry_condition {
                let snapshot = match self.ctx.attributes.snapshot(recipient_id).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(recipient_id = %recipient_id, error = %e, "Snapshot fetch failed, skipping");
                        continue;
                    }
                };
                if !self.ctx.evaluator.evaluate(condition, &snapshot) {
                    continue;
                }
            }
            if let Some(enrollment) = enroll(&self.ctx, &scenario, recipient_id)? {
                created.push(enrollment);
            }
        }

        info!(
            scenario_id = %scenario_id,
            candidates = recipient_ids.len(),
            enrolled = created.len(),
            "Applied scenario to recipients"
        );
        Ok(created)
    }

    /// Runs one enrollment's current step now, if it is due.
    pub async fn run_step(&self, enrollment_id: Uuid) -> ClinicFlowResult<StepRun> {
        self.executor.run_step(enrollment_id).await
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Stops scheduling an active enrollment.
    pub fn pause(&self, enrollment_id: &Uuid) -> ClinicFlowResult<Enrollment> {
        self.operator_transition(enrollment_id, EnrollmentStatus::Paused)
    }

    /// Reschedules a paused enrollment's current step from now.
    pub fn resume(&self, enrollment_id: &Uuid) -> ClinicFlowResult<Enrollment> {
        self.operator_transition(enrollment_id, EnrollmentStatus::Active)
    }

    /// Removes a recipient from the scenario for good.
    pub fn exit(&self, enrollment_id: &Uuid) -> ClinicFlowResult<Enrollment> {
        self.operator_transition(enrollment_id, EnrollmentStatus::Exited)
    }

    fn operator_transition(&self, id: &Uuid, to: EnrollmentStatus) -> ClinicFlowResult<Enrollment> {
        for _ in 0..OPERATOR_WRITE_ATTEMPTS {
            let current = self
                .ctx
                .enrollments
                .get(id)
                .ok_or(ClinicFlowError::EnrollmentNotFound(*id))?;
            EnrollmentStateMachine::at(current.status).transition(to)?;

            let now = self.ctx.clock.now();
            let mut next = current.clone();
            next.status = to;
            next.updated_at = now;
            next.next_run_at = match to {
                EnrollmentStatus::Active => Some(self.resume_at(&current, now)),
                _ => None,
            };

            match self.ctx.enrollments.commit(next, current.version)? {
                CommitOutcome::Committed(updated) => {
                    info!(
                        enrollment_id = %id,
                        from = %current.status,
                        to = %updated.status,
                        "Operator transition"
                    );
                    metrics::counter!("scenario.enrollments.operator_transitions").increment(1);
                    let event_type = match to {
                        EnrollmentStatus::Paused => EngineEventType::EnrollmentPaused,
                        EnrollmentStatus::Active => EngineEventType::EnrollmentResumed,
                        _ => EngineEventType::EnrollmentExited,
                    };
                    self.ctx.emit(make_event(
                        event_type,
                        updated.scenario_id,
                        updated.id,
                        updated.recipient_id.as_str(),
                        Some(updated.current_step_order),
                    ));
                    return Ok(updated);
                }
                CommitOutcome::Conflict(_) => continue,
            }
        }
        Err(ClinicFlowError::Storage(format!(
            "enrollment {} kept changing, giving up",
            id
        )))
    }

    fn resume_at(&self, enrollment: &Enrollment, now: DateTime<Utc>) -> DateTime<Utc> {
        self.ctx
            .scenarios
            .get_version(&enrollment.scenario_id, enrollment.scenario_version)
            .and_then(|s| s.steps.get(enrollment.current_step_order).map(|step| step.delay))
            .map_or(now, |delay| self.ctx.scheduler.compute_next_run(now, &delay))
    }

    // ─── Reads ──────────────────────────────────────────────────────────

    pub fn get_enrollment(&self, id: &Uuid) -> Option<Enrollment> {
        self.ctx.enrollments.get(id)
    }

    pub fn enrollments_for_scenario(&self, scenario_id: &Uuid) -> Vec<Enrollment> {
        self.ctx.enrollments.list_by_scenario(scenario_id)
    }

    pub fn enrollments_for_recipient(&self, recipient_id: &str) -> Vec<Enrollment> {
        self.ctx.enrollments.list_by_recipient(recipient_id)
    }

    pub fn execution_log(&self, enrollment_id: &Uuid) -> Vec<ExecutionLogEntry> {
        self.ctx.log.entries(enrollment_id)
    }

    /// Active enrollments overdue by more than the stuck threshold with no
    /// log activity inside that window.
    pub fn stuck_enrollments(&self, now: DateTime<Utc>) -> Vec<Enrollment> {
        let cutoff = now - self.ctx.settings.stuck_threshold;
        self.ctx
            .enrollments
            .overdue(cutoff)
            .into_iter()
            .filter(|e| {
                self.ctx
                    .log
                    .entries(&e.id)
                    .last()
                    .map_or(true, |last| last.attempted_at < cutoff)
            })
            .collect()
    }

    /// Computes aggregate statistics for the given scenario.
    pub fn scenario_stats(&self, scenario_id: &Uuid) -> ScenarioStats {
        let mut stats = ScenarioStats {
            scenario_id: *scenario_id,
            total_enrolled: 0,
            active: 0,
            paused: 0,
            completed: 0,
            exited: 0,
            avg_completion_time_secs: 0.0,
            outcome_counts: self.ctx.log.outcome_counts(scenario_id),
        };
        let mut total_completion_secs = 0.0;

        for e in self.ctx.enrollments.list_by_scenario(scenario_id) {
            stats.total_enrolled += 1;
            match e.status {
                EnrollmentStatus::Active => stats.active += 1,
                EnrollmentStatus::Paused => stats.paused += 1,
                EnrollmentStatus::Completed => {
                    stats.completed += 1;
                    total_completion_secs +=
                        e.updated_at.signed_duration_since(e.enrolled_at).num_seconds() as f64;
                }
                EnrollmentStatus::Exited => stats.exited += 1,
            }
        }
        if stats.completed > 0 {
            stats.avg_completion_time_secs = total_completion_secs / stats.completed as f64;
        }
        stats
    }
}
