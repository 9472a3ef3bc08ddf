use clinicflow_core::{ClinicFlowError, ClinicFlowResult};
use serde::{Deserialize, Serialize};

use crate::types::EnrollmentStatus;

/// Describes a single valid state transition for an enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: EnrollmentStatus,
    pub to: EnrollmentStatus,
    pub trigger: String,
}

/// Guards the enrollment lifecycle by enforcing a finite set of valid
/// state transitions. `completed` and `exited` have no outgoing edges.
#[derive(Debug, Clone)]
pub struct EnrollmentStateMachine {
    pub state: EnrollmentStatus,
    pub transitions: Vec<StateTransition>,
}

impl EnrollmentStateMachine {
    /// Creates a state machine starting in `Active` with all valid
    /// transitions pre-configured.
    pub fn new() -> Self {
        Self::at(EnrollmentStatus::Active)
    }

    /// Creates a state machine positioned at `state`.
    pub fn at(state: EnrollmentStatus) -> Self {
        let edge = |from, to, trigger: &str| StateTransition {
            from,
            to,
            trigger: trigger.to_string(),
        };
        let transitions = vec![
            // Active ->
            edge(EnrollmentStatus::Active, EnrollmentStatus::Completed, "steps_exhausted"),
            edge(EnrollmentStatus::Active, EnrollmentStatus::Exited, "exit_check"),
            edge(EnrollmentStatus::Active, EnrollmentStatus::Paused, "operator_pause"),
            // Paused ->
            edge(EnrollmentStatus::Paused, EnrollmentStatus::Active, "operator_resume"),
            edge(EnrollmentStatus::Paused, EnrollmentStatus::Exited, "operator_exit"),
        ];

        Self { state, transitions }
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: &EnrollmentStatus, to: &EnrollmentStatus) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.to == *to)
    }

    /// Attempts to move the state machine to `to`.
    pub fn transition(&mut self, to: EnrollmentStatus) -> ClinicFlowResult<()> {
        if self.can_transition(&self.state, &to) {
            self.state = to;
            Ok(())
        } else {
            Err(ClinicFlowError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            })
        }
    }
}

impl Default for EnrollmentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
