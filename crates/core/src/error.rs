use thiserror::Error;
use uuid::Uuid;

pub type ClinicFlowResult<T> = Result<T, ClinicFlowError>;

#[derive(Error, Debug)]
pub enum ClinicFlowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid scenario definition: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Scenario {0} not found")]
    ScenarioNotFound(Uuid),

    #[error("Enrollment {0} not found")]
    EnrollmentNotFound(Uuid),

    #[error("Invalid enrollment transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// A scenario definition that must be rejected when it is saved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("scenario name must not be empty")]
    EmptyName,

    #[error("scenario has no steps")]
    NoSteps,

    #[error("step at index {index} declares step_order {declared}")]
    StepOrderMismatch { index: usize, declared: usize },

    #[error("step {step_order}: branch target {target} is out of range (steps: {len})")]
    BranchTargetOutOfRange {
        step_order: usize,
        target: usize,
        len: usize,
    },

    #[error("step {step_order}: exit check with action=jump has no jump_target")]
    MissingJumpTarget { step_order: usize },

    #[error("step {step_order}: send_time is only allowed with unit=days")]
    SendTimeWithoutDays { step_order: usize },

    #[error("step {step_order}: invalid webhook url {url:?}")]
    InvalidWebhookUrl { step_order: usize, url: String },

    #[error("step {step_order}: send_message needs content or template_ref")]
    EmptyMessage { step_order: usize },

    #[error("invalid keyword pattern {pattern:?}: {reason}")]
    InvalidKeywordPattern { pattern: String, reason: String },

    #[error("step {step_order}: delay is longer than {max_days} days")]
    DelayTooLong { step_order: usize, max_days: u32 },

    #[error("zero-delay chain starting at step {start} exceeds {limit} steps or loops")]
    ZeroDelayChain { start: usize, limit: usize },
}
