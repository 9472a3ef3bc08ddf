use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a message recipient (a clinic patient / channel friend).
pub type RecipientId = String;

/// Lifecycle event emitted by the automation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_id: Uuid,
    pub event_type: EngineEventType,
    pub scenario_id: Uuid,
    pub enrollment_id: Uuid,
    pub recipient_id: RecipientId,
    pub step_order: Option<usize>,
    pub node_id: String,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EngineEventType {
    EnrollmentCreated,
    StepExecuted,
    StepSkipped,
    StepBranched,
    StepFailed,
    EnrollmentCompleted,
    EnrollmentExited,
    EnrollmentPaused,
    EnrollmentResumed,
}
