//! Collaborator interfaces the engine depends on but does not implement:
//! recipient snapshots in, side effects out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use clinicflow_rules::RecipientSnapshot;

use crate::clock::Clock;
use crate::types::StepAction;

/// Supplies point-in-time recipient attributes for rule evaluation.
#[async_trait]
pub trait AttributeProvider: Send + Sync {
    async fn snapshot(&self, recipient_id: &str) -> anyhow::Result<RecipientSnapshot>;
}

/// One side effect to perform for one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub enrollment_id: Uuid,
    pub scenario_id: Uuid,
    pub step_order: usize,
    pub recipient_id: String,
    /// Stable across retries of the same step visit.
    pub idempotency_key: String,
    pub action: StepAction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    /// Transport-specific result, stored on the log entry.
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActionError {
    /// Rate limit, transient network failure: try again later.
    #[error("retryable action failure: {reason}")]
    Retryable { reason: String },
    /// Invalid recipient, removed target: never succeeds.
    #[error("terminal action failure: {reason}")]
    Terminal { reason: String },
}

impl ActionError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        ActionError::Retryable {
            reason: reason.into(),
        }
    }

    pub fn terminal(reason: impl Into<String>) -> Self {
        ActionError::Terminal {
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ActionError::Retryable { .. })
    }
}

/// Performs step actions. Implementations must tolerate repeated calls
/// with the same `idempotency_key`.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, request: &ActionRequest) -> Result<ActionOutcome, ActionError>;
}

/// Snapshot source backed by a map. Unknown recipients get an empty
/// snapshot, so every rule about them evaluates to `false`.
pub struct InMemoryAttributeProvider {
    snapshots: DashMap<String, RecipientSnapshot>,
    clock: Arc<dyn Clock>,
}

impl InMemoryAttributeProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            snapshots: DashMap::new(),
            clock,
        }
    }

    pub fn upsert(&self, snapshot: RecipientSnapshot) {
        self.snapshots.insert(snapshot.recipient_id.clone(), snapshot);
    }

    pub fn remove(&self, recipient_id: &str) {
        self.snapshots.remove(recipient_id);
    }

    /// Applies `f` to the stored snapshot, creating an empty one first if needed.
    pub fn update<F>(&self, recipient_id: &str, f: F)
    where
        F: FnOnce(&mut RecipientSnapshot),
    {
        let now = self.clock.now();
        let mut entry = self
            .snapshots
            .entry(recipient_id.to_string())
            .or_insert_with(|| RecipientSnapshot::new(recipient_id, now));
        f(entry.value_mut());
    }
}

#[async_trait]
impl AttributeProvider for InMemoryAttributeProvider {
    async fn snapshot(&self, recipient_id: &str) -> anyhow::Result<RecipientSnapshot> {
        let now = self.clock.now();
        let mut snapshot = self
            .snapshots
            .get(recipient_id)
            .map(|r| r.clone())
            .unwrap_or_else(|| RecipientSnapshot::new(recipient_id, now));
        snapshot.taken_at = now;
        Ok(snapshot)
    }
}

/// Logs each action instead of delivering it. Used when the service runs
/// without a messaging transport attached.
#[derive(Debug, Default)]
pub struct TracingActionExecutor;

#[async_trait]
impl ActionExecutor for TracingActionExecutor {
    async fn execute(&self, request: &ActionRequest) -> Result<ActionOutcome, ActionError> {
        info!(
            enrollment_id = %request.enrollment_id,
            recipient_id = %request.recipient_id,
            step_order = request.step_order,
            action = request.action.label(),
            idempotency_key = %request.idempotency_key,
            "Executing action"
        );
        metrics::counter!("scenario.actions.executed").increment(1);
        Ok(ActionOutcome {
            result: Some(serde_json::json!({ "delivered": false, "logged": true })),
        })
    }
}

/// Test double: records every call and replays scripted failures.
#[derive(Default)]
pub struct RecordingActionExecutor {
    calls: Mutex<Vec<ActionRequest>>,
    /// Failures returned, in order, for calls on a given step.
    scripted: Mutex<HashMap<usize, Vec<ActionError>>>,
    delay: Option<Duration>,
}

impl RecordingActionExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `delay` before returning.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queues `error` for the next call on `step_order`.
    pub fn fail_step(&self, step_order: usize, error: ActionError) {
        self.scripted.lock().entry(step_order).or_default().push(error);
    }

    pub fn calls(&self) -> Vec<ActionRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Text of every `send_message` call, in call order.
    pub fn sent_texts(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match &c.action {
                StepAction::SendMessage { content, .. } => content.clone(),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ActionExecutor for RecordingActionExecutor {
    async fn execute(&self, request: &ActionRequest) -> Result<ActionOutcome, ActionError> {
        self.calls.lock().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = {
            let mut scripted = self.scripted.lock();
            scripted
                .get_mut(&request.step_order)
                .filter(|queue| !queue.is_empty())
                .map(|queue| queue.remove(0))
        };
        match scripted {
            Some(err) => Err(err),
            None => Ok(ActionOutcome {
                result: Some(serde_json::json!({ "key": request.idempotency_key })),
            }),
        }
    }
}
