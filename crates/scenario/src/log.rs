//! Append-only execution history.

use std::collections::HashMap;

use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::types::{ExecutionLogEntry, StepOutcome};

pub trait ExecutionLog: Send + Sync {
    fn append(&self, entry: ExecutionLogEntry);

    /// Entries for one enrollment, oldest first.
    fn entries(&self, enrollment_id: &Uuid) -> Vec<ExecutionLogEntry>;

    /// Successful entry recorded under `idempotency_key`, if any.
    fn find_success(&self, enrollment_id: &Uuid, idempotency_key: &str) -> Option<ExecutionLogEntry>;

    /// Outcome counts over all entries of a scenario.
    fn outcome_counts(&self, scenario_id: &Uuid) -> HashMap<StepOutcome, u64>;

    /// Most recent entries across all enrollments, newest first.
    fn recent(&self, limit: usize) -> Vec<ExecutionLogEntry>;
}

pub struct InMemoryExecutionLog {
    by_enrollment: DashMap<Uuid, Vec<ExecutionLogEntry>>,
    all: RwLock<Vec<ExecutionLogEntry>>,
}

impl InMemoryExecutionLog {
    pub fn new() -> Self {
        Self {
            by_enrollment: DashMap::new(),
            all: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.all.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.read().is_empty()
    }
}

impl Default for InMemoryExecutionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionLog for InMemoryExecutionLog {
    fn append(&self, entry: ExecutionLogEntry) {
        self.by_enrollment
            .entry(entry.enrollment_id)
            .or_default()
            .push(entry.clone());
        self.all.write().push(entry);
    }

    fn entries(&self, enrollment_id: &Uuid) -> Vec<ExecutionLogEntry> {
        self.by_enrollment
            .get(enrollment_id)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn find_success(&self, enrollment_id: &Uuid, idempotency_key: &str) -> Option<ExecutionLogEntry> {
        let entries = self.by_enrollment.get(enrollment_id)?;
        entries
            .iter()
            .rev()
            .find(|e| {
                e.outcome == StepOutcome::Success && e.idempotency_key.as_deref() == Some(idempotency_key)
            })
            .cloned()
    }

    fn outcome_counts(&self, scenario_id: &Uuid) -> HashMap<StepOutcome, u64> {
        let mut counts = HashMap::new();
        for entry in self.all.read().iter().filter(|e| e.scenario_id == *scenario_id) {
            *counts.entry(entry.outcome).or_insert(0) += 1;
        }
        counts
    }

    fn recent(&self, limit: usize) -> Vec<ExecutionLogEntry> {
        self.all.read().iter().rev().take(limit).cloned().collect()
    }
}
