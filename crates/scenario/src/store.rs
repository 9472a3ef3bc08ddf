//! Enrollment persistence with per-enrollment leases and optimistic writes.
//!
//! Two independent guards protect an enrollment row:
//! - the lease (`locked_by` / `locked_until`) keeps two workers from running
//!   the same enrollment at once, and expires so a crashed worker's claim
//!   can be taken over by a later sweep;
//! - the `version` counter makes every write conditional on the row being
//!   unchanged since it was read, so an operator pause/exit is never
//!   overwritten by a step that was already in flight.

use chrono::{DateTime, Duration, Utc};
use clinicflow_core::{ClinicFlowError, ClinicFlowResult};
use dashmap::DashMap;
use uuid::Uuid;

use crate::types::Enrollment;

/// Result of a conditional write.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    Committed(Enrollment),
    /// The row changed since it was read; carries the current row.
    Conflict(Enrollment),
}

pub trait EnrollmentStore: Send + Sync {
    /// Inserts `enrollment` unless the recipient already holds a
    /// non-terminal enrollment in the same scenario. Returns `None` when
    /// nothing was inserted.
    fn create(&self, enrollment: Enrollment, allow_concurrent: bool) -> ClinicFlowResult<Option<Enrollment>>;

    fn get(&self, id: &Uuid) -> Option<Enrollment>;

    /// Active enrollments with `next_run_at <= now`, earliest first.
    fn due(&self, now: DateTime<Utc>, limit: usize) -> Vec<Enrollment>;

    /// Claims the lease when it is free or expired. `None` means another
    /// worker holds a live lease.
    fn try_acquire_lease(
        &self,
        id: &Uuid,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> ClinicFlowResult<Option<Enrollment>>;

    /// Drops the lease if `owner` still holds it.
    fn release_lease(&self, id: &Uuid, owner: &str);

    /// Writes `updated` as given if the stored version equals
    /// `expected_version`, bumping the version. Lease fields are written
    /// through unchanged.
    fn commit(&self, updated: Enrollment, expected_version: u64) -> ClinicFlowResult<CommitOutcome>;

    fn find_live(&self, scenario_id: &Uuid, recipient_id: &str) -> Option<Enrollment>;

    fn list_by_scenario(&self, scenario_id: &Uuid) -> Vec<Enrollment>;

    fn list_by_recipient(&self, recipient_id: &str) -> Vec<Enrollment>;

    /// Active enrollments whose `next_run_at` is at or before `cutoff`.
    fn overdue(&self, cutoff: DateTime<Utc>) -> Vec<Enrollment>;
}

/// DashMap-backed store used by the service and tests.
pub struct InMemoryEnrollmentStore {
    enrollments: DashMap<Uuid, Enrollment>,
    /// (scenario, recipient) -> the single non-terminal enrollment.
    live_index: DashMap<(Uuid, String), Uuid>,
}

impl InMemoryEnrollmentStore {
    pub fn new() -> Self {
        Self {
            enrollments: DashMap::new(),
            live_index: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.enrollments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.enrollments.is_empty()
    }
}

impl Default for InMemoryEnrollmentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EnrollmentStore for InMemoryEnrollmentStore {
    fn create(&self, enrollment: Enrollment, allow_concurrent: bool) -> ClinicFlowResult<Option<Enrollment>> {
        if allow_concurrent {
            self.enrollments.insert(enrollment.id, enrollment.clone());
            return Ok(Some(enrollment));
        }

        let key = (enrollment.scenario_id, enrollment.recipient_id.clone());
        match self.live_index.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(None),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                self.enrollments.insert(enrollment.id, enrollment.clone());
                slot.insert(enrollment.id);
                Ok(Some(enrollment))
            }
        }
    }

    fn get(&self, id: &Uuid) -> Option<Enrollment> {
        self.enrollments.get(id).map(|r| r.clone())
    }

    fn due(&self, now: DateTime<Utc>, limit: usize) -> Vec<Enrollment> {
        let mut due: Vec<Enrollment> = self
            .enrollments
            .iter()
            .filter(|r| r.value().is_due(now))
            .map(|r| r.value().clone())
            .collect();
        due.sort_by_key(|e| e.next_run_at);
        due.truncate(limit);
        due
    }

    fn try_acquire_lease(
        &self,
        id: &Uuid,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> ClinicFlowResult<Option<Enrollment>> {
        let mut entry = self
            .enrollments
            .get_mut(id)
            .ok_or(ClinicFlowError::EnrollmentNotFound(*id))?;

        let held = entry.locked_until.is_some_and(|until| until > now);
        if held {
            return Ok(None);
        }
        entry.locked_by = Some(owner.to_string());
        entry.locked_until = Some(now + lease);
        Ok(Some(entry.clone()))
    }

    fn release_lease(&self, id: &Uuid, owner: &str) {
        if let Some(mut entry) = self.enrollments.get_mut(id) {
            if entry.locked_by.as_deref() == Some(owner) {
                entry.locked_by = None;
                entry.locked_until = None;
            }
        }
    }

    fn commit(&self, mut updated: Enrollment, expected_version: u64) -> ClinicFlowResult<CommitOutcome> {
        let id = updated.id;
        {
            let mut entry = self
                .enrollments
                .get_mut(&id)
                .ok_or(ClinicFlowError::EnrollmentNotFound(id))?;
            if entry.version != expected_version {
                return Ok(CommitOutcome::Conflict(entry.clone()));
            }
            updated.version = expected_version + 1;
            *entry = updated.clone();
        }

        if updated.status.is_terminal() {
            let key = (updated.scenario_id, updated.recipient_id.clone());
            self.live_index.remove_if(&key, |_, live| *live == id);
        }
        Ok(CommitOutcome::Committed(updated))
    }

    fn find_live(&self, scenario_id: &Uuid, recipient_id: &str) -> Option<Enrollment> {
        self.enrollments
            .iter()
            .find(|r| {
                let e = r.value();
                e.scenario_id == *scenario_id
                    && e.recipient_id == recipient_id
                    && !e.status.is_terminal()
            })
            .map(|r| r.value().clone())
    }

    fn list_by_scenario(&self, scenario_id: &Uuid) -> Vec<Enrollment> {
        let mut out: Vec<Enrollment> = self
            .enrollments
            .iter()
            .filter(|r| r.value().scenario_id == *scenario_id)
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|e| e.enrolled_at);
        out
    }

    fn list_by_recipient(&self, recipient_id: &str) -> Vec<Enrollment> {
        let mut out: Vec<Enrollment> = self
            .enrollments
            .iter()
            .filter(|r| r.value().recipient_id == recipient_id)
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|e| e.enrolled_at);
        out
    }

    fn overdue(&self, cutoff: DateTime<Utc>) -> Vec<Enrollment> {
        self.due(cutoff, usize::MAX)
    }
}
