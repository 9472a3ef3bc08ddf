//! Versioned scenario definition store.
//!
//! Every save produces a new immutable version. Enrollments pin the version
//! they were created against, so editing a live scenario never changes the
//! steps an in-flight recipient walks through.

use std::sync::Arc;

use chrono::Utc;
use clinicflow_core::{ClinicFlowError, ClinicFlowResult};
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use crate::types::{ScenarioDefinition, TriggerKind};
use crate::validation::{self, DEFAULT_MAX_ZERO_DELAY_CHAIN};

pub struct ScenarioStore {
    versions: DashMap<(Uuid, u32), Arc<ScenarioDefinition>>,
    latest: DashMap<Uuid, u32>,
    max_zero_delay_chain: usize,
}

impl std::fmt::Debug for ScenarioStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioStore")
            .field("scenarios", &self.latest.len())
            .field("versions", &self.versions.len())
            .finish()
    }
}

impl ScenarioStore {
    pub fn new() -> Self {
        Self::with_chain_limit(DEFAULT_MAX_ZERO_DELAY_CHAIN)
    }

    pub fn with_chain_limit(max_zero_delay_chain: usize) -> Self {
        Self {
            versions: DashMap::new(),
            latest: DashMap::new(),
            max_zero_delay_chain,
        }
    }

    /// Validates and stores `scenario` as the next version of its id.
    pub fn save(&self, mut scenario: ScenarioDefinition) -> ClinicFlowResult<Arc<ScenarioDefinition>> {
        validation::validate(&scenario, self.max_zero_delay_chain)?;

        let mut latest = self.latest.entry(scenario.id).or_insert(0);
        scenario.version = *latest + 1;
        scenario.updated_at = Utc::now();
        let stored = Arc::new(scenario);
        self.versions
            .insert((stored.id, stored.version), stored.clone());
        *latest = stored.version;

        info!(
            scenario_id = %stored.id,
            version = stored.version,
            name = %stored.name,
            steps = stored.steps.len(),
            "Saved scenario"
        );
        Ok(stored)
    }

    pub fn latest(&self, id: &Uuid) -> Option<Arc<ScenarioDefinition>> {
        let version = *self.latest.get(id)?;
        self.get_version(id, version)
    }

    pub fn get_version(&self, id: &Uuid, version: u32) -> Option<Arc<ScenarioDefinition>> {
        self.versions.get(&(*id, version)).map(|r| r.clone())
    }

    /// Latest version of every scenario.
    pub fn list(&self) -> Vec<Arc<ScenarioDefinition>> {
        let mut all: Vec<_> = self
            .latest
            .iter()
            .filter_map(|r| self.get_version(r.key(), *r.value()))
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Enabled scenarios whose trigger listens for `kind`.
    pub fn enabled_for(&self, kind: TriggerKind) -> Vec<Arc<ScenarioDefinition>> {
        self.list()
            .into_iter()
            .filter(|s| s.enabled && s.trigger.kind() == kind)
            .collect()
    }

    /// Stores a new version with only the `enabled` flag changed.
    pub fn set_enabled(&self, id: &Uuid, enabled: bool) -> ClinicFlowResult<Arc<ScenarioDefinition>> {
        let current = self
            .latest(id)
            .ok_or(ClinicFlowError::ScenarioNotFound(*id))?;
        let mut next = (*current).clone();
        next.enabled = enabled;
        self.save(next)
    }
}

impl Default for ScenarioStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Delay, StepAction, StepDefinition, Trigger};

    fn scenario(name: &str, trigger: Trigger) -> ScenarioDefinition {
        ScenarioDefinition {
            id: Uuid::new_v4(),
            name: name.into(),
            enabled: true,
            trigger,
            entry_condition: None,
            steps: vec![StepDefinition {
                step_order: 0,
                delay: Delay::minutes(0),
                action: StepAction::send_text("Thanks for following!"),
                exit_check: None,
            }],
            allow_concurrent_runs: false,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn save_assigns_increasing_versions_and_keeps_old_ones() {
        let store = ScenarioStore::new();
        let draft = scenario("Welcome", Trigger::Follow);
        let id = draft.id;

        let v1 = store.save(draft.clone()).unwrap();
        assert_eq!(v1.version, 1);

        let mut edited = draft;
        edited.steps[0].action = StepAction::send_text("Welcome aboard!");
        let v2 = store.save(edited).unwrap();
        assert_eq!(v2.version, 2);

        assert_eq!(store.latest(&id).unwrap().version, 2);
        let pinned = store.get_version(&id, 1).unwrap();
        assert_eq!(pinned.steps[0].action, StepAction::send_text("Thanks for following!"));
    }

    #[test]
    fn invalid_definitions_are_not_stored() {
        let store = ScenarioStore::new();
        let mut bad = scenario("", Trigger::Follow);
        bad.name = " ".into();
        let id = bad.id;
        assert!(matches!(store.save(bad), Err(ClinicFlowError::Definition(_))));
        assert!(store.latest(&id).is_none());
    }

    #[test]
    fn enabled_for_filters_kind_and_flag() {
        let store = ScenarioStore::new();
        let follow = store.save(scenario("A follow", Trigger::Follow)).unwrap();
        store.save(scenario("B paid", Trigger::PaymentCompleted)).unwrap();

        assert_eq!(store.enabled_for(TriggerKind::Follow).len(), 1);

        let disabled = store.set_enabled(&follow.id, false).unwrap();
        assert_eq!(disabled.version, 2);
        assert!(store.enabled_for(TriggerKind::Follow).is_empty());
        assert_eq!(store.list().len(), 2);
    }

    #[test]
    fn set_enabled_on_missing_scenario() {
        let store = ScenarioStore::new();
        let missing = Uuid::new_v4();
        assert!(matches!(
            store.set_enabled(&missing, true),
            Err(ClinicFlowError::ScenarioNotFound(id)) if id == missing
        ));
    }
}
