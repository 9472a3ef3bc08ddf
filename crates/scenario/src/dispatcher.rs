//! Trigger dispatch: inbound domain events become enrollments.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use clinicflow_core::event_bus::make_event;
use clinicflow_core::types::EngineEventType;
use clinicflow_core::ClinicFlowResult;
use clinicflow_rules::RecipientSnapshot;

use crate::context::EngineContext;
use crate::types::{Enrollment, KeywordMatch, ScenarioDefinition, Trigger, TriggerKind};

/// A domain event as delivered by the messaging platform or booking system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TriggerEvent {
    pub fn new(recipient_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            recipient_id: Some(recipient_id.into()),
            occurred_at: Utc::now(),
            kind,
            payload: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EventKind {
    Follow,
    TagAdded {
        tag_id: String,
    },
    Keyword {
        text: String,
    },
    ReservationCompleted,
    PaymentCompleted,
    TagAdd {
        tag_id: String,
    },
    FormSubmitted {
        form_id: String,
    },
    Scheduled {
        #[serde(default)]
        cron_ref: Option<String>,
    },
    /// Operator-initiated; may name several recipients and one scenario.
    Manual {
        #[serde(default)]
        recipient_ids: Vec<String>,
        #[serde(default)]
        scenario_id: Option<Uuid>,
    },
}

impl EventKind {
    pub fn trigger_kind(&self) -> TriggerKind {
        match self {
            EventKind::Follow => TriggerKind::Follow,
            EventKind::TagAdded { .. } => TriggerKind::TagAdded,
            EventKind::Keyword { .. } => TriggerKind::Keyword,
            EventKind::ReservationCompleted => TriggerKind::ReservationCompleted,
            EventKind::PaymentCompleted => TriggerKind::PaymentCompleted,
            EventKind::TagAdd { .. } => TriggerKind::TagAdd,
            EventKind::FormSubmitted { .. } => TriggerKind::FormSubmitted,
            EventKind::Scheduled { .. } => TriggerKind::Scheduled,
            EventKind::Manual { .. } => TriggerKind::Manual,
        }
    }
}

/// Matches events against enabled scenarios and creates enrollments.
pub struct TriggerDispatcher {
    ctx: EngineContext,
    patterns: DashMap<String, Arc<Regex>>,
}

impl TriggerDispatcher {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            patterns: DashMap::new(),
        }
    }

    /// Enrolls every matching recipient into every matching scenario and
    /// returns the enrollments that were created.
    pub async fn on_event(&self, event: &TriggerEvent) -> ClinicFlowResult<Vec<Enrollment>> {
        let kind = event.kind.trigger_kind();
        metrics::counter!("scenario.events.received").increment(1);

        let recipients = recipients_of(event);
        if recipients.is_empty() {
            warn!(event_type = ?kind, "Event without recipient, ignoring");
            return Ok(Vec::new());
        }

        let candidates: Vec<Arc<ScenarioDefinition>> = self
            .ctx
            .scenarios
            .enabled_for(kind)
            .into_iter()
            .filter(|s| self.trigger_matches(&s.trigger, &event.kind))
            .filter(|s| match &event.kind {
                EventKind::Manual {
                    scenario_id: Some(id),
                    ..
                } => s.id == *id,
                _ => true,
            })
            .collect();
        if candidates.is_empty() {
            debug!(event_type = ?kind, "No scenario listens for event");
            return Ok(Vec::new());
        }

        let mut snapshots: HashMap<&str, Option<RecipientSnapshot>> = HashMap::new();
        let mut created = Vec::new();
        for scenario in &candidates {
            for recipient in &recipients {
                if let Some(condition) = &scenario.entry_condition {
                    if !snapshots.contains_key(recipient.as_str()) {
                        let snapshot = self.fetch_snapshot(recipient).await;
                        snapshots.insert(recipient.as_str(), snapshot);
                    }
                    let passes = snapshots
                        .get(recipient.as_str())
                        .and_then(|s| s.as_ref())
                        .is_some_and(|s| self.ctx.evaluator.evaluate(condition, s));
                    if !passes {
                        debug!(
                            scenario_id = %scenario.id,
                            recipient_id = %recipient,
                            "Entry condition not met"
                        );
                        continue;
                    }
                }
                if let Some(enrollment) = enroll(&self.ctx, scenario, recipient)? {
                    created.push(enrollment);
                }
            }
        }
        Ok(created)
    }

    /// Checks a trigger's parameters against the event payload. The kind
    /// has already been matched.
    pub fn trigger_matches(&self, trigger: &Trigger, event: &EventKind) -> bool {
        match (trigger, event) {
            (Trigger::TagAdded { tag_id: want }, EventKind::TagAdded { tag_id })
            | (Trigger::TagAdd { tag_id: want }, EventKind::TagAdd { tag_id }) => {
                want.as_deref().map_or(true, |w| w == tag_id.as_str())
            }
            (Trigger::FormSubmitted { form_id: want }, EventKind::FormSubmitted { form_id }) => {
                want.as_deref().map_or(true, |w| w == form_id.as_str())
            }
            (Trigger::Scheduled { cron_ref: want }, EventKind::Scheduled { cron_ref }) => {
                match want {
                    None => true,
                    Some(w) => cron_ref.as_deref() == Some(w.as_str()),
                }
            }
            (
                Trigger::Keyword {
                    keywords,
                    match_mode,
                },
                EventKind::Keyword { text },
            ) => keywords
                .iter()
                .any(|k| self.keyword_matches(k, *match_mode, text)),
            (Trigger::Manual, EventKind::Manual { .. }) => true,
            (trigger, event) => trigger.kind() == event.trigger_kind(),
        }
    }

    fn keyword_matches(&self, keyword: &str, mode: KeywordMatch, text: &str) -> bool {
        match mode {
            KeywordMatch::Exact => text.trim() == keyword.trim(),
            KeywordMatch::Partial => text.contains(keyword.trim()),
            KeywordMatch::Regex => self.pattern(keyword).is_some_and(|re| re.is_match(text)),
        }
    }

    fn pattern(&self, keyword: &str) -> Option<Arc<Regex>> {
        if let Some(re) = self.patterns.get(keyword) {
            return Some(re.clone());
        }
        match Regex::new(keyword) {
            Ok(re) => {
                let re = Arc::new(re);
                self.patterns.insert(keyword.to_string(), re.clone());
                Some(re)
            }
            Err(e) => {
                // Saved definitions are validated; this only fires for hand-built ones.
                warn!(pattern = %keyword, error = %e, "Invalid keyword pattern");
                None
            }
        }
    }

    async fn fetch_snapshot(&self, recipient_id: &str) -> Option<RecipientSnapshot> {
        match self.ctx.attributes.snapshot(recipient_id).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(recipient_id = %recipient_id, error = %e, "Snapshot fetch failed, skipping entry");
                metrics::counter!("scenario.snapshot.errors").increment(1);
                None
            }
        }
    }
}

fn recipients_of(event: &TriggerEvent) -> Vec<String> {
    let mut out: Vec<String> = event.recipient_id.iter().cloned().collect();
    if let EventKind::Manual { recipient_ids, .. } = &event.kind {
        for id in recipient_ids {
            if !out.contains(id) {
                out.push(id.clone());
            }
        }
    }
    out
}

/// Creates an enrollment positioned at step 0, unless the recipient already
/// holds a live one and the scenario forbids concurrent runs.
pub(crate) fn enroll(
    ctx: &EngineContext,
    scenario: &ScenarioDefinition,
    recipient_id: &str,
) -> ClinicFlowResult<Option<Enrollment>> {
    let now = ctx.clock.now();
    let next_run_at = match scenario.steps.first() {
        Some(step) => ctx.scheduler.compute_next_run(now, &step.delay),
        None => now,
    };
    let enrollment = Enrollment::new(scenario, recipient_id, now, next_run_at);

    let Some(created) = ctx
        .enrollments
        .create(enrollment, scenario.allow_concurrent_runs)?
    else {
        debug!(
            scenario_id = %scenario.id,
            recipient_id = %recipient_id,
            "Recipient already enrolled"
        );
        metrics::counter!("scenario.enrollments.duplicate").increment(1);
        return Ok(None);
    };

    info!(
        enrollment_id = %created.id,
        scenario_id = %scenario.id,
        scenario_version = scenario.version,
        recipient_id = %recipient_id,
        next_run_at = %next_run_at,
        "Enrollment created"
    );
    metrics::counter!("scenario.enrollments.created").increment(1);
    ctx.emit(make_event(
        EngineEventType::EnrollmentCreated,
        scenario.id,
        created.id,
        recipient_id,
        Some(0),
    ));
    Ok(Some(created))
}
