use std::collections::HashMap;

use chrono::{DateTime, NaiveTime, Utc};
use clinicflow_core::types::RecipientId;
use clinicflow_rules::RuleSet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A scenario: a trigger plus an ordered list of steps that each enrolled
/// recipient walks through over time.
///
/// Definitions are immutable once stored; edits produce a new `version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub trigger: Trigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_condition: Option<RuleSet>,
    pub steps: Vec<StepDefinition>,
    /// Lets a recipient hold more than one live enrollment in this scenario.
    #[serde(default)]
    pub allow_concurrent_runs: bool,
    /// Assigned by the definition store on save.
    #[serde(default)]
    pub version: u32,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

/// What enrolls a recipient into a scenario, with its matching parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Trigger {
    Follow,
    TagAdded {
        #[serde(default)]
        tag_id: Option<String>,
    },
    Keyword {
        keywords: Vec<String>,
        #[serde(default)]
        match_mode: KeywordMatch,
    },
    ReservationCompleted,
    PaymentCompleted,
    /// Older spelling of `tag_added` still emitted by some producers.
    TagAdd {
        #[serde(default)]
        tag_id: Option<String>,
    },
    FormSubmitted {
        #[serde(default)]
        form_id: Option<String>,
    },
    Scheduled {
        #[serde(default)]
        cron_ref: Option<String>,
    },
    Manual,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordMatch {
    #[default]
    Exact,
    Partial,
    Regex,
}

/// Event type discriminant shared by triggers and inbound events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Follow,
    TagAdded,
    Keyword,
    ReservationCompleted,
    PaymentCompleted,
    TagAdd,
    FormSubmitted,
    Scheduled,
    Manual,
}

impl Trigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::Follow => TriggerKind::Follow,
            Trigger::TagAdded { .. } => TriggerKind::TagAdded,
            Trigger::Keyword { .. } => TriggerKind::Keyword,
            Trigger::ReservationCompleted => TriggerKind::ReservationCompleted,
            Trigger::PaymentCompleted => TriggerKind::PaymentCompleted,
            Trigger::TagAdd { .. } => TriggerKind::TagAdd,
            Trigger::FormSubmitted { .. } => TriggerKind::FormSubmitted,
            Trigger::Scheduled { .. } => TriggerKind::Scheduled,
            Trigger::Manual => TriggerKind::Manual,
        }
    }
}

/// One step of a scenario. `step_order` equals its index in the owning
/// scenario and doubles as a branch/jump target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub step_order: usize,
    #[serde(default)]
    pub delay: Delay,
    pub action: StepAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_check: Option<ExitCheck>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    #[default]
    Minutes,
    Hours,
    Days,
}

/// Wait before a step runs, measured from when the previous step ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delay {
    pub unit: DelayUnit,
    pub value: u32,
    /// Wall-clock time of day; only meaningful with `unit = days`.
    #[serde(default, with = "hhmm", skip_serializing_if = "Option::is_none")]
    pub send_time: Option<NaiveTime>,
}

impl Delay {
    pub fn minutes(value: u32) -> Self {
        Self {
            unit: DelayUnit::Minutes,
            value,
            send_time: None,
        }
    }

    pub fn hours(value: u32) -> Self {
        Self {
            unit: DelayUnit::Hours,
            value,
            send_time: None,
        }
    }

    pub fn days(value: u32) -> Self {
        Self {
            unit: DelayUnit::Days,
            value,
            send_time: None,
        }
    }

    pub fn days_at(value: u32, send_time: NaiveTime) -> Self {
        Self {
            unit: DelayUnit::Days,
            value,
            send_time: Some(send_time),
        }
    }

    /// True when the step becomes due the moment the previous one finishes.
    /// Day-unit delays never are: they always land strictly after now.
    pub fn is_immediate(&self) -> bool {
        self.value == 0 && self.unit != DelayUnit::Days
    }
}

/// The side effect (or branch) a step performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StepAction {
    SendMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        template_ref: Option<String>,
    },
    AddTag {
        tag_id: String,
    },
    RemoveTag {
        tag_id: String,
    },
    ChangeMark {
        mark_value: String,
    },
    SwitchMenu {
        menu_id: String,
    },
    Webhook {
        url: String,
    },
    Wait,
    /// Branch: continue at `on_true` / `on_false`, or the next step when unset.
    Condition {
        rule_set: RuleSet,
        #[serde(default)]
        on_true: Option<usize>,
        #[serde(default)]
        on_false: Option<usize>,
    },
}

impl StepAction {
    pub fn send_text(content: impl Into<String>) -> Self {
        StepAction::SendMessage {
            content: Some(content.into()),
            template_ref: None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StepAction::SendMessage { .. } => "send_message",
            StepAction::AddTag { .. } => "add_tag",
            StepAction::RemoveTag { .. } => "remove_tag",
            StepAction::ChangeMark { .. } => "change_mark",
            StepAction::SwitchMenu { .. } => "switch_menu",
            StepAction::Webhook { .. } => "webhook",
            StepAction::Wait => "wait",
            StepAction::Condition { .. } => "condition",
        }
    }
}

/// Checked before a step's action runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitCheck {
    pub rule_set: RuleSet,
    pub action: ExitAction,
    #[serde(default)]
    pub jump_target: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitAction {
    Exit,
    Skip,
    Jump,
}

/// One recipient's progress through one scenario run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub scenario_id: Uuid,
    /// Definition version this run is pinned to.
    pub scenario_version: u32,
    pub recipient_id: RecipientId,
    pub status: EnrollmentStatus,
    pub current_step_order: usize,
    /// `None` exactly when the enrollment is not active.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Failed attempts of the current step.
    pub attempts: u32,
    /// Number of step transitions so far; part of the idempotency key.
    pub cursor: u64,
    /// Optimistic concurrency token, bumped on every persisted change.
    pub version: u64,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn new(
        scenario: &ScenarioDefinition,
        recipient_id: impl Into<RecipientId>,
        now: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            scenario_id: scenario.id,
            scenario_version: scenario.version,
            recipient_id: recipient_id.into(),
            status: EnrollmentStatus::Active,
            current_step_order: 0,
            next_run_at: Some(next_run_at),
            attempts: 0,
            cursor: 0,
            version: 0,
            locked_by: None,
            locked_until: None,
            enrolled_at: now,
            updated_at: now,
        }
    }

    /// Key handed to the action executor so a re-attempt of the same step
    /// visit can be de-duplicated downstream.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.id, self.current_step_order, self.cursor)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EnrollmentStatus::Active && self.next_run_at.is_some_and(|t| t <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
    Exited,
}

impl EnrollmentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, EnrollmentStatus::Completed | EnrollmentStatus::Exited)
    }
}

impl std::fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Paused => "paused",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Exited => "exited",
        };
        f.write_str(label)
    }
}

/// Append-only record of one step attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub scenario_id: Uuid,
    pub step_order: usize,
    pub attempted_at: DateTime<Utc>,
    pub outcome: StepOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Set on failed attempts that will be retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failed,
    Skipped,
    Branched,
    Exited,
}

/// Aggregate statistics for a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioStats {
    pub scenario_id: Uuid,
    pub total_enrolled: u64,
    pub active: u64,
    pub paused: u64,
    pub completed: u64,
    pub exited: u64,
    pub avg_completion_time_secs: f64,
    pub outcome_counts: HashMap<StepOutcome, u64>,
}

/// `send_time` travels as `"HH:MM"` (seconds optional on input).
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<NaiveTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(t) => serializer.serialize_str(&t.format("%H:%M").to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|s| {
            NaiveTime::parse_from_str(&s, "%H:%M")
                .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}
