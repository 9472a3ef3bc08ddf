//! Rule evaluation against a recipient snapshot.
//!
//! Evaluation is total: missing attributes, unknown rule types and
//! unparseable thresholds all evaluate to `false` rather than erroring.

use crate::predicates::{
    compare_field, compare_metric, Combinator, LastVisitOperator, Rule, RuleSet, TagMatch,
};
use crate::snapshot::{MetricKind, RecipientSnapshot};

/// Stateless evaluator for rule sets.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleEvaluator;

impl RuleEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// AND over an empty list is true; OR over an empty list is false.
    pub fn evaluate(&self, rule_set: &RuleSet, snapshot: &RecipientSnapshot) -> bool {
        match rule_set.combinator {
            Combinator::And => rule_set
                .rules
                .iter()
                .all(|r| self.evaluate_rule(r, snapshot)),
            Combinator::Or => rule_set
                .rules
                .iter()
                .any(|r| self.evaluate_rule(r, snapshot)),
        }
    }

    pub fn evaluate_rule(&self, rule: &Rule, snapshot: &RecipientSnapshot) -> bool {
        match rule {
            Rule::Tag {
                tag_ids,
                match_mode,
            } => {
                if tag_ids.is_empty() {
                    return false;
                }
                match match_mode {
                    TagMatch::Any => tag_ids.iter().any(|t| snapshot.tags.contains(t)),
                    TagMatch::All => tag_ids.iter().all(|t| snapshot.tags.contains(t)),
                }
            }
            Rule::Mark { mark_values } => snapshot
                .mark
                .as_ref()
                .is_some_and(|mark| mark_values.iter().any(|m| m == mark)),
            Rule::Field {
                field_id,
                operator,
                value,
            } => snapshot
                .fields
                .get(field_id)
                .is_some_and(|actual| compare_field(actual, *operator, value)),
            Rule::VisitCount(rule) => snapshot
                .metric(MetricKind::VisitCount, rule.date_range)
                .is_some_and(|m| compare_metric(m, rule)),
            Rule::PurchaseAmount(rule) => snapshot
                .metric(MetricKind::PurchaseAmount, rule.date_range)
                .is_some_and(|m| compare_metric(m, rule)),
            Rule::ReorderCount(rule) => snapshot
                .metric(MetricKind::ReorderCount, rule.date_range)
                .is_some_and(|m| compare_metric(m, rule)),
            Rule::LastVisit { operator, value } => {
                snapshot
                    .days_since_last_visit()
                    .is_some_and(|days| match operator {
                        LastVisitOperator::WithinDays => days <= *value,
                        LastVisitOperator::MoreThanDays => days > *value,
                    })
            }
            Rule::Unknown(_) => false,
        }
    }
}
