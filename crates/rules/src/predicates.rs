//! Rule grammar and the value comparisons used to evaluate it.

use std::borrow::Cow;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

/// An ordered list of rules joined by a single combinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub combinator: Combinator,
    #[serde(default, deserialize_with = "deserialize_rules")]
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn all(rules: Vec<Rule>) -> Self {
        Self {
            combinator: Combinator::And,
            rules,
        }
    }

    pub fn any(rules: Vec<Rule>) -> Self {
        Self {
            combinator: Combinator::Or,
            rules,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Combinator {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

/// A single condition primitive, dispatched on its `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Rule {
    Tag {
        tag_ids: Vec<String>,
        #[serde(default, rename = "match")]
        match_mode: TagMatch,
    },
    Mark {
        mark_values: Vec<String>,
    },
    Field {
        field_id: String,
        operator: FieldOperator,
        value: serde_json::Value,
    },
    VisitCount(MetricRule),
    PurchaseAmount(MetricRule),
    ReorderCount(MetricRule),
    LastVisit {
        operator: LastVisitOperator,
        value: i64,
    },
    /// Anything that did not parse as a known rule, kept verbatim so it
    /// survives a save and read back. Always false.
    #[serde(untagged)]
    Unknown(serde_json::Value),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMatch {
    #[default]
    Any,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldOperator {
    #[serde(rename = "=", alias = "eq")]
    Equals,
    #[serde(rename = "!=", alias = "neq")]
    NotEquals,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = ">", alias = "gt")]
    GreaterThan,
    #[serde(rename = "<", alias = "lt")]
    LessThan,
}

/// Threshold over a behavioral aggregate (`visit_count`, `purchase_amount`,
/// `reorder_count`) scoped to a look-back window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRule {
    pub operator: MetricOperator,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_end: Option<serde_json::Value>,
    #[serde(default)]
    pub date_range: crate::snapshot::DateRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricOperator {
    #[serde(rename = ">=", alias = "gte")]
    GreaterThanOrEqual,
    #[serde(rename = "<=", alias = "lte")]
    LessThanOrEqual,
    #[serde(rename = "=", alias = "eq")]
    Equals,
    #[serde(rename = "between")]
    Between,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastVisitOperator {
    WithinDays,
    MoreThanDays,
}

/// Rules are parsed one at a time so a single malformed entry degrades to
/// `Rule::Unknown` instead of rejecting the whole set.
fn deserialize_rules<'de, D>(deserializer: D) -> Result<Vec<Rule>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|value| {
            let rule = match serde_json::from_value::<Rule>(value.clone()) {
                Ok(rule) => rule,
                Err(_) => Rule::Unknown(value),
            };
            if let Rule::Unknown(raw) = &rule {
                warn!(rule = %raw, "Unrecognised rule, it will evaluate to false");
            }
            rule
        })
        .collect())
}

/// Reads a JSON value as a number, accepting numeric strings such as `"10000"`.
pub fn as_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Reads a scalar JSON value as text. Null, arrays and objects have no text form.
pub fn as_text(value: &serde_json::Value) -> Option<Cow<'_, str>> {
    match value {
        serde_json::Value::String(s) => Some(Cow::Borrowed(s.as_str())),
        serde_json::Value::Number(n) => Some(Cow::Owned(n.to_string())),
        serde_json::Value::Bool(b) => Some(Cow::Owned(b.to_string())),
        _ => None,
    }
}

fn values_equal(actual: &serde_json::Value, expected: &serde_json::Value) -> bool {
    if let (Some(a), Some(e)) = (as_number(actual), as_number(expected)) {
        return (a - e).abs() < f64::EPSILON;
    }
    match (as_text(actual), as_text(expected)) {
        (Some(a), Some(e)) => a == e,
        _ => actual == expected,
    }
}

pub fn compare_field(
    actual: &serde_json::Value,
    operator: FieldOperator,
    expected: &serde_json::Value,
) -> bool {
    match operator {
        FieldOperator::Equals => values_equal(actual, expected),
        FieldOperator::NotEquals => !values_equal(actual, expected),
        FieldOperator::Contains => match actual {
            serde_json::Value::Array(items) => items.iter().any(|i| values_equal(i, expected)),
            _ => as_text(actual)
                .zip(as_text(expected))
                .is_some_and(|(a, e)| a.contains(e.as_ref())),
        },
        FieldOperator::GreaterThan => as_number(actual)
            .zip(as_number(expected))
            .is_some_and(|(a, e)| a > e),
        FieldOperator::LessThan => as_number(actual)
            .zip(as_number(expected))
            .is_some_and(|(a, e)| a < e),
    }
}

pub fn compare_metric(metric: f64, rule: &MetricRule) -> bool {
    let Some(value) = as_number(&rule.value) else {
        return false;
    };
    match rule.operator {
        MetricOperator::GreaterThanOrEqual => metric >= value,
        MetricOperator::LessThanOrEqual => metric <= value,
        MetricOperator::Equals => (metric - value).abs() < f64::EPSILON,
        MetricOperator::Between => rule
            .value_end
            .as_ref()
            .and_then(as_number)
            .is_some_and(|end| value <= metric && metric <= end),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::DateRange;
    use serde_json::json;

    #[test]
    fn parses_every_known_rule_shape() {
        let set: RuleSet = serde_json::from_value(json!({
            "combinator": "OR",
            "rules": [
                { "type": "tag", "tag_ids": ["t1", "t2"], "match": "all" },
                { "type": "mark", "mark_values": ["gold"] },
                { "type": "field", "field_id": "age", "operator": ">", "value": 30 },
                { "type": "purchase_amount", "operator": ">=", "value": "10000", "date_range": "90d" },
                { "type": "visit_count", "operator": "between", "value": 1, "value_end": 3 },
                { "type": "last_visit", "operator": "within_days", "value": 14 }
            ]
        }))
        .unwrap();

        assert_eq!(set.combinator, Combinator::Or);
        assert_eq!(set.rules.len(), 6);
        assert!(matches!(
            set.rules[0],
            Rule::Tag { match_mode: TagMatch::All, .. }
        ));
        match &set.rules[3] {
            Rule::PurchaseAmount(rule) => {
                assert_eq!(rule.operator, MetricOperator::GreaterThanOrEqual);
                assert_eq!(rule.date_range, DateRange::Days90);
            }
            other => panic!("Expected purchase_amount, got {:?}", other),
        }
        match &set.rules[4] {
            Rule::VisitCount(rule) => assert_eq!(rule.date_range, DateRange::All),
            other => panic!("Expected visit_count, got {:?}", other),
        }
    }

    #[test]
    fn unknown_and_malformed_rules_degrade_to_unknown() {
        let set: RuleSet = serde_json::from_value(json!({
            "rules": [
                { "type": "horoscope", "sign": "leo" },
                { "type": "field", "field_id": "age" },
                { "type": "mark", "mark_values": ["a"] }
            ]
        }))
        .unwrap();

        assert_eq!(set.combinator, Combinator::And);
        assert_eq!(set.rules[0], Rule::Unknown(json!({ "type": "horoscope", "sign": "leo" })));
        assert_eq!(set.rules[1], Rule::Unknown(json!({ "type": "field", "field_id": "age" })));
        assert!(matches!(set.rules[2], Rule::Mark { .. }));
    }

    #[test]
    fn unrecognised_rules_serialize_back_unchanged() {
        let input = json!({
            "combinator": "OR",
            "rules": [
                { "type": "horoscope", "sign": "leo" },
                { "type": "purchase_amount", "value": 5 },
                "not even an object",
                { "type": "mark", "mark_values": ["gold"] }
            ]
        });
        let set: RuleSet = serde_json::from_value(input.clone()).unwrap();
        assert!(matches!(set.rules[2], Rule::Unknown(_)));
        assert_eq!(serde_json::to_value(&set).unwrap(), input);
    }

    #[test]
    fn field_comparisons() {
        assert!(compare_field(&json!("30"), FieldOperator::Equals, &json!(30)));
        assert!(compare_field(&json!("Tokyo"), FieldOperator::NotEquals, &json!("Osaka")));
        assert!(compare_field(&json!("whitening course"), FieldOperator::Contains, &json!("course")));
        assert!(compare_field(&json!(["a", "b"]), FieldOperator::Contains, &json!("b")));
        assert!(compare_field(&json!(41), FieldOperator::GreaterThan, &json!("40")));
        assert!(!compare_field(&json!("abc"), FieldOperator::GreaterThan, &json!(1)));
        assert!(!compare_field(&json!(null), FieldOperator::LessThan, &json!(1)));
    }

    #[test]
    fn between_is_inclusive_on_both_ends() {
        let rule = MetricRule {
            operator: MetricOperator::Between,
            value: json!(3),
            value_end: Some(json!(5)),
            date_range: DateRange::All,
        };
        assert!(!compare_metric(2.0, &rule));
        assert!(compare_metric(3.0, &rule));
        assert!(compare_metric(4.0, &rule));
        assert!(compare_metric(5.0, &rule));
        assert!(!compare_metric(6.0, &rule));

        let open_ended = MetricRule {
            value_end: None,
            ..rule
        };
        assert!(!compare_metric(4.0, &open_ended));
    }

    #[test]
    fn unparseable_threshold_is_false() {
        let rule = MetricRule {
            operator: MetricOperator::GreaterThanOrEqual,
            value: json!("lots"),
            value_end: None,
            date_range: DateRange::All,
        };
        assert!(!compare_metric(1_000_000.0, &rule));
    }
}
