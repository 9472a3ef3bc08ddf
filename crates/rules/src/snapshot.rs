//! Point-in-time view of a recipient's attributes.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Look-back window for behavioral aggregates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DateRange {
    #[default]
    #[serde(rename = "all")]
    All,
    #[serde(rename = "30d")]
    Days30,
    #[serde(rename = "90d")]
    Days90,
    #[serde(rename = "180d")]
    Days180,
    #[serde(rename = "365d")]
    Days365,
}

/// Which behavioral aggregate a metric rule reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    VisitCount,
    PurchaseAmount,
    ReorderCount,
}

/// Recipient attributes as supplied by the attribute provider. The engine
/// only reads these; the provider owns the source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientSnapshot {
    pub recipient_id: String,
    #[serde(default)]
    pub tags: HashSet<String>,
    #[serde(default)]
    pub mark: Option<String>,
    #[serde(default)]
    pub fields: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub visit_count: HashMap<DateRange, u64>,
    #[serde(default)]
    pub purchase_amount: HashMap<DateRange, f64>,
    #[serde(default)]
    pub reorder_count: HashMap<DateRange, u64>,
    #[serde(default)]
    pub last_visit_date: Option<NaiveDate>,
    /// Instant the snapshot was taken; relative-date rules measure from here.
    pub taken_at: DateTime<Utc>,
}

impl RecipientSnapshot {
    pub fn new(recipient_id: impl Into<String>, taken_at: DateTime<Utc>) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            tags: HashSet::new(),
            mark: None,
            fields: HashMap::new(),
            visit_count: HashMap::new(),
            purchase_amount: HashMap::new(),
            reorder_count: HashMap::new(),
            last_visit_date: None,
            taken_at,
        }
    }

    pub fn with_tag(mut self, tag_id: impl Into<String>) -> Self {
        self.tags.insert(tag_id.into());
        self
    }

    pub fn with_mark(mut self, mark: impl Into<String>) -> Self {
        self.mark = Some(mark.into());
        self
    }

    pub fn with_field(mut self, field_id: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(field_id.into(), value);
        self
    }

    pub fn with_visit_count(mut self, range: DateRange, count: u64) -> Self {
        self.visit_count.insert(range, count);
        self
    }

    pub fn with_purchase_amount(mut self, range: DateRange, amount: f64) -> Self {
        self.purchase_amount.insert(range, amount);
        self
    }

    pub fn with_reorder_count(mut self, range: DateRange, count: u64) -> Self {
        self.reorder_count.insert(range, count);
        self
    }

    pub fn with_last_visit(mut self, date: NaiveDate) -> Self {
        self.last_visit_date = Some(date);
        self
    }

    /// Precomputed aggregate for `range`, or `None` when the provider did
    /// not supply it.
    pub fn metric(&self, kind: MetricKind, range: DateRange) -> Option<f64> {
        match kind {
            MetricKind::VisitCount => self.visit_count.get(&range).map(|v| *v as f64),
            MetricKind::PurchaseAmount => self.purchase_amount.get(&range).copied(),
            MetricKind::ReorderCount => self.reorder_count.get(&range).map(|v| *v as f64),
        }
    }

    /// Whole days between the last visit and `taken_at`.
    pub fn days_since_last_visit(&self) -> Option<i64> {
        self.last_visit_date
            .map(|date| (self.taken_at.date_naive() - date).num_days())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn snapshot_deserializes_range_keyed_aggregates() {
        let snapshot: RecipientSnapshot = serde_json::from_value(serde_json::json!({
            "recipient_id": "patient-9",
            "tags": ["vip"],
            "purchase_amount": { "90d": 12000.0, "all": 50000.0 },
            "visit_count": { "30d": 2 },
            "taken_at": "2026-03-01T09:00:00Z"
        }))
        .unwrap();

        assert!(snapshot.tags.contains("vip"));
        assert_eq!(
            snapshot.metric(MetricKind::PurchaseAmount, DateRange::Days90),
            Some(12000.0)
        );
        assert_eq!(snapshot.metric(MetricKind::VisitCount, DateRange::Days30), Some(2.0));
        assert_eq!(snapshot.metric(MetricKind::ReorderCount, DateRange::All), None);
    }

    #[test]
    fn days_since_last_visit_uses_snapshot_time() {
        let taken_at = Utc.with_ymd_and_hms(2026, 3, 11, 23, 0, 0).unwrap();
        let snapshot = RecipientSnapshot::new("p", taken_at)
            .with_last_visit(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        assert_eq!(snapshot.days_since_last_visit(), Some(10));

        let never_visited = RecipientSnapshot::new("p", taken_at);
        assert_eq!(never_visited.days_since_last_visit(), None);
    }
}
