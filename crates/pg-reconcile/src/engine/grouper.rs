//! Logical key grouping.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::{KeyRule, LogicalKey, Record};
use crate::report::{FailureCause, ItemFailure};

/// Order between two records whose recency is equal.
pub type TieBreak = fn(&Record, &Record) -> Ordering;

/// Configured tie-break between equally recent records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakRule {
    /// The lowest id survives.
    #[default]
    LowestId,
    /// The highest id survives.
    HighestId,
}

impl TieBreakRule {
    pub fn comparator(self) -> TieBreak {
        match self {
            TieBreakRule::LowestId => lowest_id_first,
            TieBreakRule::HighestId => highest_id_first,
        }
    }
}

pub fn lowest_id_first(a: &Record, b: &Record) -> Ordering {
    a.id.cmp(&b.id)
}

pub fn highest_id_first(a: &Record, b: &Record) -> Ordering {
    b.id.cmp(&a.id)
}

/// Records partitioned by logical key.
#[derive(Debug, Default)]
pub struct Grouping {
    /// Each group ordered most recent first.
    pub groups: HashMap<LogicalKey, Vec<Record>>,
    /// Records whose key could not be extracted. They belong to no group.
    pub failures: Vec<ItemFailure>,
}

/// Most recent first; missing recency sorts as oldest; ties by `tie_break`.
fn survivor_order(a: &Record, b: &Record, tie_break: TieBreak) -> Ordering {
    match (&a.recency, &b.recency) {
        (Some(x), Some(y)) => y.cmp(x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| tie_break(a, b))
}

/// Partition records by the key `rule` extracts.
///
/// A failed extraction is reported per record and never aborts the grouping.
pub fn group_by_key<I>(records: I, rule: &KeyRule, tie_break: TieBreak) -> Grouping
where
    I: IntoIterator<Item = Record>,
{
    let mut grouping = Grouping::default();

    for record in records {
        match rule.extract(&record) {
            Ok(key) => grouping.groups.entry(key).or_default().push(record),
            Err(e) => grouping.failures.push(ItemFailure::new(
                record.id.to_string(),
                FailureCause::KeyExtraction {
                    message: e.to_string(),
                },
            )),
        }
    }

    for group in grouping.groups.values_mut() {
        group.sort_by(|a, b| survivor_order(a, b, tie_break));
    }

    grouping
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FieldValue;
    use chrono::{TimeZone, Utc};

    fn rec(id: i64, key: &str, ts: Option<i64>) -> Record {
        let r = Record::new(id).with_field("key", FieldValue::text(key));
        match ts {
            Some(ts) => r.with_recency(Utc.timestamp_opt(ts, 0).unwrap()),
            None => r,
        }
    }

    fn ids(group: &[Record]) -> Vec<String> {
        group.iter().map(|r| r.id.to_string()).collect()
    }

    #[test]
    fn test_groups_ordered_most_recent_first() {
        let rule = KeyRule::columns(["key"]);
        let grouping = group_by_key(
            vec![rec(1, "A", Some(10)), rec(2, "A", Some(20)), rec(3, "B", Some(5))],
            &rule,
            lowest_id_first,
        );
        assert_eq!(grouping.groups.len(), 2);
        let a = &grouping.groups[&LogicalKey(vec![FieldValue::text("A")])];
        assert_eq!(ids(a), vec!["2", "1"]);
    }

    #[test]
    fn test_missing_recency_sorts_oldest() {
        let rule = KeyRule::columns(["key"]);
        let grouping = group_by_key(
            vec![rec(1, "A", None), rec(2, "A", Some(1))],
            &rule,
            lowest_id_first,
        );
        let a = &grouping.groups[&LogicalKey(vec![FieldValue::text("A")])];
        assert_eq!(ids(a), vec!["2", "1"]);
    }

    #[test]
    fn test_tie_break() {
        let rule = KeyRule::columns(["key"]);
        let records = vec![rec(7, "A", Some(10)), rec(3, "A", Some(10)), rec(5, "A", Some(10))];

        let low = group_by_key(records.clone(), &rule, lowest_id_first);
        assert_eq!(
            ids(&low.groups[&LogicalKey(vec![FieldValue::text("A")])]),
            vec!["3", "5", "7"]
        );

        let high = group_by_key(records, &rule, TieBreakRule::HighestId.comparator());
        assert_eq!(
            ids(&high.groups[&LogicalKey(vec![FieldValue::text("A")])]),
            vec!["7", "5", "3"]
        );
    }

    #[test]
    fn test_key_failures_are_per_record() {
        let rule = KeyRule::columns(["key"]);
        let orphan = Record::new(4).with_field("key", FieldValue::Null);
        let grouping = group_by_key(vec![rec(1, "A", None), orphan], &rule, lowest_id_first);
        assert_eq!(grouping.groups.len(), 1);
        assert_eq!(grouping.failures.len(), 1);
        assert_eq!(grouping.failures[0].item, "4");
    }
}
