//! Deduplication: keep the most recent record per logical key.

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::grouper::{group_by_key, Grouping, TieBreak};
use crate::config::DedupJob;
use crate::core::{LogicalKey, RecordId};
use crate::error::Result;
use crate::report::{FailureCause, ItemFailure, JobStatus};
use crate::store::Store;

/// One logical key that had more than one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    pub key: LogicalKey,
    pub kept: RecordId,
    pub deleted: Vec<RecordId>,
}

/// What a dedup run kept and removed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupOutcome {
    /// Distinct logical keys seen.
    pub groups: usize,
    /// Records kept, one per key.
    pub kept: usize,
    /// Ids deleted (or, in a dry run, that would be deleted), ascending.
    pub deleted: Vec<RecordId>,
    pub duplicate_groups: Vec<DuplicateGroup>,
    /// Records left alone because they have no key.
    pub key_failures: Vec<ItemFailure>,
    /// Candidates whose delete did not go through.
    pub delete_failures: Vec<ItemFailure>,
}

impl DedupOutcome {
    /// Records selected for deletion, whether or not the delete succeeded.
    pub fn candidates(&self) -> usize {
        self.duplicate_groups.iter().map(|g| g.deleted.len()).sum()
    }

    fn candidate_ids(&self) -> Vec<RecordId> {
        let mut ids: Vec<RecordId> = self
            .duplicate_groups
            .iter()
            .flat_map(|g| g.deleted.iter().cloned())
            .collect();
        ids.sort();
        ids
    }
}

/// Decide survivors and deletions without touching the store.
///
/// Each group's head (most recent, then tie-break) survives. Groups of one
/// contribute nothing to delete. Duplicate groups are reported in key order
/// of their survivor id so the plan is deterministic.
pub fn plan(grouping: Grouping) -> DedupOutcome {
    let mut outcome = DedupOutcome {
        groups: grouping.groups.len(),
        kept: grouping.groups.len(),
        key_failures: grouping.failures,
        ..DedupOutcome::default()
    };

    for (key, records) in grouping.groups {
        if records.len() < 2 {
            continue;
        }
        let mut members = records.into_iter().map(|r| r.id);
        if let Some(kept) = members.next() {
            let mut deleted: Vec<RecordId> = members.collect();
            deleted.sort();
            outcome.duplicate_groups.push(DuplicateGroup { key, kept, deleted });
        }
    }
    outcome.duplicate_groups.sort_by(|a, b| a.kept.cmp(&b.kept));
    outcome
}

/// Run a dedup job: fetch, group, plan, then issue one bulk delete.
pub async fn run(
    store: &dyn Store,
    job: &DedupJob,
    dry_run: bool,
    cancel: &CancellationToken,
) -> Result<(DedupOutcome, JobStatus)> {
    let set = job.record_set();
    let records = store.fetch(&set).await?;
    info!(
        "dedup '{}': fetched {} records from {}",
        job.name,
        records.len(),
        set.table.display_name()
    );

    let tie_break: TieBreak = job.tie_break.comparator();
    let mut outcome = plan(group_by_key(records, &job.key_rule(), tie_break));
    for failure in &outcome.key_failures {
        warn!("dedup '{}': record {} skipped: {}", job.name, failure.item, failure.cause);
    }

    let candidates = outcome.candidate_ids();
    info!(
        "dedup '{}': {} keys, {} duplicate groups, {} records to delete",
        job.name,
        outcome.groups,
        outcome.duplicate_groups.len(),
        candidates.len()
    );

    if cancel.is_cancelled() {
        warn!("dedup '{}': cancelled before delete, nothing removed", job.name);
        return Ok((outcome, JobStatus::Cancelled));
    }

    if candidates.is_empty() {
        return Ok((outcome, JobStatus::Completed));
    }

    if dry_run {
        outcome.deleted = candidates;
        return Ok((outcome, JobStatus::Completed));
    }

    match store.delete_ids(&set.table, &candidates).await {
        Ok(removed) => {
            debug!("dedup '{}': bulk delete removed {} rows", job.name, removed);
            outcome.deleted = candidates;
        }
        Err(e) if e.is_connectivity() => return Err(e),
        Err(e) => {
            warn!("dedup '{}': bulk delete failed: {}", job.name, e);
            let cause = FailureCause::from_error(&e);
            outcome.delete_failures = candidates
                .iter()
                .map(|id| ItemFailure::new(id.to_string(), cause.clone()))
                .collect();
        }
    }

    Ok((outcome, JobStatus::Completed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FieldValue, KeyRule, Record};
    use crate::engine::grouper::lowest_id_first;
    use chrono::{TimeZone, Utc};

    fn rec(id: i64, key: &str, ts: i64) -> Record {
        Record::new(id)
            .with_field("key", FieldValue::text(key))
            .with_recency(Utc.timestamp_opt(ts, 0).unwrap())
    }

    #[test]
    fn test_plan_keeps_most_recent() {
        let grouping = group_by_key(
            vec![rec(1, "A", 10), rec(2, "A", 20), rec(3, "B", 5)],
            &KeyRule::columns(["key"]),
            lowest_id_first,
        );
        let outcome = plan(grouping);
        assert_eq!(outcome.groups, 2);
        assert_eq!(outcome.kept, 2);
        assert_eq!(outcome.duplicate_groups.len(), 1);
        assert_eq!(outcome.duplicate_groups[0].kept, RecordId::Int(2));
        assert_eq!(outcome.candidate_ids(), vec![RecordId::Int(1)]);
    }

    #[test]
    fn test_plan_singletons_untouched() {
        let grouping = group_by_key(
            vec![rec(1, "A", 10), rec(2, "B", 20)],
            &KeyRule::columns(["key"]),
            lowest_id_first,
        );
        let outcome = plan(grouping);
        assert!(outcome.duplicate_groups.is_empty());
        assert_eq!(outcome.candidates(), 0);
    }

    #[test]
    fn test_plan_tie_keeps_lowest_id() {
        let grouping = group_by_key(
            vec![rec(9, "A", 10), rec(4, "A", 10), rec(6, "A", 10)],
            &KeyRule::columns(["key"]),
            lowest_id_first,
        );
        let outcome = plan(grouping);
        assert_eq!(outcome.duplicate_groups[0].kept, RecordId::Int(4));
        assert_eq!(
            outcome.candidate_ids(),
            vec![RecordId::Int(6), RecordId::Int(9)]
        );
    }
}
