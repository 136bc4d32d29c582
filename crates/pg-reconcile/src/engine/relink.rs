//! Orphan relinking through a secondary identifier.
//!
//! Only children whose link is NULL are ever selected, and the write is a
//! compare-and-set on `link IS NULL`, so an existing link is never
//! overwritten, not even one set concurrently while the job runs.

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelinkJob;
use crate::core::{FieldValue, Record, RecordId};
use crate::error::Result;
use crate::report::{FailureCause, ItemFailure, JobStatus};
use crate::store::Store;

/// How many candidate parents an ambiguous match reports.
const MAX_REPORTED_CANDIDATES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Link {
    pub child: RecordId,
    pub parent: RecordId,
}

/// A child whose secondary value matched several parents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ambiguous {
    pub child: RecordId,
    pub value: FieldValue,
    pub candidates: Vec<RecordId>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RelinkOutcome {
    /// Unlinked children examined.
    pub examined: usize,
    /// Links written (or, in a dry run, that would be written).
    pub linked: Vec<Link>,
    /// No parent matched, or the secondary value is empty.
    pub unresolved: Vec<RecordId>,
    /// More than one parent matched; left for manual review.
    pub ambiguous: Vec<Ambiguous>,
    /// Linked by someone else between read and write.
    pub already_linked: Vec<RecordId>,
    pub failures: Vec<ItemFailure>,
}

/// The child's secondary value after normalization, if it is usable.
fn secondary_value(child: &Record, job: &RelinkJob) -> Option<FieldValue> {
    match child.field(&job.child.match_column)? {
        FieldValue::Null => None,
        FieldValue::Text(text) => {
            let normalized = job.normalize.iter().fold(text.clone(), |acc, n| n.apply(&acc));
            (!normalized.is_empty()).then_some(FieldValue::Text(normalized))
        }
        other => Some(other.clone()),
    }
}

/// Run a relink job.
pub async fn run(
    store: &dyn Store,
    job: &RelinkJob,
    dry_run: bool,
    cancel: &CancellationToken,
) -> Result<(RelinkOutcome, JobStatus)> {
    let orphans = store.fetch(&job.orphans()).await?;
    let child_table = job.child_table();
    info!(
        "relink '{}': {} children of {} without a link",
        job.name,
        orphans.len(),
        child_table.display_name()
    );

    let mut outcome = RelinkOutcome::default();
    for child in orphans {
        if cancel.is_cancelled() {
            warn!("relink '{}': cancelled after {} children", job.name, outcome.examined);
            return Ok((outcome, JobStatus::Cancelled));
        }
        outcome.examined += 1;

        let Some(value) = secondary_value(&child, job) else {
            debug!("relink '{}': child {} has no {}", job.name, child.id, job.child.match_column);
            outcome.unresolved.push(child.id);
            continue;
        };

        let candidates = match store
            .find_ids(&job.parents_matching(value.clone()), MAX_REPORTED_CANDIDATES)
            .await
        {
            Ok(ids) => ids,
            Err(e) if e.is_connectivity() => return Err(e),
            Err(e) => {
                warn!("relink '{}': lookup for child {} failed: {}", job.name, child.id, e);
                outcome
                    .failures
                    .push(ItemFailure::new(child.id.to_string(), FailureCause::from_error(&e)));
                continue;
            }
        };

        let parent = match candidates.len() {
            0 => {
                outcome.unresolved.push(child.id);
                continue;
            }
            1 => candidates[0].clone(),
            _ => {
                debug!(
                    "relink '{}': child {} matches {} parents, not linking",
                    job.name,
                    child.id,
                    candidates.len()
                );
                outcome.ambiguous.push(Ambiguous {
                    child: child.id,
                    value,
                    candidates,
                });
                continue;
            }
        };

        if dry_run {
            outcome.linked.push(Link {
                child: child.id,
                parent,
            });
            continue;
        }

        match store
            .update_if(
                &child_table,
                &child.id,
                &job.child.link_column,
                &FieldValue::Null,
                &parent.to_field(),
            )
            .await
        {
            Ok(0) => outcome.already_linked.push(child.id),
            Ok(_) => {
                debug!("relink '{}': {} -> {}", job.name, child.id, parent);
                outcome.linked.push(Link {
                    child: child.id,
                    parent,
                });
            }
            Err(e) if e.is_connectivity() => return Err(e),
            Err(e) => {
                warn!("relink '{}': update of child {} failed: {}", job.name, child.id, e);
                outcome
                    .failures
                    .push(ItemFailure::new(child.id.to_string(), FailureCause::from_error(&e)));
            }
        }
    }

    info!(
        "relink '{}': linked {}, unresolved {}, ambiguous {}, failed {}",
        job.name,
        outcome.linked.len(),
        outcome.unresolved.len(),
        outcome.ambiguous.len(),
        outcome.failures.len()
    );
    Ok((outcome, JobStatus::Completed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn job() -> RelinkJob {
        serde_yaml::from_str(
            r#"
name: interns
child: { table: Intern, link_column: userId, match_column: phone }
parent: { table: User, match_column: phone }
"#,
        )
        .unwrap()
    }

    fn store() -> MemoryStore {
        let store = MemoryStore::new().with_table("Intern").with_table("User");
        store.insert("User", 1, vec![("phone", FieldValue::text("555"))]);
        store.insert(
            "Intern",
            9,
            vec![("userId", FieldValue::Null), ("phone", FieldValue::text(" 555 "))],
        );
        store.insert(
            "Intern",
            10,
            vec![("userId", FieldValue::Null), ("phone", FieldValue::text("   "))],
        );
        store
    }

    #[test]
    fn test_secondary_value_is_trimmed_and_blank_is_unusable() {
        let job = job();
        let child = Record::new(1).with_field("phone", FieldValue::text(" 555 "));
        assert_eq!(secondary_value(&child, &job), Some(FieldValue::text("555")));

        let blank = Record::new(2).with_field("phone", FieldValue::text("  "));
        assert_eq!(secondary_value(&blank, &job), None);
    }

    #[tokio::test]
    async fn test_dry_run_reports_without_linking() {
        let store = store();
        let (outcome, status) = run(&store, &job(), true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(status, JobStatus::Completed);
        assert_eq!(outcome.examined, 2);
        assert_eq!(
            outcome.linked,
            vec![Link {
                child: RecordId::Int(9),
                parent: RecordId::Int(1)
            }]
        );
        assert_eq!(outcome.unresolved, vec![RecordId::Int(10)]);
        assert_eq!(store.field("Intern", 9, "userId"), Some(FieldValue::Null));
    }

    #[tokio::test]
    async fn test_update_failure_is_isolated() {
        let store = store();
        store.insert(
            "Intern",
            11,
            vec![("userId", FieldValue::Null), ("phone", FieldValue::text("555"))],
        );
        store.fail_updates_for(9);

        let (outcome, _) = run(&store, &job(), false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].item, "9");
        assert_eq!(store.field("Intern", 11, "userId"), Some(FieldValue::Int(1)));
    }
}
