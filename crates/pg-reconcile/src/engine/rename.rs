//! Identity migration: rewrite a unique column in place.
//!
//! Records keep their id, so every reference to them stays valid. Each
//! update is a compare-and-set on the old value, and a target value held by
//! any other record is a conflict, never an overwrite.

use std::collections::HashMap;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RenameJob;
use crate::core::{FieldValue, RecordId};
use crate::error::{ReconcileError, Result};
use crate::report::{FailureCause, ItemFailure, JobStatus};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Migrated {
    pub id: RecordId,
    pub old: String,
    pub new: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RenameOutcome {
    /// Records the selector returned.
    pub matched: usize,
    /// Selected but the pattern left them as they were.
    pub unchanged: usize,
    pub migrated: Vec<Migrated>,
    /// Skipped because the new value is taken.
    pub conflicts: Vec<ItemFailure>,
    pub failures: Vec<ItemFailure>,
}

impl RenameOutcome {
    fn conflict(&mut self, id: &RecordId, value: &str, held_by: String) {
        debug!("rename: {} -> '{}' conflicts with {}", id, value, held_by);
        self.conflicts.push(ItemFailure::new(
            id.to_string(),
            FailureCause::Conflict {
                value: value.to_string(),
                held_by,
            },
        ));
    }

    fn fail(&mut self, id: &RecordId, cause: FailureCause) {
        warn!("rename: record {} failed: {}", id, cause);
        self.failures.push(ItemFailure::new(id.to_string(), cause));
    }
}

/// Run a rename job.
pub async fn run(
    store: &dyn Store,
    job: &RenameJob,
    dry_run: bool,
    cancel: &CancellationToken,
) -> Result<(RenameOutcome, JobStatus)> {
    let records = store.fetch(&job.candidates()).await?;
    let table = job.table_ref();
    info!(
        "rename '{}': {} records of {} match '{}'",
        job.name,
        records.len(),
        table.display_name(),
        job.pattern.from
    );

    let mut outcome = RenameOutcome::default();
    // Values taken by earlier records in this run.
    let mut claimed: HashMap<String, RecordId> = HashMap::new();

    for record in records {
        if cancel.is_cancelled() {
            warn!("rename '{}': cancelled after {} records", job.name, outcome.matched);
            return Ok((outcome, JobStatus::Cancelled));
        }
        outcome.matched += 1;

        let old = match record.field(&job.column).and_then(FieldValue::as_text) {
            Some(old) => old.to_string(),
            None => {
                outcome.unchanged += 1;
                continue;
            }
        };
        let new = match job.pattern.apply(&old) {
            Some(new) if new != old => new,
            _ => {
                outcome.unchanged += 1;
                continue;
            }
        };
        if !job.pattern.is_settled(&new) {
            outcome.fail(&record.id, FailureCause::Unsettled { value: new });
            continue;
        }

        if let Some(holder) = claimed.get(&new) {
            outcome.conflict(&record.id, &new, holder.to_string());
            continue;
        }

        match store.find_ids(&job.holders(&new), 2).await {
            Ok(holders) => {
                if let Some(holder) = holders.into_iter().find(|h| *h != record.id) {
                    outcome.conflict(&record.id, &new, holder.to_string());
                    continue;
                }
            }
            Err(e) if e.is_connectivity() => return Err(e),
            Err(e) => {
                outcome.fail(&record.id, FailureCause::from_error(&e));
                continue;
            }
        }

        if !dry_run {
            let updated = store
                .update_if(
                    &table,
                    &record.id,
                    &job.column,
                    &FieldValue::text(old.clone()),
                    &FieldValue::text(new.clone()),
                )
                .await;
            match updated {
                Ok(0) => {
                    outcome.fail(
                        &record.id,
                        FailureCause::Stale {
                            message: format!("{} no longer holds '{}'", job.column, old),
                        },
                    );
                    continue;
                }
                Ok(_) => {}
                Err(ReconcileError::UniqueViolation(message)) => {
                    outcome.conflict(&record.id, &new, format!("another record ({})", message));
                    continue;
                }
                Err(e) if e.is_connectivity() => return Err(e),
                Err(e) => {
                    outcome.fail(&record.id, FailureCause::from_error(&e));
                    continue;
                }
            }
        }

        claimed.insert(new.clone(), record.id.clone());
        outcome.migrated.push(Migrated {
            id: record.id,
            old,
            new,
        });
    }

    info!(
        "rename '{}': migrated {}, conflicts {}, failed {}",
        job.name,
        outcome.migrated.len(),
        outcome.conflicts.len(),
        outcome.failures.len()
    );
    Ok((outcome, JobStatus::Completed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn job() -> RenameJob {
        serde_yaml::from_str(
            "name: mail\ntable: users\ncolumn: email\nfrom: '@old.com'\nto: '@new.com'\nmatch: suffix\n",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_dry_run_claims_values_within_the_run() {
        // No unique constraint here, so both rows can share a value.
        let store = MemoryStore::new().with_table("users");
        store.insert("users", 1, vec![("email", FieldValue::text("ops@old.com"))]);
        store.insert("users", 2, vec![("email", FieldValue::text("ops@old.com"))]);

        let (outcome, _) = run(&store, &job(), true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.migrated.len(), 1);
        assert_eq!(outcome.migrated[0].new, "ops@new.com");
        assert_eq!(
            outcome.conflicts[0].cause,
            FailureCause::Conflict {
                value: "ops@new.com".into(),
                held_by: "1".into()
            }
        );
        assert_eq!(store.field("users", 1, "email"), Some(FieldValue::text("ops@old.com")));
    }

    fn contains_job(from: &str, to: &str) -> RenameJob {
        serde_yaml::from_str(&format!(
            "name: handle\ntable: users\ncolumn: handle\nfrom: '{}'\nto: '{}'\n",
            from, to
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_repeated_occurrences_settle_in_one_run() {
        let store = MemoryStore::new().with_table("users");
        store.insert("users", 1, vec![("handle", FieldValue::text("old-old"))]);
        let job = contains_job("old", "new");
        let cancel = CancellationToken::new();

        let (first, _) = run(&store, &job, false, &cancel).await.unwrap();
        assert_eq!(first.migrated.len(), 1);
        assert_eq!(store.field("users", 1, "handle"), Some(FieldValue::text("new-new")));

        let (second, _) = run(&store, &job, false, &cancel).await.unwrap();
        assert!(second.migrated.is_empty());
        assert_eq!(store.field("users", 1, "handle"), Some(FieldValue::text("new-new")));
    }

    #[tokio::test]
    async fn test_unsettled_rewrite_is_refused() {
        let store = MemoryStore::new().with_table("users");
        store.insert("users", 1, vec![("handle", FieldValue::text("aabb"))]);

        let (outcome, _) = run(&store, &contains_job("ab", "a"), false, &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.migrated.is_empty());
        assert_eq!(
            outcome.failures[0].cause,
            FailureCause::Unsettled { value: "aab".into() }
        );
        assert_eq!(store.field("users", 1, "handle"), Some(FieldValue::text("aabb")));
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_record() {
        let store = MemoryStore::new().with_table("users");
        store.insert("users", 1, vec![("email", FieldValue::text("a@old.com"))]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (outcome, status) = run(&store, &job(), false, &cancel).await.unwrap();
        assert_eq!(status, JobStatus::Cancelled);
        assert_eq!(outcome.matched, 0);
        assert_eq!(store.field("users", 1, "email"), Some(FieldValue::text("a@old.com")));
    }
}
