//! Read-only audit of child links.

use std::collections::HashSet;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::RelinkJob;
use crate::core::{FieldValue, RecordId, RecordSet};
use crate::error::Result;
use crate::report::JobStatus;
use crate::store::Store;

/// A child whose link names a parent that does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dangling {
    pub child: RecordId,
    pub parent: RecordId,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditOutcome {
    /// Children scanned.
    pub scanned: usize,
    /// Children with a NULL link.
    pub unlinked: Vec<RecordId>,
    pub dangling: Vec<Dangling>,
}

/// Scan the children of a relink job and classify their links.
pub async fn run(
    store: &dyn Store,
    job: &RelinkJob,
    cancel: &CancellationToken,
) -> Result<(AuditOutcome, JobStatus)> {
    let children = store
        .fetch(
            &RecordSet::new(job.child_table())
                .with_fields([job.child.link_column.clone()])
                .with_filter(job.child.filter.clone()),
        )
        .await?;

    if cancel.is_cancelled() {
        return Ok((AuditOutcome::default(), JobStatus::Cancelled));
    }

    let parents: HashSet<RecordId> = store
        .fetch(&RecordSet::new(job.parent_table()))
        .await?
        .into_iter()
        .map(|p| p.id)
        .collect();

    let mut outcome = AuditOutcome {
        scanned: children.len(),
        ..AuditOutcome::default()
    };
    for child in children {
        let link = child
            .field(&job.child.link_column)
            .cloned()
            .unwrap_or(FieldValue::Null);
        if link.is_null() {
            outcome.unlinked.push(child.id);
            continue;
        }
        match RecordId::from_field(&link) {
            Some(parent) if parents.contains(&parent) => {}
            Some(parent) => outcome.dangling.push(Dangling {
                child: child.id,
                parent,
            }),
            // A link of a non-key type cannot resolve to any parent.
            None => outcome.dangling.push(Dangling {
                child: child.id,
                parent: RecordId::Text(link.to_string()),
            }),
        }
    }

    info!(
        "audit '{}': scanned {}, unlinked {}, dangling {}",
        job.name,
        outcome.scanned,
        outcome.unlinked.len(),
        outcome.dangling.len()
    );
    Ok((outcome, JobStatus::Completed))
}
