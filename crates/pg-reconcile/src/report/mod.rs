//! Job reports.
//!
//! A [`JobReport`] is built once, when a job finishes, from the engine's
//! outcome. Building and rendering are pure; the CLI decides where the
//! text or JSON goes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::engine::audit::AuditOutcome;
use crate::engine::dedup::DedupOutcome;
use crate::engine::patch::{PatchOutcome, StepOutcome};
use crate::engine::relink::RelinkOutcome;
use crate::engine::rename::RenameOutcome;
use crate::error::{ErrorClass, ReconcileError, Result};

/// Why a single item or step did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// The bounded lock wait expired.
    LockTimeout { message: String },
    /// The target value is held by another record.
    Conflict { value: String, held_by: String },
    /// The record changed between read and write.
    Stale { message: String },
    /// No logical key could be extracted.
    KeyExtraction { message: String },
    /// The new value would match the rename pattern again.
    Unsettled { value: String },
    /// Any other store error.
    Store { message: String },
}

impl FailureCause {
    /// Fold an isolated error into a cause.
    pub fn from_error(err: &ReconcileError) -> Self {
        match err.class() {
            ErrorClass::LockTimeout => FailureCause::LockTimeout {
                message: err.to_string(),
            },
            _ => FailureCause::Store {
                message: err.to_string(),
            },
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::LockTimeout { message } => write!(f, "lock timeout: {}", message),
            FailureCause::Conflict { value, held_by } => {
                write!(f, "conflict: '{}' is held by {}", value, held_by)
            }
            FailureCause::Stale { message } => write!(f, "stale: {}", message),
            FailureCause::KeyExtraction { message } => write!(f, "no key: {}", message),
            FailureCause::Unsettled { value } => {
                write!(f, "unsettled: '{}' would be renamed again", value)
            }
            FailureCause::Store { message } => write!(f, "store error: {}", message),
        }
    }
}

/// An item (record id or step) and why it failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub item: String,
    pub cause: FailureCause,
}

impl ItemFailure {
    pub fn new(item: impl Into<String>, cause: FailureCause) -> Self {
        Self {
            item: item.into(),
            cause,
        }
    }
}

/// The operation a job ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Dedup,
    Relink,
    Rename,
    SchemaPatch,
    ClearSessions,
    Audit,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Dedup => "dedup",
            Operation::Relink => "relink",
            Operation::Rename => "rename",
            Operation::SchemaPatch => "schema-patch",
            Operation::ClearSessions => "clear-sessions",
            Operation::Audit => "audit",
        };
        f.write_str(name)
    }
}

/// Whether the job ran to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    /// Interrupted; the report covers committed progress only.
    Cancelled,
}

/// Operation-specific outcome carried in the report.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JobDetails {
    Dedup(DedupOutcome),
    Relink(RelinkOutcome),
    Rename(RenameOutcome),
    SchemaPatch(PatchOutcome),
    Audit(AuditOutcome),
}

/// Counts derived from an outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Tally {
    attempted: usize,
    succeeded: usize,
    skipped: usize,
    failed: usize,
}

impl JobDetails {
    fn tally(&self) -> Tally {
        match self {
            JobDetails::Dedup(o) => Tally {
                attempted: o.candidates() + o.key_failures.len(),
                succeeded: o.deleted.len(),
                skipped: o.key_failures.len(),
                failed: o.delete_failures.len(),
            },
            JobDetails::Relink(o) => Tally {
                attempted: o.examined,
                succeeded: o.linked.len(),
                skipped: o.unresolved.len() + o.ambiguous.len() + o.already_linked.len(),
                failed: o.failures.len(),
            },
            JobDetails::Rename(o) => Tally {
                attempted: o.matched,
                succeeded: o.migrated.len(),
                skipped: o.conflicts.len() + o.unchanged,
                failed: o.failures.len(),
            },
            JobDetails::SchemaPatch(o) => {
                let failed = o
                    .steps
                    .iter()
                    .filter(|s| matches!(s.outcome, StepOutcome::Failed { .. }))
                    .count();
                Tally {
                    attempted: o.steps.len(),
                    succeeded: o.steps.len() - failed,
                    skipped: 0,
                    failed,
                }
            }
            JobDetails::Audit(o) => Tally {
                attempted: o.scanned,
                succeeded: o.scanned - o.unlinked.len() - o.dangling.len(),
                skipped: o.unlinked.len() + o.dangling.len(),
                failed: 0,
            },
        }
    }

    fn exceptions(&self) -> Vec<ItemFailure> {
        match self {
            JobDetails::Dedup(o) => o
                .key_failures
                .iter()
                .chain(o.delete_failures.iter())
                .cloned()
                .collect(),
            JobDetails::Relink(o) => o.failures.clone(),
            JobDetails::Rename(o) => o.conflicts.iter().chain(o.failures.iter()).cloned().collect(),
            JobDetails::SchemaPatch(o) => o
                .steps
                .iter()
                .filter_map(|s| match &s.outcome {
                    StepOutcome::Failed { cause } => Some(ItemFailure::new(s.step.clone(), cause.clone())),
                    _ => None,
                })
                .collect(),
            JobDetails::Audit(_) => Vec::new(),
        }
    }

    fn render(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobDetails::Dedup(o) => {
                writeln!(out, "Distinct keys:    {}", o.groups)?;
                writeln!(out, "Duplicate groups: {}", o.duplicate_groups.len())?;
                for group in &o.duplicate_groups {
                    let deleted: Vec<String> = group.deleted.iter().map(|id| id.to_string()).collect();
                    writeln!(
                        out,
                        "  {} keep {} delete [{}]",
                        group.key,
                        group.kept,
                        deleted.join(", ")
                    )?;
                }
            }
            JobDetails::Relink(o) => {
                for link in &o.linked {
                    writeln!(out, "  linked {} -> {}", link.child, link.parent)?;
                }
                for amb in &o.ambiguous {
                    let candidates: Vec<String> = amb.candidates.iter().map(|id| id.to_string()).collect();
                    writeln!(
                        out,
                        "  ambiguous {} ({}): candidates [{}]",
                        amb.child,
                        amb.value,
                        candidates.join(", ")
                    )?;
                }
                if !o.unresolved.is_empty() {
                    let unresolved: Vec<String> = o.unresolved.iter().map(|id| id.to_string()).collect();
                    writeln!(out, "  unresolved [{}]", unresolved.join(", "))?;
                }
                if !o.already_linked.is_empty() {
                    writeln!(out, "  already linked: {}", o.already_linked.len())?;
                }
            }
            JobDetails::Rename(o) => {
                for m in &o.migrated {
                    writeln!(out, "  {} : {} -> {}", m.id, m.old, m.new)?;
                }
            }
            JobDetails::SchemaPatch(o) => {
                for session in &o.terminated_sessions {
                    writeln!(
                        out,
                        "  terminated pid {} ({})",
                        session.pid,
                        session.state.as_deref().unwrap_or("unknown")
                    )?;
                }
                for step in &o.steps {
                    writeln!(out, "  {:<18} {}", step.outcome.label(), step.step)?;
                }
            }
            JobDetails::Audit(o) => {
                if !o.unlinked.is_empty() {
                    let ids: Vec<String> = o.unlinked.iter().map(|id| id.to_string()).collect();
                    writeln!(out, "  unlinked [{}]", ids.join(", "))?;
                }
                for d in &o.dangling {
                    writeln!(out, "  dangling {} -> {} (missing)", d.child, d.parent)?;
                }
            }
        }
        Ok(())
    }
}

/// Identity and timing of one job invocation, captured at start.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub job: String,
    pub operation: Operation,
    pub job_hash: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn start(job: impl Into<String>, operation: Operation, job_hash: String, dry_run: bool) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            job: job.into(),
            operation,
            job_hash,
            dry_run,
            started_at: Utc::now(),
        }
    }

    /// Build the report from the engine outcome.
    pub fn finish(self, status: JobStatus, details: JobDetails) -> JobReport {
        let completed_at = Utc::now();
        let tally = details.tally();
        JobReport {
            run_id: self.run_id,
            job: self.job,
            operation: self.operation,
            job_hash: self.job_hash,
            status,
            dry_run: self.dry_run,
            started_at: self.started_at,
            completed_at,
            duration_seconds: (completed_at - self.started_at).num_milliseconds() as f64 / 1000.0,
            attempted: tally.attempted,
            succeeded: tally.succeeded,
            skipped: tally.skipped,
            failed: tally.failed,
            exceptions: details.exceptions(),
            details,
        }
    }
}

/// Summary of one job run.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    /// Unique run identifier.
    pub run_id: String,
    pub job: String,
    pub operation: Operation,
    /// SHA-256 of the job definition that ran.
    pub job_hash: String,
    pub status: JobStatus,
    /// Planned actions are counted as succeeded when set.
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Per-item failures and conflicts, in the order they happened.
    pub exceptions: Vec<ItemFailure>,
    pub details: JobDetails,
}

impl JobReport {
    pub fn is_cancelled(&self) -> bool {
        self.status == JobStatus::Cancelled
    }

    /// Pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Human-readable summary.
    pub fn render_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for JobReport {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            out,
            "{} '{}'{}: {}",
            self.operation,
            self.job,
            if self.dry_run { " (dry run)" } else { "" },
            match self.status {
                JobStatus::Completed => "completed",
                JobStatus::Cancelled => "CANCELLED (partial)",
            }
        )?;
        writeln!(out, "Run ID:    {}", self.run_id)?;
        writeln!(out, "Duration:  {:.2}s", self.duration_seconds)?;
        writeln!(
            out,
            "Attempted: {}  Succeeded: {}  Skipped: {}  Failed: {}",
            self.attempted, self.succeeded, self.skipped, self.failed
        )?;
        self.details.render(out)?;
        if !self.exceptions.is_empty() {
            writeln!(out, "Exceptions:")?;
            for e in &self.exceptions {
                writeln!(out, "  {}: {}", e.item, e.cause)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::patch::StepReport;
    use crate::engine::rename::{Migrated, RenameOutcome};

    fn ctx(operation: Operation) -> RunContext {
        RunContext::start("job", operation, "abc".into(), false)
    }

    #[test]
    fn test_rename_tally_counts_conflicts_as_skipped() {
        let outcome = RenameOutcome {
            matched: 3,
            unchanged: 0,
            migrated: vec![Migrated {
                id: 5.into(),
                old: "a@old.com".into(),
                new: "a@new.com".into(),
            }],
            conflicts: vec![ItemFailure::new(
                "6",
                FailureCause::Conflict {
                    value: "b@new.com".into(),
                    held_by: "9".into(),
                },
            )],
            failures: vec![ItemFailure::new(
                "7",
                FailureCause::LockTimeout {
                    message: "timeout".into(),
                },
            )],
        };
        let report = ctx(Operation::Rename).finish(JobStatus::Completed, JobDetails::Rename(outcome));
        assert_eq!(
            (report.attempted, report.succeeded, report.skipped, report.failed),
            (3, 1, 1, 1)
        );
        assert_eq!(report.exceptions.len(), 2);
        assert!(report.render_text().contains("5 : a@old.com -> a@new.com"));
    }

    #[test]
    fn test_schema_patch_tally_and_json() {
        let outcome = PatchOutcome {
            steps: vec![
                StepReport {
                    step: "add column users.a".into(),
                    outcome: StepOutcome::Applied,
                },
                StepReport {
                    step: "add column users.b".into(),
                    outcome: StepOutcome::AlreadySatisfied,
                },
                StepReport {
                    step: "sql: bad".into(),
                    outcome: StepOutcome::Failed {
                        cause: FailureCause::Store {
                            message: "syntax error".into(),
                        },
                    },
                },
            ],
            terminated_sessions: Vec::new(),
        };
        let report = ctx(Operation::SchemaPatch).finish(JobStatus::Completed, JobDetails::SchemaPatch(outcome));
        assert_eq!((report.attempted, report.succeeded, report.failed), (3, 2, 1));

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["operation"], "schema_patch");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["details"]["steps"][1]["outcome"]["result"], "already_satisfied");
        assert_eq!(json["exceptions"][0]["cause"]["kind"], "store");
    }

    #[test]
    fn test_cancelled_report_is_marked() {
        let report = ctx(Operation::Rename).finish(
            JobStatus::Cancelled,
            JobDetails::Rename(RenameOutcome::default()),
        );
        assert!(report.is_cancelled());
        assert!(report.render_text().contains("CANCELLED"));
        assert_eq!(report.to_string(), report.render_text());
    }

    #[test]
    fn test_failure_cause_from_error() {
        let cause = FailureCause::from_error(&ReconcileError::LockTimeout("users".into()));
        assert!(matches!(cause, FailureCause::LockTimeout { .. }));
        let cause = FailureCause::from_error(&ReconcileError::Statement("boom".into()));
        assert!(matches!(cause, FailureCause::Store { .. }));
    }
}
