//! Schema patching with bounded lock waits, and the session-clearing escalation.
//!
//! Each step runs in its own transaction with `SET LOCAL lock_timeout`, so
//! a step blocked behind live traffic fails fast and the next step still
//! runs. Terminating other sessions is only reachable through [`escalate`],
//! which the CLI exposes as a separate, confirmed command.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchemaPatchJob;
use crate::core::SchemaStep;
use crate::error::{ErrorClass, Result};
use crate::report::{FailureCause, JobStatus};
use crate::store::{SessionFilter, SessionInfo, Statement, Store};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StepOutcome {
    Applied,
    AlreadySatisfied,
    Failed { cause: FailureCause },
}

impl StepOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StepOutcome::Applied => "applied",
            StepOutcome::AlreadySatisfied => "already_satisfied",
            StepOutcome::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: String,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PatchOutcome {
    pub steps: Vec<StepReport>,
    /// Sessions terminated before the retry, when escalation ran.
    pub terminated_sessions: Vec<SessionInfo>,
}

async fn apply_step(
    store: &dyn Store,
    schema: Option<&str>,
    step: &SchemaStep,
    lock_wait: Duration,
) -> Result<StepOutcome> {
    let creates = step.object();

    if let Some(object) = &creates {
        match store.object_exists(schema, object).await {
            Ok(true) => return Ok(StepOutcome::AlreadySatisfied),
            Ok(false) => {}
            Err(e) if e.is_connectivity() => return Err(e),
            Err(e) => {
                return Ok(StepOutcome::Failed {
                    cause: FailureCause::from_error(&e),
                })
            }
        }
    }

    let sql = match step.to_sql(schema) {
        Ok(sql) => sql,
        Err(e) => {
            return Ok(StepOutcome::Failed {
                cause: FailureCause::from_error(&e),
            })
        }
    };
    debug!("schema step: {}", sql);

    let statement = Statement {
        sql,
        table: step.table().map(str::to_string),
        creates,
    };
    match store.execute_bounded(&statement, lock_wait).await {
        Ok(_) => Ok(StepOutcome::Applied),
        Err(e) => match e.class() {
            ErrorClass::AlreadyExists => Ok(StepOutcome::AlreadySatisfied),
            ErrorClass::Connectivity => Err(e),
            _ => Ok(StepOutcome::Failed {
                cause: FailureCause::from_error(&e),
            }),
        },
    }
}

/// Apply every step of a patch job, in order.
pub async fn apply(
    store: &dyn Store,
    job: &SchemaPatchJob,
    cancel: &CancellationToken,
) -> Result<(PatchOutcome, JobStatus)> {
    let lock_wait = job.lock_wait();
    info!(
        "schema-patch '{}': {} steps, lock wait {}ms",
        job.name,
        job.steps.len(),
        lock_wait.as_millis()
    );

    let mut outcome = PatchOutcome::default();
    for step in &job.steps {
        if cancel.is_cancelled() {
            warn!("schema-patch '{}': cancelled before '{}'", job.name, step);
            return Ok((outcome, JobStatus::Cancelled));
        }

        let result = apply_step(store, job.schema.as_deref(), step, lock_wait).await?;
        match &result {
            StepOutcome::Failed { cause } => warn!("schema-patch '{}': {} failed: {}", job.name, step, cause),
            other => info!("schema-patch '{}': {} {}", job.name, step, other.label()),
        }
        outcome.steps.push(StepReport {
            step: step.to_string(),
            outcome: result,
        });
    }

    Ok((outcome, JobStatus::Completed))
}

/// Tables a patch job's steps lock, in a stable order.
pub fn touched_tables(job: &SchemaPatchJob) -> Vec<String> {
    job.steps
        .iter()
        .filter_map(SchemaStep::table)
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Terminate blocking sessions, then retry the whole patch once.
pub async fn escalate(
    store: &dyn Store,
    job: &SchemaPatchJob,
    filter: &SessionFilter,
    cancel: &CancellationToken,
) -> Result<(PatchOutcome, JobStatus)> {
    if cancel.is_cancelled() {
        return Ok((PatchOutcome::default(), JobStatus::Cancelled));
    }

    warn!(
        "schema-patch '{}': terminating sessions locking {:?}{}",
        job.name,
        filter.tables,
        if filter.all_idle_in_transaction {
            " and every idle-in-transaction session"
        } else {
            ""
        }
    );
    let sessions = store.terminate_sessions(filter).await?;
    info!("schema-patch '{}': terminated {} sessions, retrying", job.name, sessions.len());

    let (mut outcome, status) = apply(store, job, cancel).await?;
    outcome.terminated_sessions = sessions;
    Ok((outcome, status))
}
