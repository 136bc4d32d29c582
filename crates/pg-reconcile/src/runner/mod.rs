//! Job runner: resolves a named job, runs its engine and builds the report.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{job_hash, Config, DATABASE_URL_ENV};
use crate::engine::{audit, dedup, patch, relink, rename};
use crate::error::Result;
use crate::report::{JobDetails, JobReport, Operation, RunContext};
use crate::store::{PgStore, SessionFilter, Store, StoreStatus};

/// Options for the session-clearing escalation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClearSessionsOptions {
    /// Also terminate idle-in-transaction sessions that hold no lock on the
    /// job's tables.
    pub all_idle_in_transaction: bool,
    /// Only terminate sessions whose transaction is at least this old.
    pub min_age: Option<Duration>,
}

/// Runs configured jobs against one store.
pub struct JobRunner {
    config: Config,
    store: Arc<dyn Store>,
}

impl JobRunner {
    /// Connect to the store the configuration (or an override) points at.
    ///
    /// URL precedence: `url_override`, then `DATABASE_URL`, then `store.url`,
    /// then the structured `store` fields.
    pub async fn connect(config: Config, url_override: Option<&str>) -> Result<Self> {
        let env_url = std::env::var(DATABASE_URL_ENV).ok();
        let url = config.store.resolve_url(url_override, env_url.as_deref());
        info!("Connecting to {}", config.store.describe(url.as_deref()));

        let store = PgStore::connect(&config.store, url.as_deref()).await?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Use an already-open store.
    pub fn with_store(config: Config, store: Arc<dyn Store>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub async fn dedup(&self, name: &str, dry_run: bool, cancel: &CancellationToken) -> Result<JobReport> {
        let job = self.config.dedup_job(name)?;
        let ctx = RunContext::start(name, Operation::Dedup, job_hash(job), dry_run);
        let (outcome, status) = dedup::run(self.store(), job, dry_run, cancel).await?;
        Ok(ctx.finish(status, JobDetails::Dedup(outcome)))
    }

    pub async fn relink(&self, name: &str, dry_run: bool, cancel: &CancellationToken) -> Result<JobReport> {
        let job = self.config.relink_job(name)?;
        let ctx = RunContext::start(name, Operation::Relink, job_hash(job), dry_run);
        let (outcome, status) = relink::run(self.store(), job, dry_run, cancel).await?;
        Ok(ctx.finish(status, JobDetails::Relink(outcome)))
    }

    pub async fn rename(&self, name: &str, dry_run: bool, cancel: &CancellationToken) -> Result<JobReport> {
        let job = self.config.rename_job(name)?;
        let ctx = RunContext::start(name, Operation::Rename, job_hash(job), dry_run);
        let (outcome, status) = rename::run(self.store(), job, dry_run, cancel).await?;
        Ok(ctx.finish(status, JobDetails::Rename(outcome)))
    }

    /// Apply a schema patch job. Never terminates sessions.
    pub async fn schema_patch(&self, name: &str, cancel: &CancellationToken) -> Result<JobReport> {
        let job = self.config.schema_patch_job(name)?;
        let ctx = RunContext::start(name, Operation::SchemaPatch, job_hash(job), false);
        let (outcome, status) = patch::apply(self.store(), job, cancel).await?;
        Ok(ctx.finish(status, JobDetails::SchemaPatch(outcome)))
    }

    /// Terminate sessions blocking a schema patch job's tables, then retry it once.
    pub async fn clear_sessions(
        &self,
        name: &str,
        options: ClearSessionsOptions,
        cancel: &CancellationToken,
    ) -> Result<JobReport> {
        let job = self.config.schema_patch_job(name)?;
        let filter = SessionFilter {
            schema: job.schema.clone(),
            tables: patch::touched_tables(job),
            all_idle_in_transaction: options.all_idle_in_transaction,
            min_age: options.min_age,
        };
        if filter.tables.is_empty() && !filter.all_idle_in_transaction {
            warn!(
                "clear-sessions '{}': no steps name a table; only raw SQL steps will be retried",
                name
            );
        }

        let ctx = RunContext::start(name, Operation::ClearSessions, job_hash(job), false);
        let (outcome, status) = patch::escalate(self.store(), job, &filter, cancel).await?;
        Ok(ctx.finish(status, JobDetails::SchemaPatch(outcome)))
    }

    /// Read-only link audit over a relink job's tables.
    pub async fn audit(&self, name: &str, cancel: &CancellationToken) -> Result<JobReport> {
        let job = self.config.relink_job(name)?;
        let ctx = RunContext::start(name, Operation::Audit, job_hash(job), false);
        let (outcome, status) = audit::run(self.store(), job, cancel).await?;
        Ok(ctx.finish(status, JobDetails::Audit(outcome)))
    }

    pub async fn health_check(&self) -> Result<StoreStatus> {
        self.store.ping().await
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}
