//! Configuration validation.

use std::collections::HashSet;

use super::{Config, StoreConfig};
use crate::core::identifier::validate_identifier;
use crate::core::FieldValue;
use crate::error::{ReconcileError, Result};
use crate::store::tls::SslMode;

/// Upper bound for any configured lock wait, in milliseconds.
const MAX_LOCK_WAIT_MS: u64 = 30_000;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_store(&config.store)?;

    // Job names must be unique within each section
    unique_names("dedup", config.dedup.iter().map(|j| j.name.as_str()))?;
    unique_names("relink", config.relink.iter().map(|j| j.name.as_str()))?;
    unique_names("rename", config.rename.iter().map(|j| j.name.as_str()))?;
    unique_names(
        "schema_patch",
        config.schema_patch.iter().map(|j| j.name.as_str()),
    )?;

    for job in &config.dedup {
        if job.key.is_empty() {
            return Err(ReconcileError::Config(format!(
                "dedup '{}': key must name at least one column",
                job.name
            )));
        }
        job.record_set()
            .validate()
            .map_err(|e| in_job("dedup", &job.name, e))?;
    }

    for job in &config.relink {
        job.orphans()
            .validate()
            .map_err(|e| in_job("relink", &job.name, e))?;
        job.parents_matching(FieldValue::Null)
            .validate()
            .map_err(|e| in_job("relink", &job.name, e))?;
        validate_identifier(&job.child.link_column).map_err(|e| in_job("relink", &job.name, e))?;
        if job.child.link_column == job.child.match_column {
            return Err(ReconcileError::Config(format!(
                "relink '{}': child.link_column and child.match_column must differ",
                job.name
            )));
        }
    }

    for job in &config.rename {
        if job.column == job.id_column {
            return Err(ReconcileError::Config(format!(
                "rename '{}': column cannot be the id column",
                job.name
            )));
        }
        job.pattern
            .validate()
            .map_err(|e| in_job("rename", &job.name, e))?;
        job.candidates()
            .validate()
            .map_err(|e| in_job("rename", &job.name, e))?;
    }

    for job in &config.schema_patch {
        if job.steps.is_empty() {
            return Err(ReconcileError::Config(format!(
                "schema_patch '{}': steps must not be empty",
                job.name
            )));
        }
        if let Some(ms) = job.lock_wait_ms {
            if ms == 0 || ms > MAX_LOCK_WAIT_MS {
                return Err(ReconcileError::Config(format!(
                    "schema_patch '{}': lock_wait_ms must be between 1 and {}",
                    job.name, MAX_LOCK_WAIT_MS
                )));
            }
        }
        if let Some(schema) = &job.schema {
            validate_identifier(schema).map_err(|e| in_job("schema_patch", &job.name, e))?;
        }
        for step in &job.steps {
            step.validate()
                .map_err(|e| in_job("schema_patch", &job.name, e))?;
        }
    }

    Ok(())
}

fn validate_store(store: &StoreConfig) -> Result<()> {
    if store.url.is_none() {
        if store.host.is_empty() {
            return Err(ReconcileError::Config("store.host is required".into()));
        }
        if store.database.is_empty() {
            return Err(ReconcileError::Config("store.database is required".into()));
        }
        if store.user.is_empty() {
            return Err(ReconcileError::Config("store.user is required".into()));
        }
    }
    SslMode::parse(&store.ssl_mode)?;
    if store.lock_timeout_ms == 0 || store.lock_timeout_ms > MAX_LOCK_WAIT_MS {
        return Err(ReconcileError::Config(format!(
            "store.lock_timeout_ms must be between 1 and {}",
            MAX_LOCK_WAIT_MS
        )));
    }
    // 0 would disable the timeout entirely
    if store.statement_timeout_ms == 0 {
        return Err(ReconcileError::Config(
            "store.statement_timeout_ms must be at least 1".into(),
        ));
    }
    if store.max_connections == 0 {
        return Err(ReconcileError::Config(
            "store.max_connections must be at least 1".into(),
        ));
    }
    Ok(())
}

fn unique_names<'a>(section: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(ReconcileError::Config(format!(
                "{}: job name is required",
                section
            )));
        }
        if !seen.insert(name) {
            return Err(ReconcileError::Config(format!(
                "{}: duplicate job name '{}'",
                section, name
            )));
        }
    }
    Ok(())
}

fn in_job(section: &str, name: &str, err: ReconcileError) -> ReconcileError {
    match err {
        ReconcileError::Config(message) => {
            ReconcileError::Config(format!("{} '{}': {}", section, name, message))
        }
        other => other,
    }
}
