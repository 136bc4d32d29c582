//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::{ReconcileError, Result};
use crate::report::Operation;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Err(ReconcileError::Config("configuration is empty".into()));
        }
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    pub fn dedup_job(&self, name: &str) -> Result<&DedupJob> {
        self.dedup
            .iter()
            .find(|j| j.name == name)
            .ok_or_else(|| ReconcileError::unknown_job(Operation::Dedup.to_string(), name))
    }

    pub fn relink_job(&self, name: &str) -> Result<&RelinkJob> {
        self.relink
            .iter()
            .find(|j| j.name == name)
            .ok_or_else(|| ReconcileError::unknown_job(Operation::Relink.to_string(), name))
    }

    pub fn rename_job(&self, name: &str) -> Result<&RenameJob> {
        self.rename
            .iter()
            .find(|j| j.name == name)
            .ok_or_else(|| ReconcileError::unknown_job(Operation::Rename.to_string(), name))
    }

    pub fn schema_patch_job(&self, name: &str) -> Result<&SchemaPatchJob> {
        self.schema_patch
            .iter()
            .find(|j| j.name == name)
            .ok_or_else(|| ReconcileError::unknown_job(Operation::SchemaPatch.to_string(), name))
    }

    /// Every configured job as `(operation, name)`, in file order per section.
    pub fn jobs(&self) -> Vec<(Operation, &str)> {
        let dedup = self.dedup.iter().map(|j| (Operation::Dedup, j.name.as_str()));
        let relink = self.relink.iter().map(|j| (Operation::Relink, j.name.as_str()));
        let rename = self.rename.iter().map(|j| (Operation::Rename, j.name.as_str()));
        let patch = self
            .schema_patch
            .iter()
            .map(|j| (Operation::SchemaPatch, j.name.as_str()));
        dedup.chain(relink).chain(rename).chain(patch).collect()
    }
}

/// SHA256 of a job definition, recorded in reports to tie a run to its config.
pub fn job_hash<T: Serialize>(job: &T) -> String {
    let yaml = serde_yaml::to_string(job).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(yaml.as_bytes());
    format!("{:x}", hasher.finalize())
}
