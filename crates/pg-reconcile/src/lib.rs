//! # pg-reconcile
//!
//! Data reconciliation and safe schema migration for PostgreSQL.
//!
//! Jobs are declared in YAML and run one at a time against a live database:
//!
//! - **Deduplication** keeps the most recent record per logical key
//! - **Orphan relinking** reattaches children through a secondary identifier
//! - **Identity migration** rewrites a unique column in place, skipping conflicts
//! - **Schema patching** applies additive DDL with a bounded lock wait, with an
//!   explicit escalation that clears blocking sessions
//! - **Audit** reports unlinked and dangling children without writing
//!
//! Every job is idempotent and produces a [`JobReport`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use pg_reconcile::{Config, JobRunner};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> pg_reconcile::Result<()> {
//!     let config = Config::load("reconcile.yaml")?;
//!     let runner = JobRunner::connect(config, None).await?;
//!     let report = runner.dedup("submissions", true, &CancellationToken::new()).await?;
//!     println!("{}", report.render_text());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod report;
pub mod runner;
pub mod store;

// Re-exports for convenient access
pub use config::{Config, DedupJob, RelinkJob, RenameJob, SchemaPatchJob, StoreConfig};
pub use error::{ReconcileError, Result};
pub use report::{FailureCause, ItemFailure, JobReport, JobStatus, Operation};
pub use runner::{ClearSessionsOptions, JobRunner};
pub use store::{MemoryStore, PgStore, Store};
