//! Store adapter: the narrow interface engines use to reach the data.
//!
//! The [`Store`] trait is the only way an engine touches rows or schema.
//! Implementations:
//!
//! - **PostgreSQL**: [`PgStore`] in `postgres.rs` (tokio-postgres + deadpool)
//! - **In-memory**: [`MemoryStore`] in `memory.rs`, with failure injection
//!
//! Engines receive an `Arc<dyn Store>` explicitly; there is no process-wide
//! client. The runner opens the store before a job and closes it after.
//!
//! Every write is a single statement that commits on its own. No method
//! holds a transaction across calls.

mod memory;
mod postgres;
pub mod tls;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::core::{FieldValue, Record, RecordId, RecordSet, SchemaObject, TableRef};
use crate::error::Result;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// A DDL or raw statement run under a bounded lock wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    /// Table whose lock the statement takes, if known.
    pub table: Option<String>,
    /// Object the statement creates, if known.
    pub creates: Option<SchemaObject>,
}

/// Which other sessions a session-clearing escalation may terminate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub schema: Option<String>,
    /// Sessions holding any lock on these tables.
    pub tables: Vec<String>,
    /// Also every session sitting `idle in transaction`.
    pub all_idle_in_transaction: bool,
    /// Only sessions whose transaction started at least this long ago.
    pub min_age: Option<Duration>,
}

/// A session the escalation found and tried to terminate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub pid: i32,
    pub user: Option<String>,
    pub application_name: Option<String>,
    pub state: Option<String>,
    pub xact_age_secs: Option<f64>,
    pub terminated: bool,
}

/// Connectivity probe result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStatus {
    pub latency_ms: u64,
    pub server_version: String,
    pub lock_timeout: String,
    pub statement_timeout: String,
}

/// Narrow query/update/raw-execute interface to the relational store.
///
/// Implementations must be `Send + Sync`; engines hold `Arc<dyn Store>`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Short name for logs ("postgres", "memory").
    fn store_type(&self) -> &str;

    /// Fetch every record matching the selector, ordered by id.
    async fn fetch(&self, set: &RecordSet) -> Result<Vec<Record>>;

    /// Ids of at most `limit` records matching the selector, ordered by id.
    async fn find_ids(&self, set: &RecordSet, limit: usize) -> Result<Vec<RecordId>>;

    /// Delete records by id in one statement. Returns the rows removed.
    async fn delete_ids(&self, table: &TableRef, ids: &[RecordId]) -> Result<u64>;

    /// Compare-and-set one column of one record.
    ///
    /// Sets `column = new` only where `column` still equals `expected`
    /// (`IS NULL` when `expected` is NULL). Returns the rows changed, so
    /// zero means the record moved on since it was read.
    async fn update_if(
        &self,
        table: &TableRef,
        id: &RecordId,
        column: &str,
        expected: &FieldValue,
        new: &FieldValue,
    ) -> Result<u64>;

    /// Whether a schema object already exists.
    async fn object_exists(&self, schema: Option<&str>, object: &SchemaObject) -> Result<bool>;

    /// Run a statement in its own transaction with `lock_timeout = lock_wait`.
    async fn execute_bounded(&self, statement: &Statement, lock_wait: Duration) -> Result<u64>;

    /// Terminate other sessions in the current database matching the filter.
    async fn terminate_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionInfo>>;

    /// Round-trip to the store and read its effective timeouts.
    async fn ping(&self) -> Result<StoreStatus>;

    /// Release pooled connections.
    async fn close(&self);
}
