//! In-process store with failure injection.
//!
//! Rows live in ordered maps keyed by [`RecordId`]; a column that was never
//! set reads as NULL. Tables are addressed by name only, the schema of a
//! [`TableRef`] is ignored. Raw SQL filters are rejected, everything else
//! in a [`RecordSet`] is evaluated in process.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{SessionFilter, SessionInfo, Statement, Store, StoreStatus};
use crate::core::{FieldValue, Record, RecordId, RecordSet, SchemaObject, TableRef};
use crate::error::{ReconcileError, Result};

type Row = BTreeMap<String, FieldValue>;

#[derive(Debug, Default)]
struct Table {
    unique: Vec<String>,
    rows: BTreeMap<RecordId, Row>,
}

#[derive(Debug, Clone)]
struct HeldSession {
    pid: i32,
    table: Option<String>,
    idle_in_transaction: bool,
    xact_age: Duration,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, Table>,
    objects: HashSet<SchemaObject>,
    sessions: Vec<HeldSession>,
    executed: Vec<String>,
    failing_updates: HashSet<RecordId>,
    disconnect_on_update: HashSet<RecordId>,
    failing_statements: Vec<String>,
    locked_deletes: bool,
    unreachable: bool,
    next_pid: i32,
}

/// [`Store`] held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create an empty table.
    pub fn with_table(self, name: &str) -> Self {
        self.state().tables.entry(name.to_string()).or_default();
        self
    }

    /// Declare a unique constraint on a column.
    pub fn unique(self, table: &str, column: &str) -> Self {
        self.state()
            .tables
            .entry(table.to_string())
            .or_default()
            .unique
            .push(column.to_string());
        self
    }

    /// Insert or replace a row.
    pub fn insert(&self, table: &str, id: impl Into<RecordId>, fields: Vec<(&str, FieldValue)>) {
        let row = fields
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        self.state()
            .tables
            .entry(table.to_string())
            .or_default()
            .rows
            .insert(id.into(), row);
    }

    /// Make every update of this record fail with a lock timeout.
    pub fn fail_updates_for(&self, id: impl Into<RecordId>) {
        self.state().failing_updates.insert(id.into());
    }

    /// Drop the connection when this record is updated.
    pub fn disconnect_on_update(&self, id: impl Into<RecordId>) {
        self.state().disconnect_on_update.insert(id.into());
    }

    /// Reject statements whose SQL contains `fragment`.
    pub fn fail_statements_containing(&self, fragment: &str) {
        self.state().failing_statements.push(fragment.to_string());
    }

    /// Make bulk deletes time out waiting for a lock.
    pub fn lock_deletes(&self, locked: bool) {
        self.state().locked_deletes = locked;
    }

    /// Simulate another session holding a lock on `table`. Returns its pid.
    pub fn hold_lock(&self, table: &str, xact_age: Duration) -> i32 {
        self.hold(Some(table.to_string()), false, xact_age)
    }

    /// Simulate a session sitting idle in transaction. Returns its pid.
    pub fn hold_idle_transaction(&self, xact_age: Duration) -> i32 {
        self.hold(None, true, xact_age)
    }

    fn hold(&self, table: Option<String>, idle_in_transaction: bool, xact_age: Duration) -> i32 {
        let mut state = self.state();
        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        state.sessions.push(HeldSession {
            pid,
            table,
            idle_in_transaction,
            xact_age,
        });
        pid
    }

    /// Make every call fail as if the server went away.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Register an existing schema object.
    pub fn add_object(&self, object: SchemaObject) {
        self.state().objects.insert(object);
    }

    /// Current value of a column (`None` when the row is gone).
    pub fn field(&self, table: &str, id: impl Into<RecordId>, column: &str) -> Option<FieldValue> {
        let id = id.into();
        self.state().tables.get(table).and_then(|t| {
            t.rows
                .get(&id)
                .map(|row| row.get(column).cloned().unwrap_or(FieldValue::Null))
        })
    }

    /// Ids currently in a table, in order.
    pub fn ids(&self, table: &str) -> Vec<RecordId> {
        self.state()
            .tables
            .get(table)
            .map(|t| t.rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Statements that ran successfully, in order.
    pub fn executed(&self) -> Vec<String> {
        self.state().executed.clone()
    }

    /// Pids of sessions still alive.
    pub fn session_pids(&self) -> Vec<i32> {
        self.state().sessions.iter().map(|s| s.pid).collect()
    }
}

impl State {
    fn check_reachable(&self) -> Result<()> {
        if self.unreachable {
            Err(ReconcileError::Connection(
                "connection to server was lost".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn table(&self, name: &str) -> Result<&Table> {
        self.tables.get(name).ok_or_else(|| {
            ReconcileError::Statement(format!("relation \"{}\" does not exist", name))
        })
    }

    fn matching<'a>(
        &'a self,
        set: &'a RecordSet,
    ) -> Result<impl Iterator<Item = (&'a RecordId, &'a Row)> + 'a> {
        self.check_reachable()?;
        if set.filter.is_some() {
            return Err(ReconcileError::Config(
                "raw SQL filters are not supported by the in-memory store".to_string(),
            ));
        }
        let table = self.table(&set.table.name)?;
        Ok(table.rows.iter().filter(move |(_, row)| {
            set.conditions
                .iter()
                .all(|c| c.matches(row.get(c.column())))
        }))
    }
}

fn read(row: &Row, column: &str) -> FieldValue {
    row.get(column).cloned().unwrap_or(FieldValue::Null)
}

#[async_trait]
impl Store for MemoryStore {
    fn store_type(&self) -> &str {
        "memory"
    }

    async fn fetch(&self, set: &RecordSet) -> Result<Vec<Record>> {
        let state = self.state();
        let records = state
            .matching(set)?
            .map(|(id, row)| {
                let mut record = Record::new(id.clone());
                record.recency = set
                    .recency_column
                    .as_deref()
                    .and_then(|c| read(row, c).as_timestamp());
                for field in &set.fields {
                    record.fields.insert(field.clone(), read(row, field));
                }
                record
            })
            .collect();
        Ok(records)
    }

    async fn find_ids(&self, set: &RecordSet, limit: usize) -> Result<Vec<RecordId>> {
        let state = self.state();
        let ids = state
            .matching(set)?
            .take(limit)
            .map(|(id, _)| id.clone())
            .collect();
        Ok(ids)
    }

    async fn delete_ids(&self, table: &TableRef, ids: &[RecordId]) -> Result<u64> {
        let mut state = self.state();
        state.check_reachable()?;
        if state.locked_deletes {
            return Err(ReconcileError::LockTimeout(
                "canceling statement due to lock timeout".to_string(),
            ));
        }
        let rows = &mut state
            .tables
            .get_mut(&table.name)
            .ok_or_else(|| {
                ReconcileError::Statement(format!("relation \"{}\" does not exist", table.name))
            })?
            .rows;
        let removed = ids.iter().filter(|id| rows.remove(*id).is_some()).count();
        Ok(removed as u64)
    }

    async fn update_if(
        &self,
        table: &TableRef,
        id: &RecordId,
        column: &str,
        expected: &FieldValue,
        new: &FieldValue,
    ) -> Result<u64> {
        let mut state = self.state();
        if state.disconnect_on_update.contains(id) {
            state.unreachable = true;
        }
        state.check_reachable()?;
        if state.failing_updates.contains(id) {
            return Err(ReconcileError::LockTimeout(
                "canceling statement due to lock timeout".to_string(),
            ));
        }

        let target = state.tables.get_mut(&table.name).ok_or_else(|| {
            ReconcileError::Statement(format!("relation \"{}\" does not exist", table.name))
        })?;

        let current = match target.rows.get(id) {
            Some(row) => read(row, column),
            None => return Ok(0),
        };
        let still_expected = if expected.is_null() {
            current.is_null()
        } else {
            &current == expected
        };
        if !still_expected {
            return Ok(0);
        }

        if !new.is_null() && target.unique.iter().any(|c| c == column) {
            let taken = target
                .rows
                .iter()
                .any(|(other, row)| other != id && &read(row, column) == new);
            if taken {
                return Err(ReconcileError::UniqueViolation(format!(
                    "duplicate key value violates unique constraint on \"{}\".\"{}\"",
                    table.name, column
                )));
            }
        }

        if let Some(row) = target.rows.get_mut(id) {
            row.insert(column.to_string(), new.clone());
        }
        Ok(1)
    }

    async fn object_exists(&self, _schema: Option<&str>, object: &SchemaObject) -> Result<bool> {
        let state = self.state();
        state.check_reachable()?;
        let table_exists = match object {
            SchemaObject::Table { table } => state.tables.contains_key(table),
            _ => false,
        };
        Ok(table_exists || state.objects.contains(object))
    }

    async fn execute_bounded(&self, statement: &Statement, lock_wait: Duration) -> Result<u64> {
        let mut state = self.state();
        state.check_reachable()?;

        if let Some(fragment) = state
            .failing_statements
            .iter()
            .find(|f| statement.sql.contains(f.as_str()))
        {
            return Err(ReconcileError::Statement(format!(
                "statement rejected near \"{}\"",
                fragment
            )));
        }

        if let Some(table) = &statement.table {
            let blocked = state
                .sessions
                .iter()
                .any(|s| s.table.as_deref() == Some(table.as_str()));
            if blocked {
                return Err(ReconcileError::LockTimeout(format!(
                    "canceling statement due to lock timeout after {}ms on \"{}\"",
                    lock_wait.as_millis(),
                    table
                )));
            }
        }

        if let Some(object) = &statement.creates {
            if state.objects.contains(object) {
                return Err(ReconcileError::AlreadyExists(format!("{} already exists", object)));
            }
            if let SchemaObject::Table { table } = object {
                state.tables.entry(table.clone()).or_default();
            }
            state.objects.insert(object.clone());
        }

        state.executed.push(statement.sql.clone());
        Ok(0)
    }

    async fn terminate_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionInfo>> {
        let mut state = self.state();
        state.check_reachable()?;

        let selected = |s: &HeldSession| {
            let by_lock = s
                .table
                .as_ref()
                .map(|t| filter.tables.contains(t))
                .unwrap_or(false);
            let by_idle = filter.all_idle_in_transaction && s.idle_in_transaction;
            let old_enough = filter.min_age.map(|age| s.xact_age >= age).unwrap_or(true);
            (by_lock || by_idle) && old_enough
        };

        let (terminated, remaining): (Vec<_>, Vec<_>) =
            state.sessions.drain(..).partition(|s| selected(s));
        state.sessions = remaining;

        Ok(terminated
            .into_iter()
            .map(|s| SessionInfo {
                pid: s.pid,
                user: Some("app".to_string()),
                application_name: None,
                state: Some(
                    if s.idle_in_transaction {
                        "idle in transaction"
                    } else {
                        "active"
                    }
                    .to_string(),
                ),
                xact_age_secs: Some(s.xact_age.as_secs_f64()),
                terminated: true,
            })
            .collect())
    }

    async fn ping(&self) -> Result<StoreStatus> {
        self.state().check_reachable()?;
        Ok(StoreStatus {
            latency_ms: 0,
            server_version: "memory".to_string(),
            lock_timeout: "5s".to_string(),
            statement_timeout: "1min".to_string(),
        })
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Condition;

    fn users() -> MemoryStore {
        let store = MemoryStore::new().with_table("users").unique("users", "email");
        store.insert("users", 1, vec![("email", FieldValue::text("a@old.com"))]);
        store.insert("users", 2, vec![("email", FieldValue::text("b@old.com"))]);
        store
    }

    #[tokio::test]
    async fn test_fetch_applies_conditions_and_reads_absent_as_null() {
        let store = users();
        let set = RecordSet::new(TableRef::new("users"))
            .with_fields(["email", "mobile"])
            .with_condition(Condition::Contains {
                column: "email".into(),
                needle: "b@".into(),
            });
        let records = store.fetch(&set).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, RecordId::Int(2));
        assert_eq!(records[0].field("mobile"), Some(&FieldValue::Null));
    }

    #[tokio::test]
    async fn test_update_if_is_compare_and_set() {
        let store = users();
        let table = TableRef::new("users");
        let id = RecordId::Int(1);
        let changed = store
            .update_if(&table, &id, "email", &FieldValue::text("stale"), &FieldValue::text("x"))
            .await
            .unwrap();
        assert_eq!(changed, 0);

        let changed = store
            .update_if(
                &table,
                &id,
                "email",
                &FieldValue::text("a@old.com"),
                &FieldValue::text("a@new.com"),
            )
            .await
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(store.field("users", 1, "email"), Some(FieldValue::text("a@new.com")));
    }

    #[tokio::test]
    async fn test_unique_constraint_is_enforced() {
        let store = users();
        let err = store
            .update_if(
                &TableRef::new("users"),
                &RecordId::Int(1),
                "email",
                &FieldValue::text("a@old.com"),
                &FieldValue::text("b@old.com"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn test_raw_filter_is_rejected() {
        let store = users();
        let set = RecordSet::new(TableRef::new("users")).with_filter(Some("true".into()));
        assert!(matches!(
            store.fetch(&set).await.unwrap_err(),
            ReconcileError::Config(_)
        ));
    }

    #[tokio::test]
    async fn test_terminate_sessions_respects_min_age() {
        let store = users();
        let young = store.hold_lock("users", Duration::from_secs(2));
        let old = store.hold_lock("users", Duration::from_secs(600));
        let idle = store.hold_idle_transaction(Duration::from_secs(900));

        let filter = SessionFilter {
            tables: vec!["users".into()],
            min_age: Some(Duration::from_secs(60)),
            ..SessionFilter::default()
        };
        let killed = store.terminate_sessions(&filter).await.unwrap();
        assert_eq!(killed.iter().map(|s| s.pid).collect::<Vec<_>>(), vec![old]);
        assert_eq!(store.session_pids(), vec![young, idle]);
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_with_connectivity() {
        let store = users();
        store.set_unreachable(true);
        let err = store.ping().await.unwrap_err();
        assert!(err.is_connectivity());
    }
}
