//! PostgreSQL store.
//!
//! Uses deadpool-postgres for pooling. Every pooled session is opened with
//! `lock_timeout` and `statement_timeout` set through the startup options,
//! so no statement issued by a job can wait indefinitely behind live
//! application traffic.

use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use rust_decimal::Decimal;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Config as PgConfig, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::tls::{self, SslMode};
use super::{SessionFilter, SessionInfo, Statement, Store, StoreStatus};
use crate::config::StoreConfig;
use crate::core::identifier::{qualify_pg, quote_pg};
use crate::core::{FieldValue, Record, RecordId, RecordSet, SchemaObject, TableRef};
use crate::error::{ErrorClass, ReconcileError, Result};

/// Keepalive idle interval for pooled sessions.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

/// PostgreSQL-backed [`Store`].
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Open a pool and verify the store answers.
    ///
    /// `url` takes precedence over the structured fields of `config`; the
    /// timeouts, TLS mode and application name always come from `config`.
    pub async fn connect(config: &StoreConfig, url: Option<&str>) -> Result<Self> {
        let mut pg_config = match url {
            Some(url) => PgConfig::from_str(url)
                .map_err(|e| ReconcileError::Config(format!("invalid database URL: {}", e)))?,
            None => {
                let mut pg_config = PgConfig::new();
                pg_config.host(&config.host);
                pg_config.port(config.port);
                pg_config.dbname(&config.database);
                pg_config.user(&config.user);
                if !config.password.is_empty() {
                    pg_config.password(&config.password);
                }
                pg_config
            }
        };

        pg_config.application_name(&config.application_name);
        pg_config.options(&session_options(config));
        pg_config.keepalives(true);
        pg_config.keepalives_idle(KEEPALIVE_IDLE);
        pg_config.connect_timeout(Duration::from_secs(config.connect_timeout_secs));

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let ssl_mode = SslMode::parse(&config.ssl_mode)?;
        let pool = match tls::connector(ssl_mode)? {
            None => {
                if url.is_none() && config.host != "localhost" {
                    warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                }
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr)
                    .max_size(config.max_connections)
                    .build()
                    .map_err(|e| ReconcileError::pool(e, "creating PostgreSQL pool"))?
            }
            Some(connector) => {
                let mgr = Manager::from_config(pg_config, connector, mgr_config);
                Pool::builder(mgr)
                    .max_size(config.max_connections)
                    .build()
                    .map_err(|e| ReconcileError::pool(e, "creating PostgreSQL pool"))?
            }
        };

        let client = pool
            .get()
            .await
            .map_err(|e| ReconcileError::Connection(e.to_string()))?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| ReconcileError::Connection(e.to_string()))?;

        info!(
            "Connected to PostgreSQL store (lock_timeout={}ms, statement_timeout={}ms)",
            config.lock_timeout_ms, config.statement_timeout_ms
        );

        Ok(Self { pool })
    }

    async fn client(&self, context: &str) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| ReconcileError::pool(e, context))
    }
}

/// Startup `options` carrying the per-session timeouts.
fn session_options(config: &StoreConfig) -> String {
    format!(
        "-c lock_timeout={} -c statement_timeout={}",
        config.lock_timeout_ms, config.statement_timeout_ms
    )
}

/// Fold a driver error into the taxonomy engines isolate on.
fn map_pg(err: tokio_postgres::Error) -> ReconcileError {
    let message = err
        .as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_else(|| err.to_string());
    match ReconcileError::Store(err).class() {
        ErrorClass::LockTimeout => ReconcileError::LockTimeout(message),
        ErrorClass::UniqueViolation => ReconcileError::UniqueViolation(message),
        ErrorClass::AlreadyExists => ReconcileError::AlreadyExists(message),
        ErrorClass::Connectivity => ReconcileError::Connection(message),
        ErrorClass::Other => ReconcileError::Statement(message),
    }
}

fn as_params(values: &[FieldValue]) -> Vec<&(dyn ToSql + Sync)> {
    values.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

/// Decode one column of a row into a [`FieldValue`] by its wire type.
fn decode_field(row: &Row, idx: usize) -> Result<FieldValue> {
    let column = &row.columns()[idx];
    let value = match *column.type_() {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(FieldValue::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| FieldValue::Int(v.into())),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| FieldValue::Int(v.into())),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(FieldValue::Int),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| FieldValue::Float(v.into())),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(FieldValue::Float),
        Type::NUMERIC => row.try_get::<_, Option<Decimal>>(idx)?.map(FieldValue::Decimal),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            row.try_get::<_, Option<String>>(idx)?.map(FieldValue::Text)
        }
        Type::UUID => row.try_get::<_, Option<Uuid>>(idx)?.map(FieldValue::Uuid),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|v| FieldValue::Timestamp(v.and_utc())),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(FieldValue::Timestamp),
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx)?.map(FieldValue::Date),
        ref other => {
            return Err(ReconcileError::UnsupportedType {
                column: column.name().to_string(),
                type_name: other.name().to_string(),
            })
        }
    };
    Ok(value.unwrap_or(FieldValue::Null))
}

fn decode_id(row: &Row, table: &TableRef) -> Result<RecordId> {
    let value = decode_field(row, 0)?;
    RecordId::from_field(&value).ok_or_else(|| {
        ReconcileError::Statement(format!(
            "{}.{} holds {} which cannot identify a record",
            table.display_name(),
            table.id_column,
            if value.is_null() { "NULL" } else { "a non-key value" }
        ))
    })
}

fn decode_record(row: &Row, set: &RecordSet) -> Result<Record> {
    let mut record = Record::new(decode_id(row, &set.table)?);
    let mut idx = 1;
    if set.recency_column.is_some() {
        record.recency = decode_field(row, idx)?.as_timestamp();
        idx += 1;
    }
    for field in &set.fields {
        record.fields.insert(field.clone(), decode_field(row, idx)?);
        idx += 1;
    }
    Ok(record)
}

#[async_trait]
impl Store for PgStore {
    fn store_type(&self) -> &str {
        "postgres"
    }

    async fn fetch(&self, set: &RecordSet) -> Result<Vec<Record>> {
        let (sql, params) = set.select_sql()?;
        debug!("fetch: {}", sql);

        let client = self.client("fetching records").await?;
        let rows = client
            .query(sql.as_str(), &as_params(&params))
            .await
            .map_err(map_pg)?;
        rows.iter().map(|row| decode_record(row, set)).collect()
    }

    async fn find_ids(&self, set: &RecordSet, limit: usize) -> Result<Vec<RecordId>> {
        let (where_clause, params) = set.where_clause(1)?;
        let id = quote_pg(&set.table.id_column)?;
        let sql = format!(
            "SELECT {id} FROM {}{} ORDER BY {id} LIMIT {}",
            set.table.qualified()?,
            where_clause,
            limit,
            id = id
        );

        let client = self.client("looking up record ids").await?;
        let rows = client
            .query(sql.as_str(), &as_params(&params))
            .await
            .map_err(map_pg)?;
        rows.iter().map(|row| decode_id(row, &set.table)).collect()
    }

    async fn delete_ids(&self, table: &TableRef, ids: &[RecordId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {} WHERE {} = ANY($1)",
            table.qualified()?,
            quote_pg(&table.id_column)?
        );

        let client = self.client("deleting records").await?;
        client.execute(sql.as_str(), &[&ids]).await.map_err(map_pg)
    }

    async fn update_if(
        &self,
        table: &TableRef,
        id: &RecordId,
        column: &str,
        expected: &FieldValue,
        new: &FieldValue,
    ) -> Result<u64> {
        let column = quote_pg(column)?;
        let base = format!(
            "UPDATE {} SET {col} = $1 WHERE {} = $2 AND {col}",
            table.qualified()?,
            quote_pg(&table.id_column)?,
            col = column
        );

        let client = self.client("updating record").await?;
        let changed = if expected.is_null() {
            let sql = format!("{} IS NULL", base);
            client.execute(sql.as_str(), &[new, id]).await
        } else {
            let sql = format!("{} = $3", base);
            client.execute(sql.as_str(), &[new, id, expected]).await
        };
        changed.map_err(map_pg)
    }

    async fn object_exists(&self, schema: Option<&str>, object: &SchemaObject) -> Result<bool> {
        let client = self.client("probing schema object").await?;
        let row = match object {
            SchemaObject::Column { table, column } => {
                let relation = qualify_pg(schema, table)?;
                client
                    .query_one(
                        "SELECT EXISTS (
                            SELECT 1 FROM pg_catalog.pg_attribute
                            WHERE attrelid = to_regclass($1::text)
                              AND attname = $2::text
                              AND NOT attisdropped
                        )",
                        &[&relation, column],
                    )
                    .await
            }
            SchemaObject::Index { name: relation } | SchemaObject::Table { table: relation } => {
                let relation = qualify_pg(schema, relation)?;
                client
                    .query_one("SELECT to_regclass($1::text) IS NOT NULL", &[&relation])
                    .await
            }
        }
        .map_err(map_pg)?;
        Ok(row.get(0))
    }

    async fn execute_bounded(&self, statement: &Statement, lock_wait: Duration) -> Result<u64> {
        let mut client = self.client("running schema statement").await?;
        let tx = client.transaction().await.map_err(map_pg)?;
        tx.batch_execute(&format!("SET LOCAL lock_timeout = '{}ms'", lock_wait.as_millis()))
            .await
            .map_err(map_pg)?;
        let affected = tx.execute(statement.sql.as_str(), &[]).await.map_err(map_pg)?;
        tx.commit().await.map_err(map_pg)?;
        Ok(affected)
    }

    async fn terminate_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionInfo>> {
        let relations = filter
            .tables
            .iter()
            .map(|t| qualify_pg(filter.schema.as_deref(), t))
            .collect::<Result<Vec<_>>>()?;
        let min_age = filter.min_age.map(|d| d.as_secs_f64());

        let client = self.client("terminating sessions").await?;
        let rows = client
            .query(
                "SELECT a.pid,
                        a.usename::text,
                        a.application_name,
                        a.state,
                        EXTRACT(EPOCH FROM (now() - a.xact_start))::float8,
                        pg_terminate_backend(a.pid)
                 FROM pg_stat_activity a
                 WHERE a.datname = current_database()
                   AND a.pid <> pg_backend_pid()
                   AND (($1::bool AND a.state = 'idle in transaction')
                        OR a.pid IN (SELECT l.pid FROM pg_locks l
                                     WHERE l.relation IN (
                                         SELECT to_regclass(t) FROM unnest($2::text[]) AS t)))
                   AND ($3::float8 IS NULL
                        OR a.xact_start < now() - make_interval(secs => $3::float8))",
                &[&filter.all_idle_in_transaction, &relations, &min_age],
            )
            .await
            .map_err(map_pg)?;

        let sessions = rows
            .iter()
            .map(|row| SessionInfo {
                pid: row.get(0),
                user: row.get(1),
                application_name: row.get(2),
                state: row.get(3),
                xact_age_secs: row.get(4),
                terminated: row.get(5),
            })
            .collect::<Vec<_>>();

        for session in &sessions {
            warn!(
                "Terminated session pid={} state={:?} app={:?} (ok={})",
                session.pid, session.state, session.application_name, session.terminated
            );
        }
        Ok(sessions)
    }

    async fn ping(&self) -> Result<StoreStatus> {
        let start = Instant::now();
        let client = self.client("health check").await?;
        let row = client
            .query_one(
                "SELECT current_setting('server_version'),
                        current_setting('lock_timeout'),
                        current_setting('statement_timeout')",
                &[],
            )
            .await
            .map_err(map_pg)?;

        Ok(StoreStatus {
            latency_ms: start.elapsed().as_millis() as u64,
            server_version: row.get(0),
            lock_timeout: row.get(1),
            statement_timeout: row.get(2),
        })
    }

    async fn close(&self) {
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_options_carry_timeouts() {
        let config = StoreConfig {
            lock_timeout_ms: 3000,
            statement_timeout_ms: 45000,
            ..StoreConfig::default()
        };
        assert_eq!(
            session_options(&config),
            "-c lock_timeout=3000 -c statement_timeout=45000"
        );
    }

    #[tokio::test]
    async fn test_invalid_url_is_a_config_error() {
        let err = PgStore::connect(&StoreConfig::default(), Some("postgres://host:notaport/db"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ReconcileError::Config(_)));
    }
}
