//! Additive schema steps and the objects they create.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::identifier::{qualify_pg, quote_pg, validate_fragment, validate_identifier};
use crate::error::{ReconcileError, Result};

/// A schema object whose existence can be probed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaObject {
    Column { table: String, column: String },
    Index { name: String },
    Table { table: String },
}

impl SchemaObject {
    /// Table the object belongs to, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            SchemaObject::Column { table, .. } | SchemaObject::Table { table } => Some(table),
            SchemaObject::Index { .. } => None,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            SchemaObject::Column { table, column } => {
                validate_identifier(table)?;
                validate_identifier(column)
            }
            SchemaObject::Index { name } => validate_identifier(name),
            SchemaObject::Table { table } => validate_identifier(table),
        }
    }
}

impl fmt::Display for SchemaObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaObject::Column { table, column } => write!(f, "column {}.{}", table, column),
            SchemaObject::Index { name } => write!(f, "index {}", name),
            SchemaObject::Table { table } => write!(f, "table {}", table),
        }
    }
}

/// Column definition for [`SchemaStep::CreateTable`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
}

fn default_true() -> bool {
    true
}

impl ColumnDef {
    fn validate(&self) -> Result<()> {
        validate_identifier(&self.name)?;
        validate_fragment("column type", &self.data_type)?;
        if let Some(default) = &self.default {
            validate_fragment("column default", default)?;
        }
        Ok(())
    }

    fn to_sql(&self) -> Result<String> {
        let mut sql = format!("{} {}", quote_pg(&self.name)?, self.data_type);
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if self.primary_key {
            sql.push_str(" PRIMARY KEY");
        }
        Ok(sql)
    }
}

/// One additive schema change. Applying it twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaStep {
    /// Ensure a column exists.
    AddColumn {
        table: String,
        column: String,
        #[serde(rename = "type")]
        data_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
        #[serde(default = "default_true")]
        nullable: bool,
    },
    /// Ensure an index exists.
    CreateIndex {
        name: String,
        table: String,
        columns: Vec<String>,
        #[serde(default)]
        unique: bool,
    },
    /// Ensure a table exists.
    CreateTable { table: String, columns: Vec<ColumnDef> },
    /// A raw statement, with an optional probe that says it already ran.
    Sql {
        sql: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        probe: Option<SchemaObject>,
    },
}

impl SchemaStep {
    /// Validate identifiers and fragments.
    pub fn validate(&self) -> Result<()> {
        match self {
            SchemaStep::AddColumn {
                table,
                column,
                data_type,
                default,
                ..
            } => {
                validate_identifier(table)?;
                validate_identifier(column)?;
                validate_fragment("column type", data_type)?;
                if let Some(default) = default {
                    validate_fragment("column default", default)?;
                }
                Ok(())
            }
            SchemaStep::CreateIndex {
                name,
                table,
                columns,
                ..
            } => {
                validate_identifier(name)?;
                validate_identifier(table)?;
                if columns.is_empty() {
                    return Err(ReconcileError::Config(format!(
                        "index '{}' has no columns",
                        name
                    )));
                }
                columns.iter().try_for_each(|c| validate_identifier(c))
            }
            SchemaStep::CreateTable { table, columns } => {
                validate_identifier(table)?;
                if columns.is_empty() {
                    return Err(ReconcileError::Config(format!(
                        "table '{}' has no columns",
                        table
                    )));
                }
                columns.iter().try_for_each(ColumnDef::validate)
            }
            SchemaStep::Sql { sql, probe } => {
                validate_fragment("sql step", raw_statement(sql))?;
                if let Some(probe) = probe {
                    probe.validate()?;
                }
                Ok(())
            }
        }
    }

    /// The object this step creates, used as its existence probe.
    pub fn object(&self) -> Option<SchemaObject> {
        match self {
            SchemaStep::AddColumn { table, column, .. } => Some(SchemaObject::Column {
                table: table.clone(),
                column: column.clone(),
            }),
            SchemaStep::CreateIndex { name, .. } => Some(SchemaObject::Index { name: name.clone() }),
            SchemaStep::CreateTable { table, .. } => Some(SchemaObject::Table {
                table: table.clone(),
            }),
            SchemaStep::Sql { probe, .. } => probe.clone(),
        }
    }

    /// Table whose lock the step needs, if known.
    pub fn table(&self) -> Option<&str> {
        match self {
            SchemaStep::AddColumn { table, .. }
            | SchemaStep::CreateIndex { table, .. }
            | SchemaStep::CreateTable { table, .. } => Some(table),
            SchemaStep::Sql { probe, .. } => probe.as_ref().and_then(SchemaObject::table),
        }
    }

    /// Render the statement. Generated DDL is itself guarded with `IF NOT EXISTS`.
    pub fn to_sql(&self, schema: Option<&str>) -> Result<String> {
        match self {
            SchemaStep::AddColumn {
                table,
                column,
                data_type,
                default,
                nullable,
            } => {
                let mut sql = format!(
                    "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                    qualify_pg(schema, table)?,
                    quote_pg(column)?,
                    data_type
                );
                if let Some(default) = default {
                    sql.push_str(" DEFAULT ");
                    sql.push_str(default);
                }
                if !nullable {
                    sql.push_str(" NOT NULL");
                }
                Ok(sql)
            }
            SchemaStep::CreateIndex {
                name,
                table,
                columns,
                unique,
            } => {
                let columns = columns
                    .iter()
                    .map(|c| quote_pg(c))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!(
                    "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                    if *unique { "UNIQUE " } else { "" },
                    quote_pg(name)?,
                    qualify_pg(schema, table)?,
                    columns.join(", ")
                ))
            }
            SchemaStep::CreateTable { table, columns } => {
                let columns = columns
                    .iter()
                    .map(ColumnDef::to_sql)
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!(
                    "CREATE TABLE IF NOT EXISTS {} ({})",
                    qualify_pg(schema, table)?,
                    columns.join(", ")
                ))
            }
            SchemaStep::Sql { sql, .. } => Ok(raw_statement(sql).to_string()),
        }
    }
}

/// A raw statement with any trailing terminator removed.
fn raw_statement(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

impl fmt::Display for SchemaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaStep::AddColumn { table, column, .. } => {
                write!(f, "add column {}.{}", table, column)
            }
            SchemaStep::CreateIndex { name, table, .. } => {
                write!(f, "create index {} on {}", name, table)
            }
            SchemaStep::CreateTable { table, .. } => write!(f, "create table {}", table),
            SchemaStep::Sql { sql, .. } => {
                let sql = raw_statement(sql);
                if sql.chars().count() > 60 {
                    let head: String = sql.chars().take(57).collect();
                    write!(f, "sql: {}...", head)
                } else {
                    write!(f, "sql: {}", sql)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face_descriptor() -> SchemaStep {
        SchemaStep::AddColumn {
            table: "users".into(),
            column: "faceDescriptor".into(),
            data_type: "TEXT".into(),
            default: None,
            nullable: true,
        }
    }

    #[test]
    fn test_add_column_sql() {
        assert_eq!(
            face_descriptor().to_sql(None).unwrap(),
            "ALTER TABLE \"users\" ADD COLUMN IF NOT EXISTS \"faceDescriptor\" TEXT"
        );

        let attempts = SchemaStep::AddColumn {
            table: "users".into(),
            column: "failedFaceAttempts".into(),
            data_type: "INTEGER".into(),
            default: Some("0".into()),
            nullable: false,
        };
        assert_eq!(
            attempts.to_sql(Some("public")).unwrap(),
            "ALTER TABLE \"public\".\"users\" ADD COLUMN IF NOT EXISTS \"failedFaceAttempts\" INTEGER DEFAULT 0 NOT NULL"
        );
    }

    #[test]
    fn test_create_index_and_table_sql() {
        let index = SchemaStep::CreateIndex {
            name: "weekly_user_week".into(),
            table: "weekly_submissions".into(),
            columns: vec!["userId".into(), "weekStartDate".into()],
            unique: true,
        };
        assert_eq!(
            index.to_sql(None).unwrap(),
            "CREATE UNIQUE INDEX IF NOT EXISTS \"weekly_user_week\" ON \"weekly_submissions\" (\"userId\", \"weekStartDate\")"
        );

        let table = SchemaStep::CreateTable {
            table: "audit_log".into(),
            columns: vec![
                ColumnDef {
                    name: "id".into(),
                    data_type: "BIGSERIAL".into(),
                    default: None,
                    nullable: false,
                    primary_key: true,
                },
                ColumnDef {
                    name: "note".into(),
                    data_type: "TEXT".into(),
                    default: None,
                    nullable: true,
                    primary_key: false,
                },
            ],
        };
        assert_eq!(
            table.to_sql(None).unwrap(),
            "CREATE TABLE IF NOT EXISTS \"audit_log\" (\"id\" BIGSERIAL NOT NULL PRIMARY KEY, \"note\" TEXT)"
        );
    }

    #[test]
    fn test_object_probe() {
        assert_eq!(
            face_descriptor().object(),
            Some(SchemaObject::Column {
                table: "users".into(),
                column: "faceDescriptor".into()
            })
        );
        let raw = SchemaStep::Sql {
            sql: "UPDATE users SET x = 1".into(),
            probe: None,
        };
        assert_eq!(raw.object(), None);
        assert_eq!(raw.table(), None);
    }

    #[test]
    fn test_raw_sql_strips_terminator() {
        let raw = SchemaStep::Sql {
            sql: "ALTER TABLE users ADD COLUMN IF NOT EXISTS x TEXT;  ".into(),
            probe: None,
        };
        assert!(raw.validate().is_ok());
        assert_eq!(
            raw.to_sql(None).unwrap(),
            "ALTER TABLE users ADD COLUMN IF NOT EXISTS x TEXT"
        );

        let chained = SchemaStep::Sql {
            sql: "SELECT 1; DROP TABLE users".into(),
            probe: None,
        };
        assert!(chained.validate().is_err());
    }

    #[test]
    fn test_yaml_shape() {
        let yaml = r#"
- add_column:
    table: users
    column: lockoutUntil
    type: TIMESTAMP(3)
- sql:
    sql: CREATE EXTENSION IF NOT EXISTS pgcrypto
    probe:
      kind: table
      table: users
"#;
        let steps: Vec<SchemaStep> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].to_string(), "add column users.lockoutUntil");
        assert!(matches!(&steps[0], SchemaStep::AddColumn { nullable: true, .. }));
        assert_eq!(
            steps[1].object(),
            Some(SchemaObject::Table {
                table: "users".into()
            })
        );
    }
}
