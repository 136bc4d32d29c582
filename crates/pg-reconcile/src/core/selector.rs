//! Record-set selectors: which table, which columns, which rows.
//!
//! A [`RecordSet`] is a description, not a query. Each [`Store`] renders it
//! in its own way (parameterized SQL for PostgreSQL, a predicate for the
//! in-memory store).
//!
//! [`Store`]: crate::store::Store

use serde::{Deserialize, Serialize};

use super::identifier::{qualify_pg, quote_pg, validate_fragment, validate_identifier};
use super::key::Normalize;
use super::record::FieldValue;
use crate::error::Result;

/// A table and its identity column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    /// Schema name; `None` resolves through `search_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Table name.
    pub name: String,
    /// Primary key column.
    #[serde(default = "default_id_column")]
    pub id_column: String,
}

fn default_id_column() -> String {
    "id".to_string()
}

impl TableRef {
    /// Create a reference in the default schema with an `id` key column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
            id_column: default_id_column(),
        }
    }

    /// Override the key column.
    pub fn with_id_column(mut self, id_column: impl Into<String>) -> Self {
        self.id_column = id_column.into();
        self
    }

    /// Quoted, optionally schema-qualified table name.
    pub fn qualified(&self) -> Result<String> {
        qualify_pg(self.schema.as_deref(), &self.name)
    }

    /// Unquoted dotted name, suitable for `to_regclass` and log lines.
    pub fn display_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.name),
            None => self.name.clone(),
        }
    }

    /// Validate every identifier in the reference.
    pub fn validate(&self) -> Result<()> {
        if let Some(schema) = &self.schema {
            validate_identifier(schema)?;
        }
        validate_identifier(&self.name)?;
        validate_identifier(&self.id_column)
    }
}

/// Row predicate on a single column.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    IsNull(String),
    IsNotNull(String),
    /// Text column contains a substring.
    Contains { column: String, needle: String },
    /// Text column ends with a suffix.
    EndsWith { column: String, suffix: String },
    Equals { column: String, value: FieldValue },
    /// Text column equals `value` once `normalize` is applied to the column.
    /// `value` is expected to be normalized already.
    EqualsNormalized {
        column: String,
        value: String,
        normalize: Vec<Normalize>,
    },
}

impl Condition {
    /// Column this condition reads.
    pub fn column(&self) -> &str {
        match self {
            Condition::IsNull(c) | Condition::IsNotNull(c) => c,
            Condition::Contains { column, .. }
            | Condition::EndsWith { column, .. }
            | Condition::Equals { column, .. }
            | Condition::EqualsNormalized { column, .. } => column,
        }
    }

    /// Evaluate against a single value (absent columns read as NULL).
    pub fn matches(&self, value: Option<&FieldValue>) -> bool {
        let value = value.unwrap_or(&FieldValue::Null);
        match self {
            Condition::IsNull(_) => value.is_null(),
            Condition::IsNotNull(_) => !value.is_null(),
            Condition::Contains { needle, .. } => {
                value.as_text().map(|t| t.contains(needle.as_str())).unwrap_or(false)
            }
            Condition::EndsWith { suffix, .. } => {
                value.as_text().map(|t| t.ends_with(suffix.as_str())).unwrap_or(false)
            }
            Condition::Equals { value: expected, .. } => !value.is_null() && value == expected,
            Condition::EqualsNormalized {
                value: expected,
                normalize,
                ..
            } => value
                .as_text()
                .map(|t| normalize.iter().fold(t.to_string(), |acc, n| n.apply(&acc)) == *expected)
                .unwrap_or(false),
        }
    }
}

/// Description of the rows and columns a job reads.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSet {
    pub table: TableRef,
    /// Column read into [`Record::recency`](super::record::Record::recency).
    pub recency_column: Option<String>,
    /// Business columns to fetch.
    pub fields: Vec<String>,
    /// Conditions, all of which must hold.
    pub conditions: Vec<Condition>,
    /// Operator-written SQL predicate, ANDed with the conditions.
    pub filter: Option<String>,
}

impl RecordSet {
    /// Select every row of a table, fetching only the id.
    pub fn new(table: TableRef) -> Self {
        Self {
            table,
            recency_column: None,
            fields: Vec::new(),
            conditions: Vec::new(),
            filter: None,
        }
    }

    pub fn with_recency(mut self, column: impl Into<String>) -> Self {
        self.recency_column = Some(column.into());
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for field in fields {
            let field = field.into();
            if !self.fields.contains(&field) {
                self.fields.push(field);
            }
        }
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter;
        self
    }

    /// Validate identifiers and the raw filter.
    pub fn validate(&self) -> Result<()> {
        self.table.validate()?;
        if let Some(recency) = &self.recency_column {
            validate_identifier(recency)?;
        }
        for field in &self.fields {
            validate_identifier(field)?;
        }
        for condition in &self.conditions {
            validate_identifier(condition.column())?;
        }
        if let Some(filter) = &self.filter {
            validate_fragment("filter", filter)?;
        }
        Ok(())
    }

    /// Render the WHERE clause with `$n` placeholders, starting at `first_param`.
    ///
    /// Returns the clause (empty when there is nothing to filter) and the
    /// values to bind in placeholder order.
    pub fn where_clause(&self, first_param: usize) -> Result<(String, Vec<FieldValue>)> {
        let mut predicates = Vec::new();
        let mut params = Vec::new();
        let mut next = first_param;

        for condition in &self.conditions {
            let column = quote_pg(condition.column())?;
            let predicate = match condition {
                Condition::IsNull(_) => format!("{} IS NULL", column),
                Condition::IsNotNull(_) => format!("{} IS NOT NULL", column),
                Condition::Contains { needle, .. } => {
                    params.push(FieldValue::text(needle.clone()));
                    next += 1;
                    format!("strpos({}, ${}::text) > 0", column, next - 1)
                }
                Condition::EndsWith { suffix, .. } => {
                    params.push(FieldValue::text(suffix.clone()));
                    next += 1;
                    format!("right({0}, length(${1}::text)) = ${1}::text", column, next - 1)
                }
                Condition::Equals { value, .. } => {
                    params.push(value.clone());
                    next += 1;
                    format!("{} = ${}", column, next - 1)
                }
                Condition::EqualsNormalized { value, normalize, .. } => {
                    params.push(FieldValue::text(value.clone()));
                    next += 1;
                    let expr = normalize.iter().fold(format!("{}::text", column), |acc, n| match n {
                        Normalize::Trim => format!("btrim({})", acc),
                        Normalize::Lowercase => format!("lower({})", acc),
                    });
                    format!("{} = ${}::text", expr, next - 1)
                }
            };
            predicates.push(predicate);
        }

        if let Some(filter) = &self.filter {
            validate_fragment("filter", filter)?;
            predicates.push(format!("({})", filter));
        }

        if predicates.is_empty() {
            Ok((String::new(), params))
        } else {
            Ok((format!(" WHERE {}", predicates.join(" AND ")), params))
        }
    }

    /// Render the full SELECT: id, recency, then fields, in that order.
    pub fn select_sql(&self) -> Result<(String, Vec<FieldValue>)> {
        let mut columns = vec![quote_pg(&self.table.id_column)?];
        if let Some(recency) = &self.recency_column {
            columns.push(quote_pg(recency)?);
        }
        for field in &self.fields {
            columns.push(quote_pg(field)?);
        }

        let (where_clause, params) = self.where_clause(1)?;
        let sql = format!(
            "SELECT {} FROM {}{} ORDER BY {}",
            columns.join(", "),
            self.table.qualified()?,
            where_clause,
            quote_pg(&self.table.id_column)?
        );
        Ok((sql, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_sql_with_conditions() {
        let set = RecordSet::new(TableRef::new("mailboxes"))
            .with_fields(["email"])
            .with_condition(Condition::Contains {
                column: "email".into(),
                needle: "@portal.tejaskp.com".into(),
            });
        let (sql, params) = set.select_sql().unwrap();
        assert_eq!(
            sql,
            "SELECT \"id\", \"email\" FROM \"mailboxes\" WHERE strpos(\"email\", $1::text) > 0 ORDER BY \"id\""
        );
        assert_eq!(params, vec![FieldValue::text("@portal.tejaskp.com")]);
    }

    #[test]
    fn test_where_clause_numbers_params_from_offset() {
        let set = RecordSet::new(TableRef::new("users"))
            .with_condition(Condition::IsNull("userId".into()))
            .with_condition(Condition::Equals {
                column: "mobile".into(),
                value: FieldValue::text("555"),
            })
            .with_condition(Condition::EndsWith {
                column: "email".into(),
                suffix: "@old.com".into(),
            })
            .with_filter(Some("status <> 'DRAFT'".into()));
        let (clause, params) = set.where_clause(3).unwrap();
        assert_eq!(
            clause,
            " WHERE \"userId\" IS NULL AND \"mobile\" = $3 AND right(\"email\", length($4::text)) = $4::text AND (status <> 'DRAFT')"
        );
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_select_sql_recency_and_schema() {
        let mut table = TableRef::new("weekly_submissions").with_id_column("sid");
        table.schema = Some("app".into());
        let set = RecordSet::new(table)
            .with_recency("submittedAt")
            .with_fields(["userId", "weekStartDate", "userId"]);
        let (sql, params) = set.select_sql().unwrap();
        assert_eq!(
            sql,
            "SELECT \"sid\", \"submittedAt\", \"userId\", \"weekStartDate\" FROM \"app\".\"weekly_submissions\" ORDER BY \"sid\""
        );
        assert!(params.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_filter() {
        let set = RecordSet::new(TableRef::new("users")).with_filter(Some("1=1; DROP TABLE users".into()));
        assert!(set.validate().is_err());
    }

    #[test]
    fn test_condition_matches() {
        let contains = Condition::Contains {
            column: "email".into(),
            needle: "@old.com".into(),
        };
        assert!(contains.matches(Some(&FieldValue::text("a@old.com"))));
        assert!(!contains.matches(Some(&FieldValue::Null)));
        assert!(!contains.matches(None));
        assert!(Condition::IsNull("x".into()).matches(None));

        let equals = Condition::Equals {
            column: "mobile".into(),
            value: FieldValue::text("555"),
        };
        assert!(equals.matches(Some(&FieldValue::text("555"))));
        assert!(!equals.matches(Some(&FieldValue::text("556"))));

        let normalized = Condition::EqualsNormalized {
            column: "mobile".into(),
            value: "555".into(),
            normalize: vec![Normalize::Trim],
        };
        assert!(normalized.matches(Some(&FieldValue::text(" 555 "))));
        assert!(!normalized.matches(Some(&FieldValue::text("5 55"))));
        assert!(!normalized.matches(None));
    }

    #[test]
    fn test_normalized_equality_sql() {
        let set = RecordSet::new(TableRef::new("User")).with_condition(Condition::EqualsNormalized {
            column: "email".into(),
            value: "ajay@tejaskp.com".into(),
            normalize: vec![Normalize::Trim, Normalize::Lowercase],
        });
        let (clause, params) = set.where_clause(1).unwrap();
        assert_eq!(clause, " WHERE lower(btrim(\"email\"::text)) = $1::text");
        assert_eq!(params, vec![FieldValue::text("ajay@tejaskp.com")]);
    }
}
