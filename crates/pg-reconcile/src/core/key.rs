//! Logical keys: typed projections that decide "same logical entity".

use std::fmt;

use serde::{Deserialize, Serialize};

use super::record::{FieldValue, Record};

/// Text normalization applied to a key component before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalize {
    /// Strip leading and trailing whitespace.
    Trim,
    /// Compare case-insensitively.
    Lowercase,
}

impl Normalize {
    /// Apply to a text value.
    pub fn apply(self, value: &str) -> String {
        match self {
            Normalize::Trim => value.trim().to_string(),
            Normalize::Lowercase => value.to_lowercase(),
        }
    }
}

/// One component of a [`KeyRule`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyField {
    /// Column to project.
    pub column: String,
    /// Normalizations, applied in order, to text values.
    pub normalize: Vec<Normalize>,
}

impl KeyField {
    /// A component compared exactly.
    pub fn exact(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            normalize: Vec::new(),
        }
    }

    /// A component with text normalization.
    pub fn normalized(column: impl Into<String>, normalize: Vec<Normalize>) -> Self {
        Self {
            column: column.into(),
            normalize,
        }
    }

    fn project(&self, record: &Record) -> Result<FieldValue, KeyError> {
        let value = record
            .field(&self.column)
            .ok_or_else(|| KeyError::MissingColumn(self.column.clone()))?;

        match value {
            FieldValue::Null => Err(KeyError::NullComponent(self.column.clone())),
            FieldValue::Text(text) if !self.normalize.is_empty() => {
                let normalized = self
                    .normalize
                    .iter()
                    .fold(text.clone(), |acc, n| n.apply(&acc));
                Ok(FieldValue::Text(normalized))
            }
            other => Ok(other.clone()),
        }
    }
}

/// Ordered list of key components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRule {
    fields: Vec<KeyField>,
}

impl KeyRule {
    /// Create a rule from its components.
    pub fn new(fields: Vec<KeyField>) -> Self {
        Self { fields }
    }

    /// Create a rule of exact-match columns.
    pub fn columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(columns.into_iter().map(KeyField::exact).collect())
    }

    /// The components of this rule.
    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    /// Column names the rule reads, for building the fetch.
    pub fn column_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.column.clone()).collect()
    }

    /// Project a record onto its logical key.
    ///
    /// A NULL component is an error, not a key: two rows with an unknown
    /// owner are not known to be the same entity.
    pub fn extract(&self, record: &Record) -> Result<LogicalKey, KeyError> {
        self.fields
            .iter()
            .map(|f| f.project(record))
            .collect::<Result<Vec<_>, _>>()
            .map(LogicalKey)
    }
}

/// Why a record has no logical key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The record was fetched without this column.
    MissingColumn(String),
    /// The column is NULL on this record.
    NullComponent(String),
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyError::MissingColumn(c) => write!(f, "key column '{}' missing from record", c),
            KeyError::NullComponent(c) => write!(f, "key column '{}' is NULL", c),
        }
    }
}

/// Typed tuple identifying a logical entity.
///
/// Equality and hashing are structural over the typed components, so
/// `Int(1)` and `Text("1")` are different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LogicalKey(pub Vec<FieldValue>);

impl LogicalKey {
    /// The key components.
    pub fn values(&self) -> &[FieldValue] {
        &self.0
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(id: i64, user: &str, week: &str) -> Record {
        Record::new(id)
            .with_field("userId", FieldValue::text(user))
            .with_field("weekStartDate", FieldValue::text(week))
    }

    #[test]
    fn test_extract_composite_key() {
        let rule = KeyRule::columns(["userId", "weekStartDate"]);
        let key = rule.extract(&submission(1, "u1", "2025-12-01")).unwrap();
        assert_eq!(
            key,
            LogicalKey(vec![FieldValue::text("u1"), FieldValue::text("2025-12-01")])
        );
        assert_eq!(key.to_string(), "(u1, 2025-12-01)");
    }

    #[test]
    fn test_null_component_is_an_error() {
        let rule = KeyRule::columns(["userId"]);
        let record = Record::new(1).with_field("userId", FieldValue::Null);
        assert_eq!(
            rule.extract(&record),
            Err(KeyError::NullComponent("userId".into()))
        );
    }

    #[test]
    fn test_missing_column_is_an_error() {
        let rule = KeyRule::columns(["mobile"]);
        assert_eq!(
            rule.extract(&Record::new(1)),
            Err(KeyError::MissingColumn("mobile".into()))
        );
    }

    #[test]
    fn test_normalization_applies_in_order() {
        let rule = KeyRule::new(vec![KeyField::normalized(
            "name",
            vec![Normalize::Trim, Normalize::Lowercase],
        )]);
        let a = Record::new(1).with_field("name", FieldValue::text("  Bhakti Gandhi "));
        let b = Record::new(2).with_field("name", FieldValue::text("bhakti gandhi"));
        assert_eq!(rule.extract(&a).unwrap(), rule.extract(&b).unwrap());
    }

    #[test]
    fn test_typed_components_do_not_collide() {
        let rule = KeyRule::columns(["amount"]);
        let a = Record::new(1).with_field("amount", FieldValue::Int(1));
        let b = Record::new(2).with_field("amount", FieldValue::text("1"));
        assert_ne!(rule.extract(&a).unwrap(), rule.extract(&b).unwrap());
    }
}
