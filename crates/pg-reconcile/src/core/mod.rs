//! Core data model shared by the store and the engines.
//!
//! - [`record`]: record identity and typed field values
//! - [`key`]: logical keys and the rules that extract them
//! - [`selector`]: table references and record-set selectors
//! - [`pattern`]: rename patterns
//! - [`schema`]: additive schema steps
//! - [`identifier`]: identifier validation and quoting

pub mod identifier;
pub mod key;
pub mod pattern;
pub mod record;
pub mod schema;
pub mod selector;

pub use key::{KeyError, KeyField, KeyRule, LogicalKey, Normalize};
pub use pattern::{MatchMode, RenamePattern};
pub use record::{FieldValue, Record, RecordId};
pub use schema::{ColumnDef, SchemaObject, SchemaStep};
pub use selector::{Condition, RecordSet, TableRef};
