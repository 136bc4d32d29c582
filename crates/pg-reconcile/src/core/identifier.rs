//! Identifier validation and quoting for dynamically built statements.
//!
//! Table and column names come from the job configuration and cannot be bound
//! as statement parameters, so every identifier that reaches SQL text goes
//! through [`quote_pg`]. Free-form fragments an operator writes into the
//! configuration (column types, defaults, record filters) go through
//! [`validate_fragment`] so that one fragment can never smuggle a second
//! statement into a job.

use crate::error::{ReconcileError, Result};

/// PostgreSQL truncates identifiers beyond NAMEDATALEN - 1 bytes.
const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Validate an identifier.
///
/// Rejects empty names, names containing NUL bytes, and names longer than
/// PostgreSQL would keep without silent truncation.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ReconcileError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(ReconcileError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(ReconcileError::Config(format!(
            "Identifier exceeds {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier.
///
/// ```ignore
/// assert_eq!(quote_pg("users")?, "\"users\"");
/// assert_eq!(quote_pg("faceDescriptor")?, "\"faceDescriptor\"");
/// ```
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Qualify a table name, with the schema when one is configured.
///
/// Without a schema the name resolves through the session `search_path`.
pub fn qualify_pg(schema: Option<&str>, table: &str) -> Result<String> {
    match schema {
        Some(schema) => Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(table)?)),
        None => quote_pg(table),
    }
}

/// Validate an operator-written SQL fragment (type, default, filter).
///
/// Rejects statement separators and comment markers; everything else is
/// passed through verbatim.
pub fn validate_fragment(kind: &str, fragment: &str) -> Result<()> {
    if fragment.trim().is_empty() {
        return Err(ReconcileError::Config(format!("{} cannot be empty", kind)));
    }

    if fragment.contains(';') {
        return Err(ReconcileError::Config(format!(
            "SECURITY: {} contains a semicolon: {:?}",
            kind, fragment
        )));
    }

    if fragment.contains("--") || fragment.contains("/*") || fragment.contains("*/") {
        return Err(ReconcileError::Config(format!(
            "SECURITY: {} contains SQL comment markers: {:?}",
            kind, fragment
        )));
    }

    Ok(())
}
