//! Error types for reconciliation jobs.

use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Exit code for configuration errors (invalid YAML, unknown job, bad identifiers).
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code when the store cannot be reached at all.
pub const EXIT_CONNECTION_ERROR: u8 = 2;
/// Exit code for a fatal store error outside of item/step isolation.
pub const EXIT_STORE_ERROR: u8 = 3;
/// Exit code for a job interrupted by SIGINT/SIGTERM.
pub const EXIT_CANCELLED: u8 = 4;
/// Exit code for file system errors (missing config file, etc.).
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for reconciliation operations.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The store could not be reached.
    #[error("Store unreachable: {0}")]
    Connection(String),

    /// Error reported by PostgreSQL or the wire protocol.
    #[error("Store error: {0}")]
    Store(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Lock or statement wait exceeded the bounded timeout.
    #[error("Lock wait exceeded: {0}")]
    LockTimeout(String),

    /// A unique constraint rejected a write.
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// The schema object a statement creates already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A statement was rejected for a reason other than locking or uniqueness.
    #[error("Statement failed: {0}")]
    Statement(String),

    /// A column type the record decoder does not understand.
    #[error("Unsupported type '{type_name}' for column {column}")]
    UnsupportedType { column: String, type_name: String },

    /// No job with this name is configured for the operation.
    #[error("No {operation} job named '{name}' in configuration")]
    UnknownJob { operation: String, name: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Job was cancelled (SIGINT, etc.)
    #[error("Job cancelled")]
    Cancelled,
}

/// Coarse classification used to decide between isolating and aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The store is gone; nothing else in the job can succeed.
    Connectivity,
    /// Bounded lock/statement wait expired.
    LockTimeout,
    /// Unique constraint collision.
    UniqueViolation,
    /// The object being created is already there.
    AlreadyExists,
    /// Anything else.
    Other,
}

impl ReconcileError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        ReconcileError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create an UnknownJob error.
    pub fn unknown_job(operation: impl Into<String>, name: impl Into<String>) -> Self {
        ReconcileError::UnknownJob {
            operation: operation.into(),
            name: name.into(),
        }
    }

    /// Classify this error for the isolation policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::Connection(_) | ReconcileError::Pool { .. } => ErrorClass::Connectivity,
            ReconcileError::LockTimeout(_) => ErrorClass::LockTimeout,
            ReconcileError::UniqueViolation(_) => ErrorClass::UniqueViolation,
            ReconcileError::AlreadyExists(_) => ErrorClass::AlreadyExists,
            ReconcileError::Store(e) => classify_pg(e),
            _ => ErrorClass::Other,
        }
    }

    /// True when the error means the store itself is unusable.
    ///
    /// Only these errors escape item/step isolation and abort a job.
    pub fn is_connectivity(&self) -> bool {
        self.class() == ErrorClass::Connectivity
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            ReconcileError::Config(_)
            | ReconcileError::UnknownJob { .. }
            | ReconcileError::Yaml(_)
            | ReconcileError::Json(_) => EXIT_CONFIG_ERROR,
            ReconcileError::Io(_) => EXIT_IO_ERROR,
            ReconcileError::Cancelled => EXIT_CANCELLED,
            other if other.is_connectivity() => EXIT_CONNECTION_ERROR,
            _ => EXIT_STORE_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Map a driver error onto an [`ErrorClass`] by SQLSTATE.
fn classify_pg(err: &tokio_postgres::Error) -> ErrorClass {
    if err.is_closed() {
        return ErrorClass::Connectivity;
    }

    match err.code() {
        Some(code) => classify_sqlstate(code),
        None => {
            // Client-side failures without a SQLSTATE: socket errors mean the
            // server is gone, decode errors do not.
            let io_failure = std::error::Error::source(err)
                .map(|src| src.is::<std::io::Error>())
                .unwrap_or(false);
            if io_failure {
                ErrorClass::Connectivity
            } else {
                ErrorClass::Other
            }
        }
    }
}

/// Classify a SQLSTATE code.
pub fn classify_sqlstate(code: &SqlState) -> ErrorClass {
    if *code == SqlState::LOCK_NOT_AVAILABLE || *code == SqlState::QUERY_CANCELED {
        ErrorClass::LockTimeout
    } else if *code == SqlState::UNIQUE_VIOLATION {
        ErrorClass::UniqueViolation
    } else if *code == SqlState::DUPLICATE_COLUMN
        || *code == SqlState::DUPLICATE_TABLE
        || *code == SqlState::DUPLICATE_OBJECT
    {
        ErrorClass::AlreadyExists
    } else if code.code().starts_with("08")
        || *code == SqlState::ADMIN_SHUTDOWN
        || *code == SqlState::CRASH_SHUTDOWN
        || *code == SqlState::CANNOT_CONNECT_NOW
    {
        ErrorClass::Connectivity
    } else {
        ErrorClass::Other
    }
}

/// Result type alias for reconciliation operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;
