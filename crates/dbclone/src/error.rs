//! Error types for the clone engine.
//!
//! Driver errors are classified as they are converted, so every
//! [`CloneError::Query`] carries an [`ErrorKind`] that the orchestrator
//! uses to decide between retrying and failing the job.

use thiserror::Error;

use crate::classify::{classify, ErrorKind};

/// Main error type for clone operations.
#[derive(Error, Debug)]
pub enum CloneError {
    /// Configuration error (invalid YAML, missing fields, bad options).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A connection could not be established or authenticated.
    #[error("Connection error on '{connection}': {message}")]
    Connection { connection: String, message: String },

    /// A statement failed on an open connection.
    #[error("Query error ({kind}): {message}")]
    Query {
        kind: ErrorKind,
        message: String,
        code: Option<String>,
    },

    /// The dialect cannot perform the requested DDL.
    #[error("{operation} is unsupported by {dialect} - table must be recreated")]
    Unsupported {
        dialect: &'static str,
        operation: &'static str,
    },

    /// A schema or option failed validation before any SQL was generated.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Data transfer failed for a specific table.
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// A job exceeded its time budget.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// IO error (file operations).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The batch was cancelled.
    #[error("Batch cancelled")]
    Cancelled,
}

impl CloneError {
    /// Create a Connection error for a named endpoint.
    pub fn connection(connection: impl Into<String>, message: impl Into<String>) -> Self {
        CloneError::Connection {
            connection: connection.into(),
            message: message.into(),
        }
    }

    /// Create a Query error, classifying it from its message and SQLSTATE/vendor code.
    pub fn query(message: impl Into<String>, code: Option<String>) -> Self {
        let message = message.into();
        let kind = classify(&message, code.as_deref());
        CloneError::Query {
            kind,
            message,
            code,
        }
    }

    /// Create a Transfer error.
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        CloneError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create an Unsupported error.
    pub fn unsupported(dialect: &'static str, operation: &'static str) -> Self {
        CloneError::Unsupported { dialect, operation }
    }

    /// The classification that drives retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CloneError::Connection { .. } => ErrorKind::Connection,
            CloneError::Query { kind, .. } => *kind,
            CloneError::Timeout(_) => ErrorKind::Transient,
            _ => ErrorKind::Unknown,
        }
    }

    /// Whether the job's retry budget may be spent on this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Connection)
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            CloneError::Config(_) | CloneError::Yaml(_) | CloneError::Validation(_) => 2,
            CloneError::Connection { .. } => 3,
            CloneError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain.
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

impl From<sqlx::Error> for CloneError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                CloneError::query(db.message().to_string(), db.code().map(|c| c.into_owned()))
            }
            sqlx::Error::PoolTimedOut => CloneError::Query {
                kind: ErrorKind::Transient,
                message: err.to_string(),
                code: None,
            },
            sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
                CloneError::Query {
                    kind: ErrorKind::Transient,
                    message: err.to_string(),
                    code: None,
                }
            }
            sqlx::Error::Configuration(_) | sqlx::Error::Tls(_) => {
                CloneError::connection("sqlx", err.to_string())
            }
            _ => CloneError::query(err.to_string(), None),
        }
    }
}

impl From<tokio_postgres::Error> for CloneError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db) = err.as_db_error() {
            return CloneError::query(db.message().to_string(), Some(db.code().code().to_string()));
        }
        if err.is_closed() {
            return CloneError::Query {
                kind: ErrorKind::Transient,
                message: err.to_string(),
                code: None,
            };
        }
        CloneError::query(err.to_string(), None)
    }
}

impl From<tiberius::error::Error> for CloneError {
    fn from(err: tiberius::error::Error) -> Self {
        match &err {
            tiberius::error::Error::Server(token) => {
                CloneError::query(token.message().to_string(), Some(token.code().to_string()))
            }
            tiberius::error::Error::Io { .. } => CloneError::Query {
                kind: ErrorKind::Transient,
                message: err.to_string(),
                code: None,
            },
            _ => CloneError::query(err.to_string(), None),
        }
    }
}

impl From<deadpool_postgres::PoolError> for CloneError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        CloneError::connection("postgres", err.to_string())
    }
}

impl From<bb8::RunError<tiberius::error::Error>> for CloneError {
    fn from(err: bb8::RunError<tiberius::error::Error>) -> Self {
        match err {
            bb8::RunError::User(e) => CloneError::from(e),
            bb8::RunError::TimedOut => {
                CloneError::connection("sqlserver", "timed out waiting for a pooled connection")
            }
        }
    }
}

/// Result type alias for clone operations.
pub type Result<T> = std::result::Result<T, CloneError>;
