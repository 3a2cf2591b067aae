//! Classification of raw driver errors.
//!
//! Each engine reports failures differently: PostgreSQL and MySQL expose a
//! SQLSTATE, SQL Server a numeric error number, SQLite mostly just text.
//! [`classify`] folds all of them into one [`ErrorKind`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error category used for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ForeignKeyViolation,
    PermissionDenied,
    TableNotFound,
    Transient,
    /// Not a query error: the endpoint could not be reached or authenticated.
    Connection,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ForeignKeyViolation => "foreign_key_violation",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::TableNotFound => "table_not_found",
            ErrorKind::Transient => "transient",
            ErrorKind::Connection => "connection",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an error from its message and optional SQLSTATE or vendor code.
///
/// Codes win over text when they are conclusive. Anything that matches
/// neither falls back to [`ErrorKind::Unknown`].
pub fn classify(message: &str, code: Option<&str>) -> ErrorKind {
    if let Some(kind) = code.and_then(classify_code) {
        return kind;
    }
    classify_message(message)
}

fn classify_code(code: &str) -> Option<ErrorKind> {
    let code = code.trim();
    match code {
        // SQLSTATE
        "23503" => Some(ErrorKind::ForeignKeyViolation),
        "42501" | "28000" | "28P01" => Some(ErrorKind::PermissionDenied),
        "42P01" | "42S02" => Some(ErrorKind::TableNotFound),
        "40001" | "40P01" | "57P01" | "57P02" | "57P03" | "57014" | "HYT00" | "HYT01" => {
            Some(ErrorKind::Transient)
        }
        c if c.len() == 5 && c.starts_with("08") => Some(ErrorKind::Transient),
        // MySQL vendor numbers
        "1451" | "1452" | "1216" | "1217" => Some(ErrorKind::ForeignKeyViolation),
        "1044" | "1045" | "1142" | "1143" | "1227" => Some(ErrorKind::PermissionDenied),
        "1146" => Some(ErrorKind::TableNotFound),
        "1205" | "1213" | "2006" | "2013" | "1040" | "1053" => Some(ErrorKind::Transient),
        // SQL Server error numbers
        "547" => Some(ErrorKind::ForeignKeyViolation),
        "229" | "230" | "262" | "297" | "18456" => Some(ErrorKind::PermissionDenied),
        "208" | "3701" => Some(ErrorKind::TableNotFound),
        "-2" | "1222" | "10053" | "10054" | "40197" | "40501" | "40613" | "49918" => {
            Some(ErrorKind::Transient)
        }
        // SQLite extended codes
        "787" | "1811" => Some(ErrorKind::ForeignKeyViolation),
        "5" | "6" | "261" | "517" => Some(ErrorKind::Transient),
        "23" => Some(ErrorKind::PermissionDenied),
        _ => None,
    }
}

fn classify_message(message: &str) -> ErrorKind {
    let msg = message.to_lowercase();

    const FK: &[&str] = &[
        "foreign key constraint",
        "violates foreign key",
        "conflicted with the foreign key",
        "conflicted with the reference constraint",
        "a foreign key constraint fails",
    ];
    const PERMISSION: &[&str] = &[
        "permission denied",
        "access denied",
        "command denied",
        "not authorized",
        "login failed",
        "insufficient privilege",
    ];
    const MISSING: &[&str] = &[
        "no such table",
        "doesn't exist",
        "does not exist",
        "invalid object name",
        "unknown table",
    ];
    const TRANSIENT: &[&str] = &[
        "timeout",
        "timed out",
        "deadlock",
        "connection reset",
        "connection refused",
        "connection closed",
        "broken pipe",
        "server has gone away",
        "lost connection",
        "database is locked",
        "database table is locked",
        "try restarting transaction",
        "could not serialize access",
    ];

    let hit = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

    if hit(FK) {
        ErrorKind::ForeignKeyViolation
    } else if hit(PERMISSION) {
        ErrorKind::PermissionDenied
    } else if hit(MISSING) && (msg.contains("table") || msg.contains("relation") || msg.contains("object")) {
        ErrorKind::TableNotFound
    } else if hit(TRANSIENT) {
        ErrorKind::Transient
    } else {
        ErrorKind::Unknown
    }
}
