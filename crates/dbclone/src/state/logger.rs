//! The outbound event stream.
//!
//! Jobs report progress through a [`SyncLogger`] at fixed checkpoints. It is
//! the only channel through which a UI or audit layer sees a run.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

/// Severity of a sync event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Success => "success",
            LogLevel::Debug => "debug",
        }
    }
}

/// Checkpoint at which an event is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEvent {
    PhaseStarted,
    TableStarted,
    TableCompleted,
    TableFailed,
    TableEmptied,
    BatchStarted,
    BatchCompleted,
    BatchFailed,
    BatchCancelled,
}

impl SyncEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncEvent::PhaseStarted => "phase_started",
            SyncEvent::TableStarted => "table_started",
            SyncEvent::TableCompleted => "table_completed",
            SyncEvent::TableFailed => "table_failed",
            SyncEvent::TableEmptied => "table_emptied",
            SyncEvent::BatchStarted => "batch_started",
            SyncEvent::BatchCompleted => "batch_completed",
            SyncEvent::BatchFailed => "batch_failed",
            SyncEvent::BatchCancelled => "batch_cancelled",
        }
    }
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives sync events. Implementations must be cheap and non-blocking.
pub trait SyncLogger: Send + Sync {
    fn log(&self, level: LogLevel, event: SyncEvent, message: &str, data: Map<String, Value>);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl SyncLogger for TracingLogger {
    fn log(&self, level: LogLevel, event: SyncEvent, message: &str, data: Map<String, Value>) {
        let data = Value::Object(data);
        match level {
            LogLevel::Info | LogLevel::Success => info!(event = %event, data = %data, "{}", message),
            LogLevel::Warning => warn!(event = %event, data = %data, "{}", message),
            LogLevel::Error => error!(event = %event, data = %data, "{}", message),
            LogLevel::Debug => debug!(event = %event, data = %data, "{}", message),
        }
    }
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub event: SyncEvent,
    pub message: String,
    pub data: Map<String, Value>,
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Entries for one event type, in emission order.
    pub fn events(&self, event: SyncEvent) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.event == event)
            .collect()
    }

    /// The `table` field of every entry of `event`.
    pub fn tables(&self, event: SyncEvent) -> Vec<String> {
        self.events(event)
            .iter()
            .filter_map(|e| e.data.get("table").and_then(Value::as_str).map(String::from))
            .collect()
    }
}

impl SyncLogger for MemoryLogger {
    fn log(&self, level: LogLevel, event: SyncEvent, message: &str, data: Map<String, Value>) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(LogEntry {
                at: Utc::now(),
                level,
                event,
                message: message.to_string(),
                data,
            });
    }
}

/// Build an event payload from key/value pairs.
pub fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_logger_filters_by_event() {
        let logger = MemoryLogger::new();
        logger.log(
            LogLevel::Info,
            SyncEvent::TableStarted,
            "users",
            fields([("table", json!("users"))]),
        );
        logger.log(
            LogLevel::Success,
            SyncEvent::TableCompleted,
            "users",
            fields([("table", json!("users")), ("rows", json!(3))]),
        );
        assert_eq!(logger.entries().len(), 2);
        assert_eq!(logger.tables(SyncEvent::TableCompleted), vec!["users"]);
        assert_eq!(logger.events(SyncEvent::TableCompleted)[0].data["rows"], json!(3));
        assert!(logger.events(SyncEvent::TableFailed).is_empty());
    }

    #[test]
    fn test_event_names() {
        assert_eq!(SyncEvent::TableEmptied.as_str(), "table_emptied");
        assert_eq!(
            serde_json::to_string(&SyncEvent::BatchCancelled).unwrap(),
            "\"batch_cancelled\""
        );
        assert_eq!(LogLevel::Warning.as_str(), "warning");
    }
}
