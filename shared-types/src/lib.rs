//! Shared types between the overseer and the log dashboard
//!
//! These types are used by both:
//! - the overseer control process (native Rust)
//! - the browser dashboard (TypeScript bindings generated by ts-rs)
//!
//! Serializable with serde for JSON over WebSocket/HTTP

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use ts_rs::TS;

// ============================================================================
// Log Records
// ============================================================================

/// Severity of a worker log line.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export_to = "protocol.ts")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warning,
        LogLevel::Error,
        LogLevel::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }

    /// ERROR and CRITICAL.
    pub fn is_error(&self) -> bool {
        matches!(self, LogLevel::Error | LogLevel::Critical)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLevel(pub String);

impl fmt::Display for UnknownLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown log level '{}'", self.0)
    }
}

impl std::error::Error for UnknownLevel {}

impl FromStr for LogLevel {
    type Err = UnknownLevel;

    /// Case-insensitive, accepting the aliases common logging libraries emit.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" | "TRACE" => Ok(LogLevel::Debug),
            "INFO" | "SUCCESS" => Ok(LogLevel::Info),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" | "FATAL" => Ok(LogLevel::Critical),
            _ => Err(UnknownLevel(s.to_string())),
        }
    }
}

/// Coarse classification of a log line, derived from its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export_to = "protocol.ts")]
pub enum LogCategory {
    Heartbeat,
    UserMessage,
    BotReply,
    ManualMode,
    System,
    Error,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Heartbeat => "heartbeat",
            LogCategory::UserMessage => "user_message",
            LogCategory::BotReply => "bot_reply",
            LogCategory::ManualMode => "manual_mode",
            LogCategory::System => "system",
            LogCategory::Error => "error",
        }
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogCategory {
    type Err = std::convert::Infallible;

    /// Unrecognized names map to `System`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "heartbeat" => LogCategory::Heartbeat,
            "user_message" => LogCategory::UserMessage,
            "bot_reply" => LogCategory::BotReply,
            "manual_mode" => LogCategory::ManualMode,
            "error" => LogCategory::Error,
            _ => LogCategory::System,
        })
    }
}

/// One ingested worker log line. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export_to = "protocol.ts")]
pub struct LogRecord {
    /// Global ingestion order (strictly increasing, starts at 1)
    #[ts(type = "number")]
    pub sequence: u64,

    pub timestamp: DateTime<Utc>,

    pub level: LogLevel,

    pub category: LogCategory,

    pub message: String,
}

/// Set of accepted levels for a viewer. An empty set accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LevelFilter(BTreeSet<LogLevel>);

impl LevelFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn accepts(&self, level: LogLevel) -> bool {
        self.0.is_empty() || self.0.contains(&level)
    }

    pub fn levels(&self) -> Vec<LogLevel> {
        self.0.iter().copied().collect()
    }

    /// Parse a comma separated list such as `INFO,error`. Unknown names are skipped.
    pub fn parse_csv(raw: &str) -> Self {
        raw.split(',')
            .filter_map(|part| part.parse::<LogLevel>().ok())
            .collect()
    }
}

impl FromIterator<LogLevel> for LevelFilter {
    fn from_iter<T: IntoIterator<Item = LogLevel>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ============================================================================
// Process Status
// ============================================================================

/// Lifecycle state of the supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export_to = "protocol.ts")]
pub enum ProcessState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
        })
    }
}

/// Snapshot of the worker process as last observed by the supervisor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export_to = "protocol.ts")]
pub struct ProcessStatus {
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub cpu_percent: f32,
    #[ts(type = "number")]
    pub memory_bytes: u64,
    pub last_exit_code: Option<i32>,
}

impl ProcessStatus {
    pub fn uptime_seconds(&self, now: DateTime<Utc>) -> Option<u64> {
        let started_at = self.started_at?;
        Some((now - started_at).num_seconds().max(0) as u64)
    }
}

// ============================================================================
// Viewer Protocol
// ============================================================================

/// Messages sent from the overseer to a connected viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export_to = "protocol.ts")]
pub enum ViewerEvent {
    Connected {
        session_id: String,
    },
    NewLog(LogRecord),
    StatusUpdate {
        state: ProcessState,
        pid: Option<u32>,
        cpu_percent: f32,
        #[ts(type = "number")]
        memory_bytes: u64,
        #[ts(type = "number | null")]
        uptime_seconds: Option<u64>,
        last_exit_code: Option<i32>,
    },
    HistoryLoaded {
        count: usize,
    },
    Dropped {
        #[ts(type = "number")]
        count: u64,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ViewerEvent {
    pub fn status_update(status: &ProcessStatus, now: DateTime<Utc>) -> Self {
        ViewerEvent::StatusUpdate {
            state: status.state,
            pid: status.pid,
            cpu_percent: status.cpu_percent,
            memory_bytes: status.memory_bytes,
            uptime_seconds: status.uptime_seconds(now),
            last_exit_code: status.last_exit_code,
        }
    }
}

/// Commands a viewer may send over its connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export_to = "protocol.ts")]
pub enum ViewerCommand {
    RequestHistory { lines_count: usize },
    SetFilters { levels: Vec<LogLevel> },
    Pause,
    Resume,
    Ping,
}

// ============================================================================
// Tests
// ============================================================================
