//! Record parser - turns raw worker log lines into [`LogRecord`]s.
//!
//! Parsing is tolerant: a line without a recognizable level defaults to INFO
//! and keeps its full text as the message. Only blank lines, `#` comments and
//! binary garbage are refused.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use shared_types::{LogCategory, LogLevel, LogRecord};

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap());

static LEADING_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}(?:[.,]\d{1,9})?)").unwrap()
});

static PIPE_LEVEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\|\s*([A-Za-z]+)\s*\|(.*)$").unwrap());

/// `[LEVEL]` only counts as the level when it opens the line (after any timestamp).
static BRACKET_LEVEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\[([A-Za-z]+)\][\s:-]*(.*)$").unwrap());

static DASHED_LEVEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*-\s*([A-Za-z]+)\s+-\s+(.*)$").unwrap());

static SPACED_LEVEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([A-Za-z]+):?\s+(.*)$").unwrap());

static COLON_LEVEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([A-Za-z]+):\s*(.*)$").unwrap());

/// loguru's `module:function:line - ` prefix in front of the message.
static LOGURU_ORIGIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w.<>-]+(?::[\w.<>-]+)*:\d+\s+-\s+").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("blank line")]
    Blank,
    #[error("comment line")]
    Comment,
    #[error("unparsable line ({0} bytes)")]
    Unparsable(usize),
}

impl ParseError {
    /// Blank and comment lines are skipped silently; only garbage is counted.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ParseError::Unparsable(_))
    }
}

/// Fields recovered from one line, before a sequence is assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub logged_at: Option<DateTime<Utc>>,
    pub level: LogLevel,
    pub category: LogCategory,
    pub message: String,
}

pub fn parse_line(raw: &str) -> Result<ParsedLine, ParseError> {
    let line = ANSI_ESCAPE.replace_all(raw, "");
    let line = line.trim();
    if line.is_empty() {
        return Err(ParseError::Blank);
    }
    if line.starts_with('#') {
        return Err(ParseError::Comment);
    }
    if looks_like_garbage(line) {
        return Err(ParseError::Unparsable(raw.len()));
    }

    let (logged_at, rest) = match LEADING_TIMESTAMP.captures(line) {
        Some(caps) => {
            let ts = caps.get(1).map_or("", |m| m.as_str());
            (parse_timestamp(ts), &line[ts.len()..])
        }
        None => (None, line),
    };

    let (level, message) = extract_level(rest, logged_at.is_some())
        .unwrap_or_else(|| (LogLevel::Info, rest.trim().to_string()));
    let message = if message.is_empty() {
        line.to_string()
    } else {
        message
    };

    Ok(ParsedLine {
        logged_at,
        level,
        category: categorize(&message, level),
        message,
    })
}

fn extract_level(rest: &str, has_timestamp: bool) -> Option<(LogLevel, String)> {
    if let Some(caps) = PIPE_LEVEL.captures(rest) {
        if let (Some(token), Some(after)) = (caps.get(1), caps.get(2)) {
            if let Ok(level) = token.as_str().parse::<LogLevel>() {
                let message = LOGURU_ORIGIN.replace(after.as_str().trim(), "").trim().to_string();
                return Some((level, message));
            }
        }
    }

    let positional = if has_timestamp {
        [&*BRACKET_LEVEL, &*DASHED_LEVEL, &*SPACED_LEVEL]
    } else {
        [&*BRACKET_LEVEL, &*COLON_LEVEL, &*COLON_LEVEL]
    };
    for pattern in positional {
        if let Some(caps) = pattern.captures(rest) {
            if let (Some(token), Some(msg)) = (caps.get(1), caps.get(2)) {
                if let Ok(level) = token.as_str().parse::<LogLevel>() {
                    return Some((level, msg.as_str().trim().to_string()));
                }
            }
        }
    }

    None
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let normalized = raw.replace(',', ".").replacen('T', " ", 1);
    let naive = NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn looks_like_garbage(line: &str) -> bool {
    if line.contains('\0') {
        return true;
    }
    let total = line.chars().count();
    let junk = line
        .chars()
        .filter(|c| *c == char::REPLACEMENT_CHARACTER || (c.is_control() && *c != '\t'))
        .count();
    junk * 10 > total * 3
}

const HEARTBEAT_KEYWORDS: &[&str] = &[
    "心跳",
    "连接",
    "Token",
    "WebSocket",
    "注册完成",
    "heartbeat",
    "Heartbeat",
];
const USER_MESSAGE_KEYWORDS: &[&str] = &["用户名"];
const USER_MESSAGE_PREFIXES: &[&str] = &["用户:", "用户：", "User:"];
const BOT_REPLY_KEYWORDS: &[&str] = &["AI回复"];
const BOT_REPLY_PREFIXES: &[&str] = &["机器人回复:", "机器人回复：", "Bot reply:"];
const MANUAL_MODE_KEYWORDS: &[&str] = &["接管", "人工", "手动", "🔴", "🟢", "manual mode"];
const ERROR_KEYWORDS: &[&str] = &["错误", "失败", "异常", "error", "Error", "Exception"];

/// Best-effort keyword classification; first matching rule wins.
pub fn categorize(message: &str, level: LogLevel) -> LogCategory {
    let contains_any = |words: &[&str]| words.iter().any(|w| message.contains(w));
    let starts_with_any = |words: &[&str]| words.iter().any(|w| message.starts_with(w));

    if contains_any(HEARTBEAT_KEYWORDS) {
        LogCategory::Heartbeat
    } else if starts_with_any(USER_MESSAGE_PREFIXES) || contains_any(USER_MESSAGE_KEYWORDS) {
        LogCategory::UserMessage
    } else if starts_with_any(BOT_REPLY_PREFIXES) || contains_any(BOT_REPLY_KEYWORDS) {
        LogCategory::BotReply
    } else if contains_any(MANUAL_MODE_KEYWORDS) {
        LogCategory::ManualMode
    } else if contains_any(ERROR_KEYWORDS) || level.is_error() {
        LogCategory::Error
    } else {
        LogCategory::System
    }
}

/// Owns the sequence counter; every accepted line gets the next number.
#[derive(Debug)]
pub struct RecordParser {
    next_sequence: u64,
    last_ingested_at: Option<DateTime<Utc>>,
}

impl Default for RecordParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordParser {
    pub fn new() -> Self {
        Self {
            next_sequence: 1,
            last_ingested_at: None,
        }
    }

    /// The sequence the next accepted record will receive.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn parse(&mut self, line: &str) -> Result<LogRecord, ParseError> {
        let parsed = parse_line(line)?;
        let timestamp = match parsed.logged_at {
            Some(ts) => ts,
            None => self.ingest_clock(),
        };
        Ok(self.stamp(timestamp, parsed.level, parsed.category, parsed.message))
    }

    /// Build a record that did not come from the log file (supervisor events).
    pub fn synthesize(
        &mut self,
        level: LogLevel,
        category: LogCategory,
        message: impl Into<String>,
    ) -> LogRecord {
        let timestamp = self.ingest_clock();
        self.stamp(timestamp, level, category, message.into())
    }

    fn stamp(
        &mut self,
        timestamp: DateTime<Utc>,
        level: LogLevel,
        category: LogCategory,
        message: String,
    ) -> LogRecord {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        LogRecord {
            sequence,
            timestamp,
            level,
            category,
            message,
        }
    }

    /// Wall clock that never runs backwards between two ingested records.
    fn ingest_clock(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_ingested_at {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_ingested_at = Some(ts);
        ts
    }
}
