use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use shared_types::{LevelFilter, LogCategory, LogRecord};

/// Fixed-capacity ring of the most recent records, oldest first.
#[derive(Debug)]
pub struct HistoryBuffer {
    capacity: usize,
    records: VecDeque<LogRecord>,
}

/// Criteria for `GET /api/logs/recent` and similar lookups.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub limit: usize,
    pub up_to: Option<u64>,
    pub levels: LevelFilter,
    pub category: Option<LogCategory>,
    /// Case-insensitive substring of the message.
    pub keyword: Option<String>,
    /// Inclusive bounds on the record timestamp.
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl RecordQuery {
    pub fn latest(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    fn matches(&self, record: &LogRecord, keyword: Option<&str>) -> bool {
        if let Some(up_to) = self.up_to {
            if record.sequence > up_to {
                return false;
            }
        }
        if !self.levels.accepts(record.level) {
            return false;
        }
        if let Some(category) = self.category {
            if record.category != category {
                return false;
            }
        }
        if self.since.is_some_and(|since| record.timestamp < since)
            || self.until.is_some_and(|until| record.timestamp > until)
        {
            return false;
        }
        match keyword {
            Some(k) => record.message.to_lowercase().contains(k),
            None => true,
        }
    }
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append, evicting the oldest record when full.
    pub fn push(&mut self, record: LogRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &LogRecord> {
        self.records.iter()
    }

    /// The last `n` records in ascending sequence order.
    pub fn recent(&self, n: usize) -> Vec<LogRecord> {
        let skip = self.records.len().saturating_sub(n);
        self.records.iter().skip(skip).cloned().collect()
    }

    /// The newest `query.limit` records matching the query, ascending.
    pub fn query(&self, query: &RecordQuery) -> Vec<LogRecord> {
        if query.limit == 0 {
            return Vec::new();
        }
        let keyword = query
            .keyword
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_lowercase);

        let mut matched: Vec<LogRecord> = self
            .records
            .iter()
            .rev()
            .filter(|r| query.matches(r, keyword.as_deref()))
            .take(query.limit)
            .cloned()
            .collect();
        matched.reverse();
        matched
    }
}
