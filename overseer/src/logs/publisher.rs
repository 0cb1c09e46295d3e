use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ractor::ActorRef;
use shared_types::{LogCategory, LogLevel, LogRecord, ProcessStatus};

use crate::actors::event_bus::{BusEvent, EventBusMsg};
use crate::logs::parser::RecordParser;

struct PublisherInner {
    parser: RecordParser,
    rejected: u64,
}

/// Single ingest point in front of the bus.
///
/// Both producers (tailer and supervisor) go through one lock that owns the
/// parser's sequence counter, and the cast happens while the lock is held, so
/// the bus mailbox sees records in sequence order.
#[derive(Clone)]
pub struct LogPublisher {
    inner: Arc<Mutex<PublisherInner>>,
    bus: ActorRef<EventBusMsg>,
}

impl LogPublisher {
    pub fn new(bus: ActorRef<EventBusMsg>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PublisherInner {
                parser: RecordParser::new(),
                rejected: 0,
            })),
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PublisherInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Parse and publish one raw line. Returns the assigned sequence, or
    /// `None` when the line was skipped or rejected.
    pub fn publish_line(&self, line: &str) -> Option<u64> {
        let mut inner = self.lock();
        match inner.parser.parse(line) {
            Ok(record) => {
                let sequence = record.sequence;
                self.send(BusEvent::Log(record));
                Some(sequence)
            }
            Err(e) => {
                if e.is_rejection() {
                    inner.rejected += 1;
                    tracing::debug!(error = %e, "Rejected log line");
                }
                None
            }
        }
    }

    /// Publish a record that did not come from the tailed file.
    pub fn publish_record(
        &self,
        level: LogLevel,
        category: LogCategory,
        message: impl Into<String>,
    ) -> LogRecord {
        let mut inner = self.lock();
        let record = inner.parser.synthesize(level, category, message);
        self.send(BusEvent::Log(record.clone()));
        record
    }

    pub fn publish_status(&self, status: ProcessStatus) {
        let _inner = self.lock();
        self.send(BusEvent::Status(status));
    }

    /// Lines dropped as unparsable garbage.
    pub fn rejected_lines(&self) -> u64 {
        self.lock().rejected
    }

    pub fn next_sequence(&self) -> u64 {
        self.lock().parser.next_sequence()
    }

    fn send(&self, event: BusEvent) {
        if let Err(e) = self.bus.cast(EventBusMsg::Publish(event)) {
            tracing::warn!(error = %e, "Event bus unavailable, event discarded");
        }
    }
}
