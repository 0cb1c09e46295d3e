use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use ractor::ActorRef;
use shared_types::{LevelFilter, LogRecord, ViewerCommand, ViewerEvent};

use crate::actors::event_bus::{self, BusEvent, EventBusMsg, Subscription};
use crate::actors::subscriber_queue::{Delivery, SubscriberQueue};
use crate::logs::history::RecordQuery;
use crate::viewer::{SessionEntry, ViewerError};

/// One connected viewer: its filters, pause flag and delivery cursor.
///
/// Dropping the session unregisters it and unsubscribes its queue from the
/// bus, so a closed transport never leaves a stale subscription behind.
pub struct ViewerSession {
    id: String,
    bus: ActorRef<EventBusMsg>,
    queue: Arc<SubscriberQueue>,
    registry: Arc<DashMap<String, SessionEntry>>,
    history_capacity: usize,
    filters: LevelFilter,
    paused: bool,
    /// Highest sequence seen on the live path; anything at or below is a duplicate.
    cursor: u64,
    last_delivered_sequence: Option<u64>,
    outbox: VecDeque<ViewerEvent>,
}

impl ViewerSession {
    /// Build the session from a fresh subscription. The outbox is primed
    /// with `connected`, the replay, `history_loaded` and the current status.
    pub(crate) fn from_subscription(
        subscription: Subscription,
        bus: ActorRef<EventBusMsg>,
        registry: Arc<DashMap<String, SessionEntry>>,
        history_capacity: usize,
        filters: LevelFilter,
    ) -> Self {
        let Subscription {
            id,
            history,
            next_sequence,
            status,
            queue,
        } = subscription;

        let mut session = Self {
            id: id.clone(),
            bus,
            queue,
            registry,
            history_capacity,
            filters,
            paused: false,
            cursor: next_sequence.saturating_sub(1),
            last_delivered_sequence: None,
            outbox: VecDeque::new(),
        };
        session.outbox.push_back(ViewerEvent::Connected { session_id: id });
        session.enqueue_history(history);
        session
            .outbox
            .push_back(ViewerEvent::status_update(&status, Utc::now()));
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn filters(&self) -> &LevelFilter {
        &self.filters
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn last_delivered_sequence(&self) -> Option<u64> {
        self.last_delivered_sequence
    }

    pub fn dropped(&self) -> u64 {
        self.queue.total_dropped()
    }

    /// Next outbound event. `None` once the session was closed by the manager
    /// or the bus went away.
    ///
    /// Cancel safe, so it can sit in a `select!` next to the transport reader.
    pub async fn next_event(&mut self) -> Option<ViewerEvent> {
        loop {
            if let Some(event) = self.outbox.pop_front() {
                return Some(event);
            }
            let delivery = self.queue.recv().await?;
            if let Some(event) = self.admit(delivery) {
                return Some(event);
            }
        }
    }

    /// Non-blocking variant of [`next_event`](Self::next_event).
    pub fn try_next_event(&mut self) -> Option<ViewerEvent> {
        loop {
            if let Some(event) = self.outbox.pop_front() {
                return Some(event);
            }
            let delivery = self.queue.try_recv()?;
            if let Some(event) = self.admit(delivery) {
                return Some(event);
            }
        }
    }

    fn admit(&mut self, delivery: Delivery) -> Option<ViewerEvent> {
        match delivery {
            Delivery::Dropped(count) => Some(ViewerEvent::Dropped { count }),
            Delivery::Event(BusEvent::Status(status)) => {
                Some(ViewerEvent::status_update(&status, Utc::now()))
            }
            Delivery::Event(BusEvent::Log(record)) => {
                if record.sequence <= self.cursor {
                    return None;
                }
                self.cursor = record.sequence;
                if self.paused || !self.filters.accepts(record.level) {
                    return None;
                }
                self.mark_delivered(record.sequence);
                Some(ViewerEvent::NewLog(record))
            }
        }
    }

    pub async fn apply(&mut self, command: ViewerCommand) -> Result<(), ViewerError> {
        match command {
            ViewerCommand::RequestHistory { lines_count } => {
                let records = event_bus::history(
                    &self.bus,
                    RecordQuery {
                        limit: lines_count.min(self.history_capacity),
                        up_to: Some(self.cursor),
                        levels: self.filters.clone(),
                        ..RecordQuery::default()
                    },
                )
                .await?;
                self.enqueue_history(records);
            }
            ViewerCommand::SetFilters { levels } => {
                self.filters = levels.into_iter().collect();
                tracing::debug!(session_id = %self.id, levels = ?self.filters.levels(), "Viewer filters changed");
                if let Some(mut entry) = self.registry.get_mut(&self.id) {
                    entry.filters = self.filters.clone();
                }
            }
            ViewerCommand::Pause => self.set_paused(true),
            ViewerCommand::Resume => self.set_paused(false),
            ViewerCommand::Ping => self.outbox.push_back(ViewerEvent::Pong),
        }
        Ok(())
    }

    fn enqueue_history(&mut self, records: Vec<LogRecord>) {
        let count = records.len();
        for record in records {
            self.mark_delivered(record.sequence);
            self.outbox.push_back(ViewerEvent::NewLog(record));
        }
        self.outbox.push_back(ViewerEvent::HistoryLoaded { count });
    }

    fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
        tracing::debug!(session_id = %self.id, paused, "Viewer pause toggled");
        if let Some(mut entry) = self.registry.get_mut(&self.id) {
            entry.paused = paused;
        }
    }

    fn mark_delivered(&mut self, sequence: u64) {
        let last = self.last_delivered_sequence.get_or_insert(sequence);
        *last = (*last).max(sequence);
        if let Some(mut entry) = self.registry.get_mut(&self.id) {
            entry.last_delivered_sequence = self.last_delivered_sequence;
        }
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
        self.queue.close();
        let _ = self.bus.cast(EventBusMsg::Unsubscribe {
            subscriber_id: self.id.clone(),
        });
        tracing::info!(session_id = %self.id, "Viewer session closed");
    }
}
