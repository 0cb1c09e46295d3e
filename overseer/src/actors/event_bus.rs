//! EventBusActor - single ordered publish point for log records and status
//!
//! Producers (the log publisher and the process supervisor) cast
//! `EventBusMsg::Publish`; the actor appends log records to the history
//! buffer and fans every event out to the bounded queue of each subscriber.
//!
//! # Ordering and replay
//!
//! All mutations go through the actor mailbox, so a `Subscribe` is handled
//! strictly between two publishes. The history snapshot and the queue
//! registration happen in the same message, which is what makes the
//! replay/live boundary duplicate-free.
//!
//! # Backpressure
//!
//! Publishing never waits on a subscriber. Each subscriber owns a
//! [`SubscriberQueue`] that drops its oldest entry on overflow and counts it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde::Serialize;
use shared_types::{LevelFilter, LogLevel, LogRecord, ProcessStatus};

use crate::actors::subscriber_queue::SubscriberQueue;
use crate::config::BusConfig;
use crate::logs::history::{HistoryBuffer, RecordQuery};

const RECENT_ERRORS: usize = 10;
const ERROR_PREVIEW_CHARS: usize = 100;

// ============================================================================
// Data Types
// ============================================================================

/// What travels through the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Log(LogRecord),
    Status(ProcessStatus),
}

/// Handed to a new subscriber: replay snapshot plus its live queue.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    /// Replayed records, ascending, all below `next_sequence`.
    pub history: Vec<LogRecord>,
    /// First sequence the live queue can carry.
    pub next_sequence: u64,
    /// Latest known worker status at subscribe time.
    pub status: ProcessStatus,
    pub queue: Arc<SubscriberQueue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStats {
    pub id: String,
    pub queued: usize,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub total_ingested: u64,
    pub last_sequence: u64,
    pub history_len: usize,
    pub history_capacity: usize,
    pub level_counts: BTreeMap<LogLevel, u64>,
    pub recent_errors: Vec<ErrorSummary>,
    pub subscribers: Vec<SubscriberStats>,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// EventBusActor
// ============================================================================

/// Messages handled by EventBusActor
#[derive(Debug)]
pub enum EventBusMsg {
    /// Append to history (log records) and fan out to every subscriber
    Publish(BusEvent),

    /// Register a live queue, replaying up to `replay` records that pass `filter`
    Subscribe {
        replay: usize,
        filter: LevelFilter,
        reply: RpcReplyPort<Subscription>,
    },

    Unsubscribe {
        subscriber_id: String,
    },

    /// Look up records still held in the history buffer
    History {
        query: RecordQuery,
        reply: RpcReplyPort<Vec<LogRecord>>,
    },

    Stats {
        reply: RpcReplyPort<BusStats>,
    },
}

#[derive(Debug, Clone)]
pub struct EventBusArguments {
    pub config: BusConfig,
}

pub struct EventBusState {
    config: BusConfig,
    history: HistoryBuffer,
    subscribers: BTreeMap<String, Arc<SubscriberQueue>>,
    last_sequence: u64,
    last_status: ProcessStatus,
    total_ingested: u64,
    level_counts: BTreeMap<LogLevel, u64>,
    recent_errors: VecDeque<ErrorSummary>,
}

#[derive(Debug, Default)]
pub struct EventBusActor;

#[async_trait]
impl Actor for EventBusActor {
    type Msg = EventBusMsg;
    type State = EventBusState;
    type Arguments = EventBusArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            history_capacity = args.config.history_capacity,
            queue_capacity = args.config.queue_capacity,
            "EventBusActor starting"
        );

        Ok(EventBusState {
            history: HistoryBuffer::new(args.config.history_capacity),
            config: args.config,
            subscribers: BTreeMap::new(),
            last_sequence: 0,
            last_status: ProcessStatus::default(),
            total_ingested: 0,
            level_counts: BTreeMap::new(),
            recent_errors: VecDeque::with_capacity(RECENT_ERRORS),
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            EventBusMsg::Publish(event) => self.handle_publish(event, state),
            EventBusMsg::Subscribe {
                replay,
                filter,
                reply,
            } => {
                let subscription = self.handle_subscribe(replay, filter, state);
                let subscriber_id = subscription.id.clone();
                if reply.send(subscription).is_err() {
                    // Caller went away before the reply; nobody owns the queue.
                    if let Some(queue) = state.subscribers.remove(&subscriber_id) {
                        queue.close();
                    }
                    tracing::debug!(
                        subscriber_id = %subscriber_id,
                        "Subscribe reply not delivered, subscriber removed"
                    );
                }
            }
            EventBusMsg::Unsubscribe { subscriber_id } => {
                if let Some(queue) = state.subscribers.remove(&subscriber_id) {
                    queue.close();
                    tracing::debug!(
                        subscriber_id = %subscriber_id,
                        dropped = queue.total_dropped(),
                        "Subscriber removed"
                    );
                }
            }
            EventBusMsg::History { query, reply } => {
                let _ = reply.send(state.history.query(&query));
            }
            EventBusMsg::Stats { reply } => {
                let _ = reply.send(self.stats(state));
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for queue in state.subscribers.values() {
            queue.close();
        }
        state.subscribers.clear();
        tracing::info!(actor_id = %myself.get_id(), "EventBusActor stopped");
        Ok(())
    }
}

impl EventBusActor {
    fn handle_publish(&self, event: BusEvent, state: &mut EventBusState) {
        match &event {
            BusEvent::Log(record) => {
                if record.sequence <= state.last_sequence {
                    tracing::warn!(
                        sequence = record.sequence,
                        last_sequence = state.last_sequence,
                        "Discarding out-of-order log record"
                    );
                    return;
                }
                state.last_sequence = record.sequence;
                state.total_ingested += 1;
                *state.level_counts.entry(record.level).or_insert(0) += 1;
                if record.level.is_error() {
                    if state.recent_errors.len() == RECENT_ERRORS {
                        state.recent_errors.pop_front();
                    }
                    state.recent_errors.push_back(ErrorSummary {
                        sequence: record.sequence,
                        timestamp: record.timestamp,
                        level: record.level,
                        message: record.message.chars().take(ERROR_PREVIEW_CHARS).collect(),
                    });
                }
                state.history.push(record.clone());
            }
            BusEvent::Status(status) => {
                state.last_status = status.clone();
            }
        }

        state.subscribers.retain(|id, queue| {
            let open = queue.push(event.clone());
            if !open {
                tracing::debug!(subscriber_id = %id, "Pruning closed subscriber");
            }
            open
        });
    }

    fn handle_subscribe(
        &self,
        replay: usize,
        filter: LevelFilter,
        state: &mut EventBusState,
    ) -> Subscription {
        let id = ulid::Ulid::new().to_string();
        let queue = Arc::new(SubscriberQueue::new(state.config.queue_capacity));
        let replay = replay.min(state.history.capacity());
        let history = state.history.query(&RecordQuery {
            limit: replay,
            levels: filter,
            ..RecordQuery::default()
        });

        state.subscribers.insert(id.clone(), queue.clone());
        tracing::info!(
            subscriber_id = %id,
            replayed = history.len(),
            subscribers = state.subscribers.len(),
            "Subscriber added"
        );

        Subscription {
            id,
            history,
            next_sequence: state.last_sequence + 1,
            status: state.last_status.clone(),
            queue,
        }
    }

    fn stats(&self, state: &EventBusState) -> BusStats {
        BusStats {
            total_ingested: state.total_ingested,
            last_sequence: state.last_sequence,
            history_len: state.history.len(),
            history_capacity: state.history.capacity(),
            level_counts: state.level_counts.clone(),
            recent_errors: state.recent_errors.iter().rev().cloned().collect(),
            subscribers: state
                .subscribers
                .iter()
                .map(|(id, queue)| SubscriberStats {
                    id: id.clone(),
                    queued: queue.len(),
                    dropped: queue.total_dropped(),
                })
                .collect(),
        }
    }
}

// ============================================================================
// Convenience Functions
// ============================================================================

pub async fn subscribe(
    bus: &ActorRef<EventBusMsg>,
    replay: usize,
    filter: LevelFilter,
) -> Result<Subscription, BusError> {
    ractor::call!(bus, |reply| EventBusMsg::Subscribe {
        replay,
        filter,
        reply
    })
    .map_err(|e| BusError::Unavailable(e.to_string()))
}

pub async fn history(
    bus: &ActorRef<EventBusMsg>,
    query: RecordQuery,
) -> Result<Vec<LogRecord>, BusError> {
    ractor::call!(bus, |reply| EventBusMsg::History { query, reply })
        .map_err(|e| BusError::Unavailable(e.to_string()))
}

pub async fn stats(bus: &ActorRef<EventBusMsg>) -> Result<BusStats, BusError> {
    ractor::call!(bus, |reply| EventBusMsg::Stats { reply })
        .map_err(|e| BusError::Unavailable(e.to_string()))
}
