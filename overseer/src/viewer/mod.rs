//! Viewer Session Manager
//!
//! Creates one [`ViewerSession`] per connected viewer and keeps a registry
//! of live sessions for `/api/sessions`. Sessions remove themselves from the
//! registry and the bus when dropped.

mod session;

pub use session::ViewerSession;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ractor::ActorRef;
use serde::Serialize;
use shared_types::{LevelFilter, LogLevel};

use crate::actors::event_bus::{self, BusError, EventBusMsg};
use crate::actors::subscriber_queue::SubscriberQueue;
use crate::config::ViewerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ViewerError {
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Registry view of a session, shared with the session itself.
#[derive(Debug)]
pub struct SessionEntry {
    pub connected_at: DateTime<Utc>,
    pub filters: LevelFilter,
    pub paused: bool,
    pub last_delivered_sequence: Option<u64>,
    queue: Arc<SubscriberQueue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub connected_at: DateTime<Utc>,
    pub levels: Vec<LogLevel>,
    pub paused: bool,
    pub last_delivered_sequence: Option<u64>,
    pub queued: usize,
    pub dropped: u64,
}

#[derive(Clone)]
pub struct SessionManager {
    bus: ActorRef<EventBusMsg>,
    config: ViewerConfig,
    history_capacity: usize,
    sessions: Arc<DashMap<String, SessionEntry>>,
}

impl SessionManager {
    pub fn new(bus: ActorRef<EventBusMsg>, config: ViewerConfig, history_capacity: usize) -> Self {
        Self {
            bus,
            config,
            history_capacity,
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    /// Subscribe a new viewer. `history` defaults to the configured replay
    /// size and is capped at the history capacity.
    pub async fn connect(
        &self,
        history: Option<usize>,
        filters: LevelFilter,
    ) -> Result<ViewerSession, ViewerError> {
        let replay = history
            .unwrap_or(self.config.default_history)
            .min(self.history_capacity);
        let subscription = event_bus::subscribe(&self.bus, replay, filters.clone()).await?;
        let queue = subscription.queue.clone();

        let session = ViewerSession::from_subscription(
            subscription,
            self.bus.clone(),
            self.sessions.clone(),
            self.history_capacity,
            filters.clone(),
        );
        self.sessions.insert(
            session.id().to_string(),
            SessionEntry {
                connected_at: Utc::now(),
                filters,
                paused: false,
                last_delivered_sequence: session.last_delivered_sequence(),
                queue,
            },
        );

        tracing::info!(
            session_id = %session.id(),
            replay,
            sessions = self.sessions.len(),
            "Viewer session opened"
        );
        Ok(session)
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| SessionInfo {
                id: entry.key().clone(),
                connected_at: entry.connected_at,
                levels: entry.filters.levels(),
                paused: entry.paused,
                last_delivered_sequence: entry.last_delivered_sequence,
                queued: entry.queue.len(),
                dropped: entry.queue.total_dropped(),
            })
            .collect();
        sessions.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then(a.id.cmp(&b.id)));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every session queue; each session's `next_event` then ends and
    /// its owner drops it.
    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            entry.queue.close();
        }
    }
}
