//! Viewer session behaviour against a live event bus.

use std::time::{Duration, Instant};

use ractor::{Actor, ActorRef};
use shared_types::{LevelFilter, LogLevel, ViewerCommand, ViewerEvent};

use overseer::actors::event_bus::{self, EventBusActor, EventBusArguments, EventBusMsg};
use overseer::config::{BusConfig, ViewerConfig};
use overseer::logs::LogPublisher;
use overseer::viewer::{SessionManager, ViewerSession};

struct Harness {
    bus: ActorRef<EventBusMsg>,
    publisher: LogPublisher,
    sessions: SessionManager,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.bus.stop(None);
    }
}

async fn harness(bus_config: BusConfig, viewer_config: ViewerConfig) -> Harness {
    let (bus, _handle) = Actor::spawn(
        None,
        EventBusActor,
        EventBusArguments { config: bus_config },
    )
    .await
    .expect("Failed to spawn event bus");
    let publisher = LogPublisher::new(bus.clone());
    let sessions = SessionManager::new(bus.clone(), viewer_config, bus_config.history_capacity);
    Harness {
        bus,
        publisher,
        sessions,
    }
}

async fn default_harness() -> Harness {
    harness(BusConfig::default(), ViewerConfig::default()).await
}

impl Harness {
    fn publish(&self, line: &str) -> u64 {
        self.publisher
            .publish_line(line)
            .expect("line should parse into a record")
    }

    /// Round-trip the bus mailbox so every earlier publish has been fanned out.
    async fn settle(&self) {
        event_bus::stats(&self.bus).await.expect("bus unavailable");
    }
}

async fn next(session: &mut ViewerSession) -> ViewerEvent {
    tokio::time::timeout(Duration::from_secs(5), session.next_event())
        .await
        .expect("Timed out waiting for viewer event")
        .expect("session closed unexpectedly")
}

/// Consume the connect preamble up to and including the initial status, and
/// return the replayed sequences.
async fn drain_preamble(session: &mut ViewerSession) -> Vec<u64> {
    assert!(matches!(next(session).await, ViewerEvent::Connected { .. }));
    let mut replayed = Vec::new();
    loop {
        match next(session).await {
            ViewerEvent::NewLog(record) => replayed.push(record.sequence),
            ViewerEvent::HistoryLoaded { count } => {
                assert_eq!(count, replayed.len());
                break;
            }
            other => panic!("unexpected event in replay: {other:?}"),
        }
    }
    assert!(matches!(
        next(session).await,
        ViewerEvent::StatusUpdate { .. }
    ));
    replayed
}

async fn next_log(session: &mut ViewerSession) -> shared_types::LogRecord {
    loop {
        match next(session).await {
            ViewerEvent::NewLog(record) => return record,
            ViewerEvent::StatusUpdate { .. } => continue,
            other => panic!("expected new_log, got {other:?}"),
        }
    }
}

async fn assert_quiet(session: &mut ViewerSession) {
    let got = tokio::time::timeout(Duration::from_millis(200), session.next_event()).await;
    assert!(got.is_err(), "expected no event, got {got:?}");
}

#[tokio::test]
async fn test_replay_then_live_without_duplicates() {
    let h = default_harness().await;
    for i in 1..=5 {
        h.publish(&format!("INFO: line {i}"));
    }

    let mut session = h.sessions.connect(Some(3), LevelFilter::all()).await.unwrap();
    assert_eq!(drain_preamble(&mut session).await, vec![3, 4, 5]);

    h.publish("INFO: line 6");
    h.publish("WARNING: line 7");
    assert_eq!(next_log(&mut session).await.sequence, 6);
    let seventh = next_log(&mut session).await;
    assert_eq!(seventh.sequence, 7);
    assert_eq!(seventh.level, LogLevel::Warning);
    assert_eq!(session.last_delivered_sequence(), Some(7));

    assert_quiet(&mut session).await;
}

#[tokio::test]
async fn test_replay_defaults_and_is_capped() {
    let h = harness(
        BusConfig {
            history_capacity: 10,
            queue_capacity: 256,
        },
        ViewerConfig::default(),
    )
    .await;
    for i in 1..=20 {
        h.publish(&format!("INFO: line {i}"));
    }

    // Default of 50 is capped at the 10 records the buffer can hold.
    let mut session = h.sessions.connect(None, LevelFilter::all()).await.unwrap();
    assert_eq!(
        drain_preamble(&mut session).await,
        (11..=20).collect::<Vec<u64>>()
    );

    let mut empty = h.sessions.connect(Some(0), LevelFilter::all()).await.unwrap();
    assert!(drain_preamble(&mut empty).await.is_empty());
}

#[tokio::test]
async fn test_initial_filter_applies_to_replay_and_live() {
    let h = default_harness().await;
    h.publish("INFO: boring");
    h.publish("ERROR: broken");
    h.publish("INFO: boring again");

    let mut session = h
        .sessions
        .connect(Some(10), LevelFilter::parse_csv("ERROR,CRITICAL"))
        .await
        .unwrap();
    assert_eq!(drain_preamble(&mut session).await, vec![2]);

    h.publish("INFO: skipped");
    h.publish("CRITICAL: on fire");
    let record = next_log(&mut session).await;
    assert_eq!(record.sequence, 5);
    assert_eq!(record.level, LogLevel::Critical);
}

#[tokio::test]
async fn test_set_filters_changes_subsequent_delivery() {
    let h = default_harness().await;
    let mut session = h.sessions.connect(Some(0), LevelFilter::all()).await.unwrap();
    drain_preamble(&mut session).await;

    session
        .apply(ViewerCommand::SetFilters {
            levels: vec![LogLevel::Error],
        })
        .await
        .unwrap();
    assert!(!session.filters().accepts(LogLevel::Info));

    h.publish("INFO: hidden");
    h.publish("ERROR: shown");
    let record = next_log(&mut session).await;
    assert_eq!(record.sequence, 2);
    assert_eq!(record.message, "shown");

    // An empty list goes back to accepting everything.
    session
        .apply(ViewerCommand::SetFilters { levels: vec![] })
        .await
        .unwrap();
    h.publish("DEBUG: verbose");
    assert_eq!(next_log(&mut session).await.sequence, 3);
}

#[tokio::test]
async fn test_pause_skips_records_and_resume_continues_from_now() {
    let h = default_harness().await;
    let mut session = h.sessions.connect(Some(0), LevelFilter::all()).await.unwrap();
    drain_preamble(&mut session).await;

    session.apply(ViewerCommand::Pause).await.unwrap();
    assert!(session.is_paused());
    h.publish("INFO: while paused 1");
    h.publish("INFO: while paused 2");
    h.settle().await;
    assert_quiet(&mut session).await;

    session.apply(ViewerCommand::Resume).await.unwrap();
    h.publish("INFO: after resume");
    let record = next_log(&mut session).await;
    assert_eq!(record.sequence, 3);
    assert_eq!(record.message, "after resume");
}

#[tokio::test]
async fn test_status_flows_while_paused() {
    let h = default_harness().await;
    let mut session = h.sessions.connect(Some(0), LevelFilter::all()).await.unwrap();
    drain_preamble(&mut session).await;

    session.apply(ViewerCommand::Pause).await.unwrap();
    let status = shared_types::ProcessStatus {
        state: shared_types::ProcessState::Running,
        pid: Some(4242),
        ..Default::default()
    };
    h.publisher.publish_status(status);

    match next(&mut session).await {
        ViewerEvent::StatusUpdate { state, pid, .. } => {
            assert_eq!(state, shared_types::ProcessState::Running);
            assert_eq!(pid, Some(4242));
        }
        other => panic!("expected status_update, got {other:?}"),
    }
}

#[tokio::test]
async fn test_request_history_returns_records_up_to_cursor() {
    let h = default_harness().await;
    for i in 1..=3 {
        h.publish(&format!("INFO: old {i}"));
    }
    let mut session = h.sessions.connect(Some(0), LevelFilter::all()).await.unwrap();
    drain_preamble(&mut session).await;

    h.publish("INFO: live 4");
    h.publish("INFO: live 5");
    assert_eq!(next_log(&mut session).await.sequence, 4);
    assert_eq!(next_log(&mut session).await.sequence, 5);

    session
        .apply(ViewerCommand::RequestHistory { lines_count: 2 })
        .await
        .unwrap();
    assert_eq!(next_log(&mut session).await.sequence, 4);
    assert_eq!(next_log(&mut session).await.sequence, 5);
    assert_eq!(next(&mut session).await, ViewerEvent::HistoryLoaded { count: 2 });

    h.publish("INFO: live 6");
    assert_eq!(next_log(&mut session).await.sequence, 6);
}

#[tokio::test]
async fn test_slow_viewer_gets_dropped_notice() {
    let h = harness(
        BusConfig {
            history_capacity: 100,
            queue_capacity: 2,
        },
        ViewerConfig::default(),
    )
    .await;
    let mut session = h.sessions.connect(Some(0), LevelFilter::all()).await.unwrap();

    for i in 1..=5 {
        h.publish(&format!("INFO: burst {i}"));
    }
    h.settle().await;

    drain_preamble(&mut session).await;
    // Everything is already queued, so the non-blocking path sees it all.
    assert_eq!(
        session.try_next_event(),
        Some(ViewerEvent::Dropped { count: 3 })
    );
    let sequences: Vec<u64> = std::iter::from_fn(|| session.try_next_event())
        .map(|event| match event {
            ViewerEvent::NewLog(record) => record.sequence,
            other => panic!("expected new_log, got {other:?}"),
        })
        .collect();
    assert_eq!(sequences, vec![4, 5]);
    assert_eq!(session.dropped(), 3);
}

#[tokio::test]
async fn test_stalled_viewer_does_not_delay_others() {
    let h = harness(
        BusConfig {
            history_capacity: 1000,
            queue_capacity: 64,
        },
        ViewerConfig::default(),
    )
    .await;

    let stalled = h.sessions.connect(Some(0), LevelFilter::all()).await.unwrap();
    let mut fast = h.sessions.connect(Some(0), LevelFilter::all()).await.unwrap();
    drain_preamble(&mut fast).await;

    let reader = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(event) = fast.next_event().await {
            if let ViewerEvent::NewLog(record) = event {
                seen.push(record.sequence);
                if record.sequence == 500 {
                    break;
                }
            }
        }
        seen
    });

    let begun = Instant::now();
    for i in 1..=500 {
        h.publish(&format!("INFO: flood {i}"));
    }
    let seen = tokio::time::timeout(Duration::from_secs(5), reader)
        .await
        .expect("fast viewer stalled")
        .unwrap();

    assert!(begun.elapsed() < Duration::from_secs(2));
    assert_eq!(seen.last(), Some(&500));
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {seen:?}");

    h.settle().await;
    assert!(stalled.dropped() >= 500 - 64);
}

#[tokio::test]
async fn test_ping_is_answered() {
    let h = default_harness().await;
    let mut session = h.sessions.connect(Some(0), LevelFilter::all()).await.unwrap();
    drain_preamble(&mut session).await;

    session.apply(ViewerCommand::Ping).await.unwrap();
    assert_eq!(next(&mut session).await, ViewerEvent::Pong);
}

#[tokio::test]
async fn test_registry_tracks_open_sessions() {
    let h = default_harness().await;
    let first = h.sessions.connect(Some(0), LevelFilter::all()).await.unwrap();
    let mut second = h
        .sessions
        .connect(Some(0), LevelFilter::parse_csv("ERROR"))
        .await
        .unwrap();
    assert_eq!(h.sessions.len(), 2);

    second.apply(ViewerCommand::Pause).await.unwrap();
    let listed = h.sessions.list();
    let info = listed.iter().find(|s| s.id == second.id()).unwrap();
    assert!(info.paused);
    assert_eq!(info.levels, vec![LogLevel::Error]);

    drop(first);
    h.settle().await;
    assert_eq!(h.sessions.len(), 1);
    let stats = event_bus::stats(&h.bus).await.unwrap();
    assert_eq!(stats.subscribers.len(), 1);
    assert_eq!(stats.subscribers[0].id, second.id());
}

#[tokio::test]
async fn test_close_all_ends_sessions() {
    let h = default_harness().await;
    let mut session = h.sessions.connect(Some(0), LevelFilter::all()).await.unwrap();
    drain_preamble(&mut session).await;

    h.sessions.close_all();
    let end = tokio::time::timeout(Duration::from_secs(1), session.next_event())
        .await
        .expect("closed session should end promptly");
    assert_eq!(end, None);
}
