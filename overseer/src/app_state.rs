//! Application state - owns the bus, supervisor, tailer task and viewer sessions.

use std::sync::Arc;
use std::time::Duration;

use ractor::{Actor, ActorRef};
use shared_types::ProcessState;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::actors::event_bus::{EventBusActor, EventBusArguments, EventBusMsg};
use crate::actors::process_supervisor::SupervisorHandle;
use crate::config::Config;
use crate::logs::publisher::LogPublisher;
use crate::logs::tailer::{FileTailer, TailerStatus};
use crate::viewer::SessionManager;

const TAILER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct AppState {
    config: Config,
    bus: ActorRef<EventBusMsg>,
    publisher: LogPublisher,
    supervisor: SupervisorHandle,
    sessions: SessionManager,
    tailer_status: watch::Receiver<TailerStatus>,
    cancel: CancellationToken,
    tailer_task: Mutex<Option<JoinHandle<()>>>,
}

impl AppState {
    /// Spawn every component. The worker itself is not started.
    pub async fn start(config: Config) -> anyhow::Result<Arc<Self>> {
        let (bus, _bus_handle) = Actor::spawn(
            None,
            EventBusActor,
            EventBusArguments { config: config.bus },
        )
        .await
        .map_err(|e| anyhow::anyhow!("Failed to spawn event bus: {e}"))?;

        let publisher = LogPublisher::new(bus.clone());

        let (supervisor, _supervisor_handle) = SupervisorHandle::spawn(
            config.supervisor.clone(),
            config.worker.clone(),
            publisher.clone(),
        )
        .await?;

        let tailer = FileTailer::new(config.tailer.clone());
        let tailer_status = tailer.subscribe_status();
        let cancel = CancellationToken::new();
        let tailer_task = tokio::spawn(tailer.run(publisher.clone(), cancel.child_token()));

        let sessions = SessionManager::new(bus.clone(), config.viewer, config.bus.history_capacity);

        tracing::info!(
            log_file = %config.tailer.path.display(),
            worker = %config.worker.program,
            "Overseer components started"
        );

        Ok(Arc::new(Self {
            config,
            bus,
            publisher,
            supervisor,
            sessions,
            tailer_status,
            cancel,
            tailer_task: Mutex::new(Some(tailer_task)),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &ActorRef<EventBusMsg> {
        &self.bus
    }

    pub fn publisher(&self) -> &LogPublisher {
        &self.publisher
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn tailer_status(&self) -> TailerStatus {
        self.tailer_status.borrow().clone()
    }

    /// Best-effort teardown; every step is bounded.
    pub async fn shutdown(&self) {
        tracing::info!("Overseer shutting down");
        self.cancel.cancel();
        if let Some(task) = self.tailer_task.lock().await.take() {
            if tokio::time::timeout(TAILER_SHUTDOWN_TIMEOUT, task).await.is_err() {
                tracing::warn!("Tailer did not stop in time");
            }
        }

        self.sessions.close_all();

        if self.supervisor.status().state != ProcessState::Stopped {
            let budget = self.config.supervisor.stop_timeout
                + self.config.supervisor.kill_timeout
                + self.config.supervisor.startup_grace
                + Duration::from_secs(1);
            match tokio::time::timeout(budget, self.stop_worker_for_shutdown()).await {
                Ok(()) => {}
                Err(_) => tracing::warn!("Worker stop timed out during shutdown"),
            }
        }

        self.supervisor.actor().stop(None);
        self.bus.stop(None);
    }

    async fn stop_worker_for_shutdown(&self) {
        // A start in flight settles within the grace window; wait for it first.
        let mut status_rx = self.supervisor.subscribe_status();
        let _ = status_rx
            .wait_for(|s| matches!(s.state, ProcessState::Running | ProcessState::Stopped))
            .await;
        if self.supervisor.status().state == ProcessState::Running {
            if let Err(e) = self.supervisor.stop(None).await {
                tracing::warn!(error = %e, "Failed to stop worker during shutdown");
            }
        }
    }
}
