//! ProcessSupervisorActor - owns the worker's OS process.
//!
//! # State machine
//!
//! ```text
//! stopped --start--> starting --grace elapsed, alive--> running
//!    ^                   |                                 |
//!    |        exited during grace                  stop / crash
//!    |                   v                                 v
//!    +-------------- stopped <--- exit confirmed --- stopping
//! ```
//!
//! Every transition happens inside the actor, including the crash transition
//! noticed by the watch tick, so commands and the watcher share one
//! serialization point. Waiting is never done in the handler itself: the
//! startup grace window is a timer message and the exit wait runs in a
//! background task that reports back with `Exited`. A command that arrives
//! while a transition is in flight sees `starting`/`stopping` and is rejected.

pub mod sampler;

use std::fs::OpenOptions;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use shared_types::{LogCategory, LogLevel, ProcessState, ProcessStatus};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{SupervisorConfig, WorkerConfig};
use crate::logs::publisher::LogPublisher;
use sampler::ResourceSampler;

pub type CommandReply = RpcReplyPort<Result<ProcessStatus, SupervisorError>>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SupervisorError {
    #[error("cannot {op} while worker is {state}")]
    IllegalState {
        op: &'static str,
        state: ProcessState,
    },
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
    #[error("worker exited during startup (exit code {code:?})")]
    ExitedDuringStartup { code: Option<i32> },
    #[error("process supervisor unavailable: {0}")]
    Unavailable(String),
}

/// Messages handled by ProcessSupervisorActor
#[derive(Debug)]
pub enum SupervisorMsg {
    Start {
        reply: CommandReply,
    },
    /// Graceful stop; `None` uses the configured timeout
    Stop {
        timeout: Option<Duration>,
        reply: CommandReply,
    },
    Restart {
        timeout: Option<Duration>,
        reply: CommandReply,
    },
    /// Crash-watcher tick
    Watch,
    /// Resource-sampler tick
    Sample,
    StartupGraceElapsed {
        generation: u64,
    },
    /// Sent by the exit waiter of a commanded stop
    Exited {
        generation: u64,
        exit_code: Option<i32>,
        forced: bool,
    },
}

pub struct SupervisorArguments {
    pub config: SupervisorConfig,
    pub worker: WorkerConfig,
    pub publisher: LogPublisher,
    pub status_tx: watch::Sender<ProcessStatus>,
}

/// Reply owed to the caller of an in-flight transition.
enum Pending {
    Start(CommandReply),
    Stop(CommandReply),
    /// Stop phase of a restart; a start follows the exit.
    Restart(CommandReply),
}

pub struct SupervisorState {
    config: SupervisorConfig,
    worker: WorkerConfig,
    publisher: LogPublisher,
    status: ProcessStatus,
    status_tx: watch::Sender<ProcessStatus>,
    child: Option<Child>,
    /// Bumped on every spawn so stale timer/waiter messages are ignored.
    generation: u64,
    pending: Option<Pending>,
    sampler: ResourceSampler,
    tickers: Vec<JoinHandle<()>>,
    grace_timer: Option<JoinHandle<()>>,
    exit_waiter: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
pub struct ProcessSupervisorActor;

#[async_trait]
impl Actor for ProcessSupervisorActor {
    type Msg = SupervisorMsg;
    type State = SupervisorState;
    type Arguments = SupervisorArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            program = %args.worker.program,
            "ProcessSupervisorActor starting"
        );

        let tickers = vec![
            spawn_ticker(myself.clone(), args.config.watch_interval, || {
                SupervisorMsg::Watch
            }),
            spawn_ticker(myself.clone(), args.config.sample_interval, || {
                SupervisorMsg::Sample
            }),
        ];

        let status = args.status_tx.borrow().clone();
        Ok(SupervisorState {
            config: args.config,
            worker: args.worker,
            publisher: args.publisher,
            status,
            status_tx: args.status_tx,
            child: None,
            generation: 0,
            pending: None,
            sampler: ResourceSampler::new(),
            tickers,
            grace_timer: None,
            exit_waiter: None,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMsg::Start { reply } => {
                if let Err(e) = self.check("start", &[ProcessState::Stopped], state) {
                    let _ = reply.send(Err(e));
                    return Ok(());
                }
                self.begin_start(&myself, reply, state);
            }
            SupervisorMsg::Stop { timeout, reply } => {
                if let Err(e) = self.check("stop", &[ProcessState::Running], state) {
                    let _ = reply.send(Err(e));
                    return Ok(());
                }
                let timeout = timeout.unwrap_or(state.config.stop_timeout);
                self.begin_stop(&myself, timeout, Pending::Stop(reply), state);
            }
            SupervisorMsg::Restart { timeout, reply } => {
                let allowed = [ProcessState::Running, ProcessState::Stopped];
                if let Err(e) = self.check("restart", &allowed, state) {
                    let _ = reply.send(Err(e));
                    return Ok(());
                }
                if state.status.state == ProcessState::Stopped {
                    self.begin_start(&myself, reply, state);
                } else {
                    let timeout = timeout.unwrap_or(state.config.stop_timeout);
                    self.begin_stop(&myself, timeout, Pending::Restart(reply), state);
                }
            }
            SupervisorMsg::Watch => self.handle_watch(state),
            SupervisorMsg::Sample => self.handle_sample(state),
            SupervisorMsg::StartupGraceElapsed { generation } => {
                if generation == state.generation {
                    self.handle_grace_elapsed(state);
                }
            }
            SupervisorMsg::Exited {
                generation,
                exit_code,
                forced,
            } => {
                if generation == state.generation {
                    self.handle_exited(&myself, exit_code, forced, state);
                }
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for ticker in state.tickers.drain(..) {
            ticker.abort();
        }
        if let Some(timer) = state.grace_timer.take() {
            timer.abort();
        }
        // Dropping the waiter drops its child, which kill_on_drop reaps.
        if let Some(waiter) = state.exit_waiter.take() {
            waiter.abort();
        }
        if let Some(mut child) = state.child.take() {
            tracing::warn!(pid = ?child.id(), "Supervisor stopping with worker alive, killing it");
            let _ = child.start_kill();
        }
        tracing::info!(actor_id = %myself.get_id(), "ProcessSupervisorActor stopped");
        Ok(())
    }
}

impl ProcessSupervisorActor {
    fn check(
        &self,
        op: &'static str,
        allowed: &[ProcessState],
        state: &SupervisorState,
    ) -> Result<(), SupervisorError> {
        if state.pending.is_some() || !allowed.contains(&state.status.state) {
            tracing::debug!(op, state = %state.status.state, "Rejected supervisor command");
            return Err(SupervisorError::IllegalState {
                op,
                state: state.status.state,
            });
        }
        Ok(())
    }

    fn begin_start(
        &self,
        myself: &ActorRef<SupervisorMsg>,
        reply: CommandReply,
        state: &mut SupervisorState,
    ) {
        let child = match spawn_worker(&state.worker) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(program = %state.worker.program, "Failed to spawn worker: {e}");
                state.publisher.publish_record(
                    LogLevel::Error,
                    LogCategory::Error,
                    format!("Failed to start worker '{}': {e}", state.worker.program),
                );
                let _ = reply.send(Err(SupervisorError::Spawn(e.to_string())));
                return;
            }
        };

        state.generation += 1;
        state.sampler.reset();
        state.status = ProcessStatus {
            state: ProcessState::Starting,
            pid: child.id(),
            started_at: None,
            cpu_percent: 0.0,
            memory_bytes: 0,
            last_exit_code: state.status.last_exit_code,
        };
        state.child = Some(child);
        state.pending = Some(Pending::Start(reply));
        tracing::info!(pid = ?state.status.pid, "Worker spawned, waiting out startup grace");
        self.publish_status(state);

        let generation = state.generation;
        let grace = state.config.startup_grace;
        let me = myself.clone();
        state.grace_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = me.cast(SupervisorMsg::StartupGraceElapsed { generation });
        }));
    }

    fn handle_grace_elapsed(&self, state: &mut SupervisorState) {
        state.grace_timer = None;
        if state.status.state != ProcessState::Starting {
            return;
        }
        let reply = match state.pending.take() {
            Some(Pending::Start(reply)) => Some(reply),
            other => {
                state.pending = other;
                None
            }
        };

        let exited = match state.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => None,
            Some(Ok(Some(exit))) => Some(Ok(exit_code_of(exit))),
            Some(Err(e)) => Some(Err(e)),
            None => Some(Ok(None)),
        };

        let result = match exited {
            None => {
                state.status.state = ProcessState::Running;
                state.status.started_at = Some(Utc::now());
                tracing::info!(pid = ?state.status.pid, "Worker running");
                self.publish_status(state);
                Ok(state.status.clone())
            }
            Some(outcome) => {
                state.child = None;
                let code = outcome.as_ref().ok().copied().flatten();
                self.mark_stopped(code, state);
                let message = match &outcome {
                    Ok(code) => format!("Worker exited during startup (exit code {code:?})"),
                    Err(e) => format!("Worker status unavailable during startup: {e}"),
                };
                tracing::error!("{message}");
                state
                    .publisher
                    .publish_record(LogLevel::Error, LogCategory::Error, message);
                self.publish_status(state);
                match outcome {
                    Ok(code) => Err(SupervisorError::ExitedDuringStartup { code }),
                    Err(e) => Err(SupervisorError::Spawn(e.to_string())),
                }
            }
        };

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    fn begin_stop(
        &self,
        myself: &ActorRef<SupervisorMsg>,
        timeout: Duration,
        pending: Pending,
        state: &mut SupervisorState,
    ) {
        let Some(mut child) = state.child.take() else {
            // Running without a handle cannot happen; settle as stopped.
            self.mark_stopped(state.status.last_exit_code, state);
            self.publish_status(state);
            settle(pending, Ok(state.status.clone()));
            return;
        };

        let pid = child.id();
        send_terminate(&mut child);
        state.status.state = ProcessState::Stopping;
        state.pending = Some(pending);
        tracing::info!(?pid, timeout_ms = timeout.as_millis() as u64, "Stopping worker");
        self.publish_status(state);

        let generation = state.generation;
        let kill_timeout = state.config.kill_timeout;
        let me = myself.clone();
        state.exit_waiter = Some(tokio::spawn(async move {
            let (exit_code, forced) = match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(exit)) => (exit_code_of(exit), false),
                Ok(Err(e)) => {
                    tracing::warn!(?pid, "Failed waiting for worker exit: {e}");
                    (None, false)
                }
                Err(_) => {
                    tracing::warn!(?pid, "Worker ignored termination, killing");
                    send_kill(&mut child);
                    match tokio::time::timeout(kill_timeout, child.wait()).await {
                        Ok(Ok(exit)) => (exit_code_of(exit), true),
                        _ => (None, true),
                    }
                }
            };
            let _ = me.cast(SupervisorMsg::Exited {
                generation,
                exit_code,
                forced,
            });
        }));
    }

    fn handle_exited(
        &self,
        myself: &ActorRef<SupervisorMsg>,
        exit_code: Option<i32>,
        forced: bool,
        state: &mut SupervisorState,
    ) {
        state.exit_waiter = None;
        if state.status.state != ProcessState::Stopping {
            return;
        }
        tracing::info!(exit_code = ?exit_code, forced, "Worker stopped");
        self.mark_stopped(exit_code, state);
        self.publish_status(state);

        match state.pending.take() {
            Some(Pending::Stop(reply)) => {
                let _ = reply.send(Ok(state.status.clone()));
            }
            Some(Pending::Restart(reply)) => self.begin_start(myself, reply, state),
            Some(Pending::Start(reply)) => {
                let _ = reply.send(Err(SupervisorError::IllegalState {
                    op: "start",
                    state: ProcessState::Stopping,
                }));
            }
            None => {}
        }
    }

    /// Crash detection: an exit while `running` that nobody asked for.
    fn handle_watch(&self, state: &mut SupervisorState) {
        if state.status.state != ProcessState::Running {
            return;
        }
        let Some(child) = state.child.as_mut() else {
            return;
        };
        let exit = match child.try_wait() {
            Ok(Some(exit)) => exit,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Failed to poll worker status: {e}");
                return;
            }
        };

        let pid = state.status.pid;
        let code = exit_code_of(exit).unwrap_or(-1);
        state.child = None;
        self.mark_stopped(Some(code), state);
        tracing::warn!(?pid, exit_code = code, "Worker exited unexpectedly");
        state.publisher.publish_record(
            LogLevel::Error,
            LogCategory::Error,
            format!(
                "Worker exited unexpectedly (pid {}, exit code {code})",
                pid.map_or_else(|| "?".to_string(), |p| p.to_string())
            ),
        );
        self.publish_status(state);
    }

    fn handle_sample(&self, state: &mut SupervisorState) {
        if state.status.state != ProcessState::Running {
            return;
        }
        let Some(pid) = state.status.pid else {
            return;
        };
        if let Some(sample) = state.sampler.sample(pid) {
            // Unchanged figures are not rebroadcast to viewers.
            if sample.cpu_percent == state.status.cpu_percent
                && sample.memory_bytes == state.status.memory_bytes
            {
                return;
            }
            state.status.cpu_percent = sample.cpu_percent;
            state.status.memory_bytes = sample.memory_bytes;
            self.publish_status(state);
        }
    }

    fn mark_stopped(&self, exit_code: Option<i32>, state: &mut SupervisorState) {
        state.status = ProcessStatus {
            state: ProcessState::Stopped,
            pid: None,
            started_at: None,
            cpu_percent: 0.0,
            memory_bytes: 0,
            last_exit_code: exit_code,
        };
        state.sampler.reset();
    }

    fn publish_status(&self, state: &SupervisorState) {
        state.status_tx.send_replace(state.status.clone());
        state.publisher.publish_status(state.status.clone());
    }
}

fn settle(pending: Pending, result: Result<ProcessStatus, SupervisorError>) {
    let reply = match pending {
        Pending::Start(reply) | Pending::Stop(reply) | Pending::Restart(reply) => reply,
    };
    let _ = reply.send(result);
}

fn spawn_ticker(
    actor: ActorRef<SupervisorMsg>,
    period: Duration,
    make: fn() -> SupervisorMsg,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if actor.cast(make()).is_err() {
                break;
            }
        }
    })
}

fn spawn_worker(worker: &WorkerConfig) -> std::io::Result<Child> {
    let mut cmd = Command::new(&worker.program);
    cmd.args(&worker.args)
        .envs(worker.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .kill_on_drop(true);

    if let Some(cwd) = &worker.cwd {
        cmd.current_dir(cwd);
    }

    match &worker.output_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let out = OpenOptions::new().create(true).append(true).open(path)?;
            let err = out.try_clone()?;
            cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err));
        }
        None => {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
    }

    // Own process group, so signals reach the whole worker tree.
    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn()
}

/// Exit code, or `-signal` when the worker was killed by a signal.
fn exit_code_of(exit: ExitStatus) -> Option<i32> {
    if let Some(code) = exit.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = exit.signal() {
            return Some(-signal);
        }
    }
    None
}

#[cfg(unix)]
fn signal_worker(child: &Child, signal: libc::c_int) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: plain kill(2); the group id equals the leader pid.
    unsafe { libc::kill(-pid, signal) == 0 || libc::kill(pid, signal) == 0 }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    if !signal_worker(child, libc::SIGTERM) {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

fn send_kill(child: &mut Child) {
    #[cfg(unix)]
    signal_worker(child, libc::SIGKILL);
    let _ = child.start_kill();
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable front for the supervisor actor. `status()` reads the last
/// published snapshot and never waits on the mailbox.
#[derive(Clone)]
pub struct SupervisorHandle {
    actor: ActorRef<SupervisorMsg>,
    status_rx: watch::Receiver<ProcessStatus>,
}

impl SupervisorHandle {
    pub async fn spawn(
        config: SupervisorConfig,
        worker: WorkerConfig,
        publisher: LogPublisher,
    ) -> Result<(Self, JoinHandle<()>), SupervisorError> {
        let (status_tx, status_rx) = watch::channel(ProcessStatus::default());
        let (actor, handle) = Actor::spawn(
            None,
            ProcessSupervisorActor,
            SupervisorArguments {
                config,
                worker,
                publisher,
                status_tx,
            },
        )
        .await
        .map_err(|e| SupervisorError::Unavailable(e.to_string()))?;

        Ok((Self { actor, status_rx }, handle))
    }

    pub async fn start(&self) -> Result<ProcessStatus, SupervisorError> {
        ractor::call!(self.actor, |reply| SupervisorMsg::Start { reply })
            .map_err(|e| SupervisorError::Unavailable(e.to_string()))?
    }

    pub async fn stop(&self, timeout: Option<Duration>) -> Result<ProcessStatus, SupervisorError> {
        ractor::call!(self.actor, |reply| SupervisorMsg::Stop { timeout, reply })
            .map_err(|e| SupervisorError::Unavailable(e.to_string()))?
    }

    pub async fn restart(&self, timeout: Option<Duration>) -> Result<ProcessStatus, SupervisorError> {
        ractor::call!(self.actor, |reply| SupervisorMsg::Restart { timeout, reply })
            .map_err(|e| SupervisorError::Unavailable(e.to_string()))?
    }

    /// Last published snapshot; may be one sampling interval stale.
    pub fn status(&self) -> ProcessStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ProcessStatus> {
        self.status_rx.clone()
    }

    pub fn actor(&self) -> &ActorRef<SupervisorMsg> {
        &self.actor
    }
}
