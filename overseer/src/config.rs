use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Command line and environment of the supervised worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// Append the worker's stdout/stderr to this file (normally the tailed log).
    pub output_file: Option<PathBuf>,
}

impl WorkerConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            output_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// How long a freshly spawned worker must stay alive to count as running.
    pub startup_grace: Duration,
    /// Default graceful-stop budget before escalating to SIGKILL.
    pub stop_timeout: Duration,
    /// How long to wait for the OS to reap the worker after SIGKILL.
    pub kill_timeout: Duration,
    pub sample_interval: Duration,
    pub watch_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_millis(1000),
            stop_timeout: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(5),
            sample_interval: Duration::from_secs(3),
            watch_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailerConfig {
    pub path: PathBuf,
    pub poll_interval: Duration,
    /// Emit content already present when the tailer first attaches.
    pub from_start: bool,
}

impl TailerConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: Duration::from_millis(500),
            from_start: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    pub history_capacity: usize,
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewerConfig {
    pub default_history: usize,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            default_history: 50,
            ping_interval: Duration::from_secs(15),
            ping_timeout: Duration::from_secs(45),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the overseer listens on
    pub port: u16,
    pub tailer: TailerConfig,
    pub bus: BusConfig,
    pub viewer: ViewerConfig,
    pub supervisor: SupervisorConfig,
    pub worker: WorkerConfig,
}

/// `[worker]` table of the optional TOML file named by `OVERSEER_CONFIG`.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    worker: Option<WorkerFileConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkerFileConfig {
    program: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: std::collections::BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    redirect_output: Option<bool>,
}

impl Config {
    /// Build a config for the given log file and worker with every other knob at its default.
    pub fn new(log_file: impl Into<PathBuf>, worker: WorkerConfig) -> Self {
        Self {
            port: 8090,
            tailer: TailerConfig::new(log_file),
            bus: BusConfig::default(),
            viewer: ViewerConfig::default(),
            supervisor: SupervisorConfig::default(),
            worker,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let log_file = PathBuf::from(env_str("OVERSEER_LOG_FILE", "logs/app.log"));

        let mut worker = WorkerConfig {
            program: env_str("OVERSEER_WORKER_PROGRAM", "python3"),
            args: env_words("OVERSEER_WORKER_ARGS", &["main.py"]),
            env: Vec::new(),
            cwd: std::env::var("OVERSEER_WORKER_CWD").ok().map(PathBuf::from),
            output_file: None,
        };
        let mut redirect_output = env_parse("OVERSEER_WORKER_REDIRECT_OUTPUT", true)?;

        if let Ok(path) = std::env::var("OVERSEER_CONFIG") {
            let file = load_file_config(Path::new(&path))?;
            if let Some(w) = file.worker {
                if let Some(program) = w.program {
                    worker.program = program;
                    worker.args = w.args;
                } else if !w.args.is_empty() {
                    worker.args = w.args;
                }
                worker.env = w.env.into_iter().collect();
                if w.cwd.is_some() {
                    worker.cwd = w.cwd;
                }
                if let Some(redirect) = w.redirect_output {
                    redirect_output = redirect;
                }
            }
        }

        if redirect_output {
            worker.output_file = Some(log_file.clone());
        }

        Ok(Self {
            port: env_parse("OVERSEER_PORT", 8090)?,
            tailer: TailerConfig {
                path: log_file,
                poll_interval: Duration::from_millis(
                    env_parse("OVERSEER_TAIL_POLL_MS", 500u64)?.clamp(10, 1000),
                ),
                from_start: env_parse("OVERSEER_TAIL_FROM_START", false)?,
            },
            bus: BusConfig {
                history_capacity: env_parse("OVERSEER_HISTORY_CAPACITY", 1000usize)?.max(1),
                queue_capacity: env_parse("OVERSEER_QUEUE_CAPACITY", 256usize)?.max(1),
            },
            viewer: ViewerConfig {
                default_history: env_parse("OVERSEER_DEFAULT_HISTORY", 50)?,
                ping_interval: Duration::from_secs(env_parse("OVERSEER_PING_INTERVAL_SECS", 15)?),
                ping_timeout: Duration::from_secs(env_parse("OVERSEER_PING_TIMEOUT_SECS", 45)?),
            },
            supervisor: SupervisorConfig {
                startup_grace: Duration::from_millis(env_parse("OVERSEER_STARTUP_GRACE_MS", 1000)?),
                stop_timeout: Duration::from_secs(env_parse("OVERSEER_STOP_TIMEOUT_SECS", 10)?),
                kill_timeout: Duration::from_secs(env_parse("OVERSEER_KILL_TIMEOUT_SECS", 5)?),
                sample_interval: Duration::from_secs(
                    env_parse("OVERSEER_SAMPLE_INTERVAL_SECS", 3u64)?.max(1),
                ),
                watch_interval: Duration::from_millis(
                    env_parse("OVERSEER_WATCH_INTERVAL_MS", 1000u64)?.max(50),
                ),
            },
            worker,
        })
    }
}

fn load_file_config(path: &Path) -> anyhow::Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {e}", path.display()))?;
    toml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {e}", path.display()))
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_words(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw.split_whitespace().map(ToString::to_string).collect(),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}
