use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The actor's belief about the worker process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Running,
    Healthy,
    Stopping,
    StoppedWithCode { exit_code: i32 },
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Healthy => "healthy",
            Self::Stopping => "stopping",
            Self::StoppedWithCode { .. } => "stopped_with_code",
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::StoppedWithCode { exit_code } => Some(*exit_code),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StoppedWithCode { exit_code } => write!(f, "stopped_with_code({})", exit_code),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Single persisted status row. Replaced wholesale on every write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerStatus {
    #[serde(flatten)]
    pub state: ProcessState,
    /// Unix milliseconds of the last transition.
    pub last_change_at: i64,
}

impl ContainerStatus {
    pub fn new(state: ProcessState) -> Self {
        Self {
            state,
            last_change_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

impl Default for ContainerStatus {
    fn default() -> Self {
        Self {
            state: ProcessState::Stopped,
            last_change_at: 0,
        }
    }
}

/// Why `on_stop` fired.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Exit,
    RuntimeSignal,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exit => "exit",
            Self::RuntimeSignal => "runtime_signal",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopParams {
    pub exit_code: i32,
    pub reason: StopReason,
}

/// POSIX signal sent to the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Signal {
    #[default]
    Terminate,
    Interrupt,
    Kill,
    Other(i32),
}

impl Signal {
    pub fn as_raw(&self) -> i32 {
        match self {
            Self::Terminate => libc::SIGTERM,
            Self::Interrupt => libc::SIGINT,
            Self::Kill => libc::SIGKILL,
            Self::Other(n) => *n,
        }
    }
}

impl FromStr for Signal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().trim_start_matches("SIG") {
            "TERM" => Ok(Self::Terminate),
            "INT" => Ok(Self::Interrupt),
            "KILL" => Ok(Self::Kill),
            other => other
                .parse::<i32>()
                .map(Self::Other)
                .map_err(|_| format!("Invalid signal: {}", s)),
        }
    }
}

/// Immutable configuration handed to a single `ProcessControl::start` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartConfig {
    pub env: HashMap<String, String>,
    pub entrypoint: Vec<String>,
    pub enable_internet: bool,
}

/// Per-call overrides merged onto the actor defaults.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub env: Option<HashMap<String, String>>,
    pub entrypoint: Option<Vec<String>>,
    pub enable_internet: Option<bool>,
}

impl StartOptions {
    /// Resolve the overrides against actor-level defaults.
    pub fn resolve(&self, defaults: &StartConfig) -> StartConfig {
        StartConfig {
            env: self.env.clone().unwrap_or_else(|| defaults.env.clone()),
            entrypoint: self
                .entrypoint
                .clone()
                .unwrap_or_else(|| defaults.entrypoint.clone()),
            enable_internet: self.enable_internet.unwrap_or(defaults.enable_internet),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    Absolute,
    Delayed { delay_secs: i64 },
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absolute => "absolute",
            Self::Delayed { .. } => "delayed",
        }
    }
}

/// A pending one-shot callback owned by one actor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledTask {
    pub id: String,
    pub callback: String,
    pub payload: serde_json::Value,
    pub kind: TaskKind,
    /// Unix seconds.
    pub fire_at: i64,
    /// Unix seconds.
    pub created_at: i64,
}

impl ScheduledTask {
    pub fn is_due(&self, now_secs: i64) -> bool {
        self.fire_at <= now_secs
    }
}

/// When a scheduled task should fire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleWhen {
    At(chrono::DateTime<chrono::Utc>),
    Delay(std::time::Duration),
}
