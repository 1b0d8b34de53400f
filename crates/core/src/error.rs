use crate::types::{Role, RunId, StepId};
use std::path::PathBuf;
use std::time::Duration;

/// Malformed graph or invalid input, detected before anything executes
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Dependency cycle detected between steps: {}", join_ids(.steps))]
    Cycle { steps: Vec<StepId> },

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: StepId, dependency: StepId },

    #[error("Step '{0}' is declared more than once")]
    DuplicateStep(StepId),

    #[error("Run '{run_id}' was started for role {stored}, not {requested}")]
    RoleMismatch {
        run_id: RunId,
        stored: Role,
        requested: Role,
    },

    #[error("Run id '{0}' is not valid (use letters, digits, '-', '_' or '.')")]
    InvalidRunId(String),

    #[error("Nothing to resume: no state recorded for run '{0}'")]
    NothingToResume(RunId),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn join_ids(ids: &[StepId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// A step's external work failed
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActionError {
    #[error("Failed to launch '{cmd}': {reason}")]
    Launch { cmd: String, reason: String },

    #[error("Command '{cmd}' exited with {code}{}", stderr_suffix(.stderr))]
    CommandFailed {
        cmd: String,
        code: String,
        stderr: Option<String>,
    },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Interrupted")]
    Cancelled,

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("{0}")]
    Other(String),
}

fn stderr_suffix(stderr: &Option<String>) -> String {
    match stderr {
        Some(text) if !text.is_empty() => format!(": {}", text),
        _ => String::new(),
    }
}

/// Outcome of a verification gate that never saw its condition hold
#[derive(Debug, Clone, thiserror::Error)]
pub enum GateError {
    #[error("Condition not met within {timeout:?} ({polls} polls){}", last_suffix(.last_detail))]
    Timeout {
        timeout: Duration,
        polls: u32,
        last_detail: Option<String>,
    },

    #[error("Verification cancelled")]
    Cancelled,
}

fn last_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(text) if !text.is_empty() => format!(": {}", text),
        _ => String::new(),
    }
}

impl From<GateError> for ActionError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::Cancelled => ActionError::Cancelled,
            other => ActionError::Verification(other.to_string()),
        }
    }
}

/// Durability layer failures; fatal for the run
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("State store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State for run '{run_id}' is corrupt: {reason}")]
    Corrupt { run_id: RunId, reason: String },

    #[error("State for run '{run_id}' was modified concurrently (expected version {expected}, found {found})")]
    Conflict {
        run_id: RunId,
        expected: u64,
        found: u64,
    },

    #[error("Run '{run_id}' is locked by running process {pid}")]
    Locked { run_id: RunId, pid: i32 },

    #[error("Failed to serialize state: {0}")]
    Serialize(String),
}

impl StateStoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateStoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors surfaced by the orchestrator to its caller
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    StateStore(#[from] StateStoreError),
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
