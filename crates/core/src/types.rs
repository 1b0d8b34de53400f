use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Current on-disk layout of [`RunState`]
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Identifier of an orchestration run, chosen by the operator so re-invocations resume
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Default run id for a role when none is supplied
    pub fn for_role(role: Role) -> Self {
        Self(role.as_str().to_string())
    }

    /// Run ids become file names, so only a conservative character set is accepted
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 128
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !self.0.starts_with('.')
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a provisioning step
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Which node type a run provisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    ControlPlane,
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::ControlPlane => "control-plane",
            Role::Worker => "worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "control-plane" | "controlplane" | "master" => Ok(Role::ControlPlane),
            "worker" | "node" => Ok(Role::Worker),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Status of a run as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Interrupted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

/// Status of a single step within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// How a succeeded step was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Satisfaction {
    /// The action ran (and its verification passed)
    Action,
    /// The precondition already held, the action was not run
    Precondition,
}

/// Why a step was skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    DependencyFailed { dependency: StepId },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DependencyFailed { dependency } => {
                write!(f, "dependency '{}' failed", dependency)
            }
        }
    }
}

/// Retry behaviour for a step's action and verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped at `max_delay`
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_secs(2), Duration::from_secs(30))
    }
}

/// Persisted execution state of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub step_id: StepId,
    pub status: StepStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub satisfied_by: Option<Satisfaction>,
    #[serde(default)]
    pub skip_reason: Option<SkipReason>,
}

impl ExecutionRecord {
    pub fn pending(step_id: StepId) -> Self {
        Self {
            step_id,
            status: StepStatus::Pending,
            attempts: 0,
            last_error: None,
            started_at: None,
            finished_at: None,
            satisfied_by: None,
            skip_reason: None,
        }
    }

    /// Return the record to Pending for an explicit re-run
    pub fn reset(&mut self) {
        *self = Self::pending(self.step_id.clone());
    }
}

/// Persisted progress of one orchestration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    pub run_id: RunId,
    pub role: Role,
    pub status: RunStatus,
    /// Bumped by every save; used to detect concurrent writers
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub records: Vec<ExecutionRecord>,
}

fn default_format_version() -> u32 {
    STATE_FORMAT_VERSION
}

impl RunState {
    pub fn new(run_id: RunId, role: Role) -> Self {
        let now = Utc::now();
        Self {
            format_version: STATE_FORMAT_VERSION,
            run_id,
            role,
            status: RunStatus::NotStarted,
            version: 0,
            created_at: now,
            updated_at: now,
            records: Vec::new(),
        }
    }

    pub fn record(&self, step_id: &StepId) -> Option<&ExecutionRecord> {
        self.records.iter().find(|r| &r.step_id == step_id)
    }

    pub fn record_mut(&mut self, step_id: &StepId) -> Option<&mut ExecutionRecord> {
        self.records.iter_mut().find(|r| &r.step_id == step_id)
    }

    pub fn status_of(&self, step_id: &StepId) -> Option<StepStatus> {
        self.record(step_id).map(|r| r.status)
    }

    /// First step that has not succeeded, in record order
    pub fn resume_point(&self) -> Option<&StepId> {
        self.records
            .iter()
            .find(|r| r.status != StepStatus::Succeeded)
            .map(|r| &r.step_id)
    }

    pub fn first_failure(&self) -> Option<&ExecutionRecord> {
        self.records.iter().find(|r| r.status == StepStatus::Failed)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.records
            .iter()
            .all(|r| r.status == StepStatus::Succeeded)
    }
}

/// Per-run outcome of a step, as opposed to its persisted status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Action ran and verification passed
    Executed { attempts: u32 },
    /// Precondition held; action not invoked
    AlreadySatisfied,
    /// Succeeded in an earlier invocation of the same run
    Resumed,
    Failed { attempts: u32, error: String },
    SkippedDependencyFailed { dependency: StepId },
    /// Left untouched because the run halted or was interrupted first
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub step_id: StepId,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

/// Overall result of an orchestration run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunResult {
    Succeeded,
    Failed { step: StepId, error: String },
    PartiallyComplete {
        completed: Vec<StepId>,
        remaining: Vec<StepId>,
    },
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunResult::Succeeded => f.write_str("succeeded"),
            RunResult::Failed { step, error } => write!(f, "failed at step '{}': {}", step, error),
            RunResult::PartiallyComplete {
                completed,
                remaining,
            } => write!(
                f,
                "partially complete ({} done, {} remaining)",
                completed.len(),
                remaining.len()
            ),
        }
    }
}
