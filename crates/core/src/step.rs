//! Step definition and the action/check execution boundary.
//!
//! The engine never looks inside an [`Action`] or [`Check`]: they are supplied
//! by the caller (shell commands, cluster API reads) and only report success,
//! failure and diagnostic text back.

use crate::error::ActionError;
use crate::workflow::gate::PollPolicy;
use crate::types::{RetryPolicy, StepId};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Context handed to every action and check invocation
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub step_id: StepId,
    /// 1-based attempt number of the enclosing step
    pub attempt: u32,
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl ExecContext {
    pub fn new(step_id: StepId, cancel: CancellationToken) -> Self {
        Self {
            step_id,
            attempt: 1,
            timeout: None,
            cancel,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Successful action result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutput {
    pub detail: Option<String>,
}

impl ActionOutput {
    pub fn with_detail(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
        }
    }
}

/// Result of evaluating a check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub satisfied: bool,
    pub detail: Option<String>,
}

impl CheckOutcome {
    pub fn satisfied() -> Self {
        Self {
            satisfied: true,
            detail: None,
        }
    }

    pub fn unsatisfied(detail: impl Into<String>) -> Self {
        Self {
            satisfied: false,
            detail: Some(detail.into()),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// An opaque unit of provisioning work
#[async_trait]
pub trait Action: Send + Sync {
    /// One-line human description used by plans and logs
    fn describe(&self) -> String;

    async fn run(&self, ctx: &ExecContext) -> Result<ActionOutput, ActionError>;
}

/// A side-effect free (from the host's point of view) read of some condition
#[async_trait]
pub trait Check: Send + Sync {
    fn describe(&self) -> String;

    async fn evaluate(&self, ctx: &ExecContext) -> Result<CheckOutcome, ActionError>;
}

/// Post-condition polled by a verification gate after the action succeeds
#[derive(Clone)]
pub struct Verification {
    pub check: Arc<dyn Check>,
    pub policy: PollPolicy,
}

/// A single named, idempotent provisioning step
#[derive(Clone)]
pub struct Step {
    pub id: StepId,
    pub description: String,
    pub depends_on: BTreeSet<StepId>,
    pub action: Arc<dyn Action>,
    pub precondition: Option<Arc<dyn Check>>,
    pub verify: Option<Verification>,
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("depends_on", &self.depends_on)
            .field("action", &self.action.describe())
            .field(
                "precondition",
                &self.precondition.as_ref().map(|c| c.describe()),
            )
            .field("verify", &self.verify.as_ref().map(|v| v.check.describe()))
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Step {
    pub fn builder(id: impl Into<String>, action: impl Action + 'static) -> StepBuilder {
        StepBuilder::new(StepId::new(id), Arc::new(action))
    }
}

/// Fluent construction of a [`Step`]
pub struct StepBuilder {
    step: Step,
}

impl StepBuilder {
    pub fn new(id: StepId, action: Arc<dyn Action>) -> Self {
        let description = action.describe();
        Self {
            step: Step {
                id,
                description,
                depends_on: BTreeSet::new(),
                action,
                precondition: None,
                verify: None,
                timeout: None,
                retry: RetryPolicy::default(),
            },
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.step.description = description.into();
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.step
            .depends_on
            .extend(ids.into_iter().map(|id| StepId::new(id.as_ref())));
        self
    }

    pub fn precondition(mut self, check: impl Check + 'static) -> Self {
        self.step.precondition = Some(Arc::new(check));
        self
    }

    pub fn verify(mut self, check: impl Check + 'static, policy: PollPolicy) -> Self {
        self.step.verify = Some(Verification {
            check: Arc::new(check),
            policy,
        });
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.step.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.step.retry = retry;
        self
    }

    pub fn build(self) -> Step {
        self.step
    }
}
