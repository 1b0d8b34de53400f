use super::gate::VerificationGate;
use crate::error::ActionError;
use crate::step::{ActionOutput, ExecContext, Step};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

/// Runs the pieces of a single step: precondition, action, verification
pub struct StepExecutor;

impl StepExecutor {
    /// Whether the step's precondition already holds
    ///
    /// A precondition that cannot be evaluated counts as "not satisfied" so the
    /// action still runs.
    pub async fn precondition_holds(step: &Step, ctx: &ExecContext) -> bool {
        let Some(check) = &step.precondition else {
            return false;
        };

        match guarded(ctx, step.timeout, check.evaluate(ctx)).await {
            Ok(outcome) => {
                if let Some(detail) = &outcome.detail {
                    tracing::debug!("Precondition for {}: {}", step.id, detail);
                }
                outcome.satisfied
            }
            Err(e) => {
                tracing::warn!(
                    "Precondition for step {} could not be evaluated, running action: {}",
                    step.id,
                    e
                );
                false
            }
        }
    }

    /// One attempt: run the action under the step timeout, then the verification gate
    pub async fn attempt(step: &Step, ctx: &ExecContext) -> Result<ActionOutput, ActionError> {
        tracing::info!(
            "Executing step {} (attempt {}): {}",
            step.id,
            ctx.attempt,
            step.action.describe()
        );

        let output = guarded(ctx, step.timeout, step.action.run(ctx)).await?;

        if let Some(verification) = &step.verify {
            tracing::info!(
                "Verifying step {}: {}",
                step.id,
                verification.check.describe()
            );
            let outcome =
                VerificationGate::poll(verification.check.as_ref(), ctx, &verification.policy)
                    .await?;
            if let Some(detail) = outcome.detail {
                tracing::debug!("Verification of {} passed: {}", step.id, detail);
            }
        }

        Ok(output)
    }

    /// Sleep before retry number `retry`, returning early with an error if cancelled
    pub async fn backoff(step: &Step, retry: u32, ctx: &ExecContext) -> Result<(), ActionError> {
        let delay = step.retry.backoff(retry);
        tracing::info!(
            "Retrying step {} after {:?} (attempt {})",
            step.id,
            delay,
            ctx.attempt + 1
        );

        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ActionError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Runs a future with the optional timeout, aborting it on cancellation
async fn guarded<T, F>(
    ctx: &ExecContext,
    limit: Option<Duration>,
    fut: F,
) -> Result<T, ActionError>
where
    F: Future<Output = Result<T, ActionError>>,
{
    if ctx.cancel.is_cancelled() {
        return Err(ActionError::Cancelled);
    }

    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(ActionError::Cancelled),
        result = async {
            match limit {
                Some(limit) => match timeout(limit, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(ActionError::Timeout(limit)),
                },
                None => fut.await,
            }
        } => result,
    }
}
