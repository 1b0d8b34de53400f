use crate::error::GateError;
use crate::step::{Check, CheckOutcome, ExecContext};
use std::time::Duration;
use tokio::time::Instant;

/// How a verification gate polls its check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
    pub max_interval: Duration,
    /// Interval multiplier applied after every unsatisfied poll
    pub backoff_factor: u32,
}

impl PollPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            max_interval: interval,
            backoff_factor: 1,
        }
    }

    pub fn with_backoff(mut self, factor: u32, max_interval: Duration) -> Self {
        self.backoff_factor = factor.max(1);
        self.max_interval = max_interval.max(self.interval);
        self
    }

    fn next_interval(&self, current: Duration) -> Duration {
        current
            .checked_mul(self.backoff_factor)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), Duration::from_secs(5))
            .with_backoff(2, Duration::from_secs(30))
    }
}

/// Polls a check until it holds, the timeout elapses or the run is cancelled
///
/// The gate knows nothing about what is checked; a check error counts as
/// "not yet" and its text becomes the last diagnostic.
pub struct VerificationGate;

impl VerificationGate {
    pub async fn poll(
        check: &dyn Check,
        ctx: &ExecContext,
        policy: &PollPolicy,
    ) -> Result<CheckOutcome, GateError> {
        let deadline = Instant::now() + policy.timeout;
        let mut interval = policy.interval;
        let mut polls = 0u32;
        let mut last_detail: Option<String> = None;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(GateError::Cancelled);
            }

            polls += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let budget = if remaining.is_zero() {
                policy.interval
            } else {
                remaining
            };

            let evaluated = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(GateError::Cancelled),
                result = tokio::time::timeout(budget, check.evaluate(ctx)) => result,
            };

            match evaluated {
                Ok(Ok(outcome)) if outcome.satisfied => {
                    tracing::debug!(
                        "Gate for step {} satisfied after {} polls: {}",
                        ctx.step_id,
                        polls,
                        check.describe()
                    );
                    return Ok(outcome);
                }
                Ok(Ok(outcome)) => last_detail = outcome.detail,
                Ok(Err(e)) => last_detail = Some(e.to_string()),
                Err(_) => last_detail = Some(format!("check did not answer within {:?}", budget)),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(GateError::Timeout {
                    timeout: policy.timeout,
                    polls,
                    last_detail,
                });
            }

            tracing::debug!(
                "Gate for step {} not satisfied (poll {}), next poll in {:?}",
                ctx.step_id,
                polls,
                interval
            );

            let pause = interval.min(deadline - now);
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(GateError::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
            interval = policy.next_interval(interval);
        }
    }
}
