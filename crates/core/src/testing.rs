//! Scripted actions and checks for exercising the engine without touching a host.

use crate::error::ActionError;
use crate::step::{Action, ActionOutput, Check, CheckOutcome, ExecContext, StepBuilder};
use crate::types::{RetryPolicy, StepId};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Step builder with no retries and no backoff, suitable for tests
pub fn scripted_step(id: &str, action: ScriptedAction) -> StepBuilder {
    StepBuilder::new(StepId::new(id), Arc::new(action)).retry(RetryPolicy::no_retry())
}

#[derive(Debug, Clone)]
enum Reply {
    Ok,
    Fail(String),
    /// Block until the run is cancelled
    Hang,
}

/// An action that replays a script of results, then repeats a fallback
#[derive(Clone)]
pub struct ScriptedAction {
    script: Arc<Mutex<VecDeque<Reply>>>,
    fallback: Reply,
    delay: Duration,
    calls: Arc<AtomicU32>,
    cancel_after: Option<CancellationToken>,
}

impl ScriptedAction {
    fn with_fallback(fallback: Reply) -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicU32::new(0)),
            cancel_after: None,
        }
    }

    pub fn succeeding() -> Self {
        Self::with_fallback(Reply::Ok)
    }

    pub fn failing(message: &str) -> Self {
        Self::with_fallback(Reply::Fail(message.to_string()))
    }

    /// Fails `times` times, then succeeds
    pub fn failing_times(times: u32, message: &str) -> Self {
        let action = Self::succeeding();
        if let Ok(mut script) = action.script.lock() {
            script.extend((0..times).map(|_| Reply::Fail(message.to_string())));
        }
        action
    }

    /// Never finishes on its own; returns `Cancelled` once the run is cancelled
    pub fn hanging() -> Self {
        Self::with_fallback(Reply::Hang)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Cancels the token after the action completes, like a Ctrl-C between steps
    pub fn cancel_after(mut self, token: CancellationToken) -> Self {
        self.cancel_after = Some(token);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> Reply {
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Action for ScriptedAction {
    fn describe(&self) -> String {
        "scripted action".to_string()
    }

    async fn run(&self, ctx: &ExecContext) -> Result<ActionOutput, ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = match self.next_reply() {
            Reply::Ok => Ok(ActionOutput::with_detail(format!("attempt {}", ctx.attempt))),
            Reply::Fail(message) => Err(ActionError::Other(message)),
            Reply::Hang => {
                ctx.cancel.cancelled().await;
                Err(ActionError::Cancelled)
            }
        };

        if let Some(token) = &self.cancel_after {
            token.cancel();
        }
        result
    }
}

#[derive(Debug, Clone)]
enum Answer {
    Value(bool),
    Error(String),
}

/// A check that replays a script of answers, repeating the last one
#[derive(Clone)]
pub struct ScriptedCheck {
    script: Arc<Mutex<VecDeque<Answer>>>,
    last: Arc<Mutex<Answer>>,
    detail: Option<String>,
    calls: Arc<AtomicU32>,
    cancel_after: Option<CancellationToken>,
}

impl ScriptedCheck {
    fn from_answers(answers: Vec<Answer>, last: Answer) -> Self {
        Self {
            script: Arc::new(Mutex::new(answers.into())),
            last: Arc::new(Mutex::new(last)),
            detail: None,
            calls: Arc::new(AtomicU32::new(0)),
            cancel_after: None,
        }
    }

    pub fn always(value: bool) -> Self {
        Self::from_answers(Vec::new(), Answer::Value(value))
    }

    /// Answers in order; the final answer repeats
    pub fn sequence(values: &[bool]) -> Self {
        let last = values.last().copied().unwrap_or(false);
        Self::from_answers(
            values.iter().map(|v| Answer::Value(*v)).collect(),
            Answer::Value(last),
        )
    }

    /// Errors `times` times, then answers `value` forever
    pub fn erroring_then(times: u32, message: &str, value: bool) -> Self {
        Self::from_answers(
            (0..times).map(|_| Answer::Error(message.to_string())).collect(),
            Answer::Value(value),
        )
    }

    pub fn with_detail(mut self, detail: &str) -> Self {
        self.detail = Some(detail.to_string());
        self
    }

    /// Cancels the token once evaluated, like a Ctrl-C while a check runs
    pub fn cancel_after(mut self, token: CancellationToken) -> Self {
        self.cancel_after = Some(token);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_answer(&self) -> Answer {
        let scripted = self
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front());
        match scripted {
            Some(answer) => {
                if let Ok(mut last) = self.last.lock() {
                    if matches!(answer, Answer::Value(_)) {
                        *last = answer.clone();
                    }
                }
                answer
            }
            None => self
                .last
                .lock()
                .map(|last| last.clone())
                .unwrap_or(Answer::Value(false)),
        }
    }
}

#[async_trait]
impl Check for ScriptedCheck {
    fn describe(&self) -> String {
        "scripted check".to_string()
    }

    async fn evaluate(&self, _ctx: &ExecContext) -> Result<CheckOutcome, ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = self.next_answer();
        if let Some(token) = &self.cancel_after {
            token.cancel();
        }
        match answer {
            Answer::Value(satisfied) => Ok(CheckOutcome {
                satisfied,
                detail: self.detail.clone(),
            }),
            Answer::Error(message) => Err(ActionError::Other(message)),
        }
    }
}
