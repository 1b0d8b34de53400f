use super::dag::StepGraph;
use super::step_executor::StepExecutor;
use crate::error::{ActionError, StateStoreError};
use crate::events::{Event, EventLog, EventType};
use crate::step::{ExecContext, Step};
use crate::storage::StateStore;
use crate::types::{
    ExecutionRecord, RunId, RunResult, RunState, RunStatus, Satisfaction, SkipReason, StepId,
    StepOutcome, StepReport, StepStatus,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// What happened during one `Executor::run`
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub result: RunResult,
    pub steps: Vec<StepReport>,
}

/// What a dry run would do with a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanDisposition {
    /// Already succeeded in this run's recorded state
    AlreadySucceeded,
    /// Will run unless its precondition already holds
    RunUnlessSatisfied,
    Run,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedStep {
    pub step_id: StepId,
    pub description: String,
    pub depends_on: Vec<StepId>,
    pub action: String,
    pub precondition: Option<String>,
    pub verify: Option<String>,
    pub disposition: PlanDisposition,
}

/// Changes made while aligning stored records with the current graph
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub added: Vec<StepId>,
    pub dropped: Vec<StepId>,
    /// Steps found Running, i.e. cut off by a crash or kill
    pub interrupted: Vec<StepId>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.dropped.is_empty() && self.interrupted.is_empty()
    }
}

/// Align a run's records with the graph: one record per step, in execution order
///
/// A step left Running by a dead process is recorded Failed, since neither its
/// action nor its verification is known to have completed.
pub fn reconcile(graph: &StepGraph, state: &mut RunState) -> Reconciliation {
    let mut summary = Reconciliation::default();
    let mut existing: HashMap<StepId, ExecutionRecord> = state
        .records
        .drain(..)
        .map(|r| (r.step_id.clone(), r))
        .collect();

    for id in graph.topological_ids() {
        let record = match existing.remove(&id) {
            Some(mut record) => {
                if record.status == StepStatus::Running {
                    record.status = StepStatus::Failed;
                    record.finished_at = Some(Utc::now());
                    record.last_error = Some(format!(
                        "interrupted during attempt {} before completion",
                        record.attempts.max(1)
                    ));
                    summary.interrupted.push(id.clone());
                }
                record
            }
            None => {
                summary.added.push(id.clone());
                ExecutionRecord::pending(id)
            }
        };
        state.records.push(record);
    }

    let mut dropped: Vec<StepId> = existing.into_keys().collect();
    dropped.sort();
    summary.dropped = dropped;

    if state.status == RunStatus::Running {
        state.status = RunStatus::Interrupted;
    }

    summary
}

/// Dry run: what `Executor::run` would do, without invoking any action or check
pub fn plan(graph: &StepGraph, state: Option<&RunState>) -> Vec<PlannedStep> {
    graph
        .topological_order()
        .into_iter()
        .map(|step| {
            let succeeded = state
                .and_then(|s| s.status_of(&step.id))
                .is_some_and(|status| status == StepStatus::Succeeded);
            let disposition = if succeeded {
                PlanDisposition::AlreadySucceeded
            } else if step.precondition.is_some() {
                PlanDisposition::RunUnlessSatisfied
            } else {
                PlanDisposition::Run
            };

            PlannedStep {
                step_id: step.id.clone(),
                description: step.description.clone(),
                depends_on: step.depends_on.iter().cloned().collect(),
                action: step.action.describe(),
                precondition: step.precondition.as_ref().map(|c| c.describe()),
                verify: step.verify.as_ref().map(|v| v.check.describe()),
                disposition,
            }
        })
        .collect()
}

/// Walks a step graph in topological order, persisting every transition
pub struct Executor {
    store: Arc<dyn StateStore>,
    event_log: Arc<dyn EventLog>,
    cancel: CancellationToken,
}

enum StepEnd {
    Done(StepOutcome),
    Failed { error: String, attempts: u32 },
    Interrupted { error: String, attempts: u32 },
    /// Cancelled before the first attempt; the record is still Pending
    NotStarted,
}

impl Executor {
    pub fn new(
        store: Arc<dyn StateStore>,
        event_log: Arc<dyn EventLog>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            event_log,
            cancel,
        }
    }

    /// Execute the graph against `state`
    ///
    /// Succeeded records are kept (resume); Failed and Skipped records are
    /// reset and tried again. Halts at the first step that exhausts its
    /// retries after marking its dependents Skipped.
    pub async fn run(
        &self,
        graph: &StepGraph,
        state: &mut RunState,
    ) -> Result<ExecutionReport, StateStoreError> {
        let started = Instant::now();
        let run_id = state.run_id.clone();

        let reconciliation = reconcile(graph, state);
        if !reconciliation.added.is_empty() && state.version > 0 {
            tracing::info!("Run {}: new steps {:?}", run_id, reconciliation.added);
        }
        if !reconciliation.dropped.is_empty() {
            tracing::warn!(
                "Run {}: dropping records of removed steps {:?}",
                run_id,
                reconciliation.dropped
            );
        }
        if !reconciliation.interrupted.is_empty() {
            tracing::warn!(
                "Run {}: steps interrupted by an earlier process, recorded failed: {:?}",
                run_id,
                reconciliation.interrupted
            );
            self.persist(state).await?;
        }

        let resumed = state.status != RunStatus::NotStarted
            || state.records.iter().any(|r| r.status != StepStatus::Pending);
        for record in &mut state.records {
            if matches!(record.status, StepStatus::Failed | StepStatus::Skipped) {
                record.reset();
            }
        }
        state.status = RunStatus::Running;
        self.persist(state).await?;

        tracing::info!(
            "Starting run {} ({} steps, {})",
            run_id,
            graph.len(),
            if resumed { "resuming" } else { "fresh" }
        );
        self.emit(
            &run_id,
            EventType::RunStarted {
                role: state.role,
                resumed,
            },
        )
        .await;

        let mut outcomes: HashMap<StepId, StepOutcome> = HashMap::new();
        let mut failure: Option<(StepId, String)> = None;
        let mut interrupted = false;

        for step in graph.topological_order() {
            if state.status_of(&step.id) == Some(StepStatus::Succeeded) {
                tracing::info!("Step {} already succeeded, skipping", step.id);
                outcomes.insert(step.id.clone(), StepOutcome::Resumed);
                continue;
            }

            if self.cancel.is_cancelled() {
                tracing::warn!("Run {} cancelled before step {}", run_id, step.id);
                interrupted = true;
                break;
            }

            if let Some(dependency) = graph.dependencies(&step.id).into_iter().find(|d| {
                matches!(
                    state.status_of(d),
                    Some(StepStatus::Failed | StepStatus::Skipped)
                )
            }) {
                let reason = SkipReason::DependencyFailed {
                    dependency: dependency.clone(),
                };
                if let Some(record) = state.record_mut(&step.id) {
                    record.status = StepStatus::Skipped;
                    record.skip_reason = Some(reason.clone());
                    record.finished_at = Some(Utc::now());
                }
                self.persist(state).await?;
                tracing::info!("Skipping step {}: {}", step.id, reason);
                self.emit(
                    &run_id,
                    EventType::StepSkipped {
                        step_id: step.id.clone(),
                        reason: reason.to_string(),
                    },
                )
                .await;
                outcomes.insert(
                    step.id.clone(),
                    StepOutcome::SkippedDependencyFailed { dependency },
                );
                continue;
            }

            match self.execute_step(step, state).await? {
                StepEnd::Done(outcome) => {
                    outcomes.insert(step.id.clone(), outcome);
                }
                StepEnd::Failed { error, attempts } => {
                    outcomes.insert(
                        step.id.clone(),
                        StepOutcome::Failed {
                            attempts,
                            error: error.clone(),
                        },
                    );
                    for dependent in self.skip_dependents(graph, step, state).await? {
                        outcomes.insert(
                            dependent,
                            StepOutcome::SkippedDependencyFailed {
                                dependency: step.id.clone(),
                            },
                        );
                    }
                    failure = Some((step.id.clone(), error));
                    break;
                }
                StepEnd::Interrupted { error, attempts } => {
                    outcomes.insert(step.id.clone(), StepOutcome::Failed { attempts, error });
                    interrupted = true;
                    break;
                }
                StepEnd::NotStarted => {
                    tracing::info!("Run cancelled before step {} started", step.id);
                    interrupted = true;
                    break;
                }
            }
        }

        let steps: Vec<StepReport> = graph
            .topological_ids()
            .into_iter()
            .map(|id| {
                let outcome = outcomes.remove(&id).unwrap_or(StepOutcome::NotAttempted);
                StepReport {
                    step_id: id,
                    outcome,
                }
            })
            .collect();

        let result = match failure {
            Some((step, error)) => {
                state.status = RunStatus::Failed;
                RunResult::Failed { step, error }
            }
            None if state.all_succeeded() => {
                state.status = RunStatus::Succeeded;
                RunResult::Succeeded
            }
            None => {
                if !interrupted {
                    tracing::warn!("Run {} stopped with unfinished steps", run_id);
                }
                state.status = RunStatus::Interrupted;
                let (completed, remaining): (Vec<_>, Vec<_>) = state
                    .records
                    .iter()
                    .partition(|r| r.status == StepStatus::Succeeded);
                RunResult::PartiallyComplete {
                    completed: completed.into_iter().map(|r| r.step_id.clone()).collect(),
                    remaining: remaining.into_iter().map(|r| r.step_id.clone()).collect(),
                }
            }
        };
        self.persist(state).await?;

        let duration = started.elapsed();
        self.emit(
            &run_id,
            EventType::RunFinished {
                status: state.status,
                duration_secs: duration.as_secs(),
            },
        )
        .await;

        match &result {
            RunResult::Failed { step, error } => {
                tracing::error!("Run {} failed at step {}: {}", run_id, step, error)
            }
            other => tracing::info!("Run {} finished in {:?}: {}", run_id, duration, other),
        }

        Ok(ExecutionReport { result, steps })
    }

    async fn execute_step(
        &self,
        step: &Step,
        state: &mut RunState,
    ) -> Result<StepEnd, StateStoreError> {
        let run_id = state.run_id.clone();
        let idx = record_index(state, &step.id);
        let step_started = Instant::now();
        let ctx = ExecContext::new(step.id.clone(), self.cancel.clone()).with_timeout(step.timeout);

        if StepExecutor::precondition_holds(step, &ctx).await {
            tracing::info!("Step {} already satisfied, action not run", step.id);
            let now = Utc::now();
            let record = &mut state.records[idx];
            record.status = StepStatus::Succeeded;
            record.satisfied_by = Some(Satisfaction::Precondition);
            record.started_at = Some(now);
            record.finished_at = Some(now);
            self.persist(state).await?;
            self.emit(
                &run_id,
                EventType::StepSucceeded {
                    step_id: step.id.clone(),
                    satisfied_by: Satisfaction::Precondition,
                    attempts: 0,
                    duration_ms: step_started.elapsed().as_millis() as u64,
                },
            )
            .await;
            return Ok(StepEnd::Done(StepOutcome::AlreadySatisfied));
        }
        if self.cancel.is_cancelled() {
            return Ok(StepEnd::NotStarted);
        }

        let max_attempts = step.retry.max_attempts();
        for attempt in 1..=max_attempts {
            {
                let record = &mut state.records[idx];
                record.status = StepStatus::Running;
                record.attempts = attempt;
                if record.started_at.is_none() {
                    record.started_at = Some(Utc::now());
                }
            }
            self.persist(state).await?;
            self.emit(
                &run_id,
                EventType::StepStarted {
                    step_id: step.id.clone(),
                    attempt,
                },
            )
            .await;

            let ctx = ctx.clone().with_attempt(attempt);
            let error = match StepExecutor::attempt(step, &ctx).await {
                Ok(output) => {
                    if let Some(detail) = output.detail {
                        tracing::debug!("Step {} output: {}", step.id, detail);
                    }
                    let record = &mut state.records[idx];
                    record.status = StepStatus::Succeeded;
                    record.satisfied_by = Some(Satisfaction::Action);
                    record.last_error = None;
                    record.finished_at = Some(Utc::now());
                    self.persist(state).await?;
                    tracing::info!("Step {} succeeded (attempt {})", step.id, attempt);
                    self.emit(
                        &run_id,
                        EventType::StepSucceeded {
                            step_id: step.id.clone(),
                            satisfied_by: Satisfaction::Action,
                            attempts: attempt,
                            duration_ms: step_started.elapsed().as_millis() as u64,
                        },
                    )
                    .await;
                    return Ok(StepEnd::Done(StepOutcome::Executed { attempts: attempt }));
                }
                Err(ActionError::Cancelled) => {
                    let error = format!("interrupted during attempt {}", attempt);
                    return self.interrupt_step(step, state, idx, attempt, error).await;
                }
                Err(e) => e.to_string(),
            };

            let will_retry = attempt < max_attempts;
            state.records[idx].last_error = Some(error.clone());
            self.emit(
                &run_id,
                EventType::StepFailed {
                    step_id: step.id.clone(),
                    attempt,
                    error: error.clone(),
                    will_retry,
                },
            )
            .await;

            if !will_retry {
                let record = &mut state.records[idx];
                record.status = StepStatus::Failed;
                record.finished_at = Some(Utc::now());
                self.persist(state).await?;
                tracing::error!(
                    "Step {} failed after {} attempt(s): {}",
                    step.id,
                    attempt,
                    error
                );
                return Ok(StepEnd::Failed {
                    error,
                    attempts: attempt,
                });
            }

            tracing::warn!("Step {} attempt {} failed: {}", step.id, attempt, error);
            self.persist(state).await?;
            if StepExecutor::backoff(step, attempt - 1, &ctx).await.is_err() {
                let error = format!(
                    "{}; interrupted while waiting to retry after attempt {}",
                    error, attempt
                );
                return self.interrupt_step(step, state, idx, attempt, error).await;
            }
        }

        // max_attempts is at least 1, so the loop always returns
        let error = state.records[idx]
            .last_error
            .clone()
            .unwrap_or_else(|| "no attempt made".to_string());
        Ok(StepEnd::Failed { error, attempts: 0 })
    }

    /// Conservatively record a step cut off by cancellation as failed
    async fn interrupt_step(
        &self,
        step: &Step,
        state: &mut RunState,
        idx: usize,
        attempt: u32,
        error: String,
    ) -> Result<StepEnd, StateStoreError> {
        let record = &mut state.records[idx];
        record.status = StepStatus::Failed;
        record.last_error = Some(error.clone());
        record.finished_at = Some(Utc::now());
        self.persist(state).await?;

        tracing::warn!("Step {} {}", step.id, error);
        self.emit(
            &state.run_id,
            EventType::StepFailed {
                step_id: step.id.clone(),
                attempt,
                error: error.clone(),
                will_retry: false,
            },
        )
        .await;

        Ok(StepEnd::Interrupted {
            error,
            attempts: attempt,
        })
    }

    /// Mark every transitive dependent of a failed step Skipped
    async fn skip_dependents(
        &self,
        graph: &StepGraph,
        failed: &Step,
        state: &mut RunState,
    ) -> Result<Vec<StepId>, StateStoreError> {
        let dependents = graph.transitive_dependents(&failed.id);
        let reason = SkipReason::DependencyFailed {
            dependency: failed.id.clone(),
        };

        for id in &dependents {
            if let Some(record) = state.record_mut(id) {
                record.status = StepStatus::Skipped;
                record.skip_reason = Some(reason.clone());
                record.finished_at = Some(Utc::now());
            }
            tracing::info!("Skipping step {}: {}", id, reason);
        }
        if dependents.is_empty() {
            return Ok(dependents);
        }
        self.persist(state).await?;

        for id in &dependents {
            self.emit(
                &state.run_id,
                EventType::StepSkipped {
                    step_id: id.clone(),
                    reason: reason.to_string(),
                },
            )
            .await;
        }
        Ok(dependents)
    }

    async fn persist(&self, state: &mut RunState) -> Result<(), StateStoreError> {
        let run_id = state.run_id.clone();
        self.store.save(&run_id, state).await
    }

    /// Event log failures never stop a run; the state store is the source of truth
    async fn emit(&self, run_id: &RunId, event_type: EventType) {
        if let Err(e) = self
            .event_log
            .append(Event::new(run_id.clone(), event_type))
            .await
        {
            tracing::warn!("Failed to append event for run {}: {}", run_id, e);
        }
    }
}

fn record_index(state: &mut RunState, step_id: &StepId) -> usize {
    match state.records.iter().position(|r| &r.step_id == step_id) {
        Some(idx) => idx,
        None => {
            state.records.push(ExecutionRecord::pending(step_id.clone()));
            state.records.len() - 1
        }
    }
}
