use crate::catalog;
use crate::config::BootstrapConfig;
use crate::error::{ConfigError, Result};
use crate::events::EventLog;
use crate::storage::StateStore;
use crate::types::{Role, RunId, RunResult, RunState, StepReport, StepStatus};
use crate::workflow::dag::StepGraph;
use crate::workflow::executor::{self, Executor, PlannedStep};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-invocation options of `Orchestrator::run`
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Defaults to the role name, so re-running the same role resumes it
    pub run_id: Option<RunId>,
    /// Require recorded state to exist
    pub resume: bool,
    /// Report the plan without invoking any action or check
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Executed {
        run_id: RunId,
        result: RunResult,
        steps: Vec<StepReport>,
        state: RunState,
    },
    Planned {
        run_id: RunId,
        steps: Vec<PlannedStep>,
    },
}

/// Top-level driver: role → step graph → executor → result
pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    event_log: Arc<dyn EventLog>,
    config: BootstrapConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        event_log: Arc<dyn EventLog>,
        config: BootstrapConfig,
    ) -> Self {
        Self {
            store,
            event_log,
            config,
        }
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    /// Validated configuration and step graph for a role
    pub fn graph(&self, role: Role) -> Result<StepGraph> {
        self.config.validate(role)?;
        Ok(catalog::graph_for(role, &self.config)?)
    }

    /// Bootstrap this node for `role`
    pub async fn run(
        &self,
        role: Role,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let graph = self.graph(role)?;
        self.run_graph(role, &graph, options, cancel).await
    }

    /// Run an already built graph; the catalog-independent part of `run`
    pub async fn run_graph(
        &self,
        role: Role,
        graph: &StepGraph,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let run_id = resolve_run_id(role, options.run_id)?;

        if options.dry_run {
            let state = self.load_for_role(&run_id, role).await?;
            if options.resume && state.is_none() {
                return Err(ConfigError::NothingToResume(run_id).into());
            }
            return Ok(RunOutcome::Planned {
                steps: executor::plan(graph, state.as_ref()),
                run_id,
            });
        }

        let _lock = self.store.lock(&run_id)?;

        let mut state = match self.load_for_role(&run_id, role).await? {
            Some(state) => {
                tracing::info!(
                    "Resuming run {} (status {:?}, {} of {} steps succeeded)",
                    run_id,
                    state.status,
                    state.count(StepStatus::Succeeded),
                    state.records.len()
                );
                state
            }
            None if options.resume => return Err(ConfigError::NothingToResume(run_id).into()),
            None => {
                tracing::info!("Starting new run {} for role {}", run_id, role);
                RunState::new(run_id.clone(), role)
            }
        };

        let executor = Executor::new(self.store.clone(), self.event_log.clone(), cancel);
        let report = executor.run(graph, &mut state).await?;

        Ok(RunOutcome::Executed {
            run_id,
            result: report.result,
            steps: report.steps,
            state,
        })
    }

    /// Dry run for a role against its recorded state, if any
    pub async fn plan(&self, role: Role, run_id: Option<RunId>) -> Result<Vec<PlannedStep>> {
        let graph = self.graph(role)?;
        let run_id = resolve_run_id(role, run_id)?;
        let state = self.load_for_role(&run_id, role).await?;
        Ok(executor::plan(&graph, state.as_ref()))
    }

    /// Recorded state of a run
    pub async fn status(&self, run_id: &RunId) -> Result<Option<RunState>> {
        validate_run_id(run_id)?;
        Ok(self.store.load(run_id).await?)
    }

    pub async fn runs(&self) -> Result<Vec<RunId>> {
        Ok(self.store.list().await?)
    }

    /// Forget a run so the next invocation starts from scratch
    pub async fn reset(&self, run_id: &RunId) -> Result<bool> {
        validate_run_id(run_id)?;
        let _lock = self.store.lock(run_id)?;
        let removed = self.store.delete(run_id).await?;
        if removed {
            tracing::info!("Deleted state of run {}", run_id);
        }
        Ok(removed)
    }

    async fn load_for_role(&self, run_id: &RunId, role: Role) -> Result<Option<RunState>> {
        let state = self.store.load(run_id).await?;
        if let Some(state) = &state {
            if state.role != role {
                return Err(ConfigError::RoleMismatch {
                    run_id: run_id.clone(),
                    stored: state.role,
                    requested: role,
                }
                .into());
            }
        }
        Ok(state)
    }
}

fn validate_run_id(run_id: &RunId) -> Result<(), ConfigError> {
    if run_id.is_valid() {
        Ok(())
    } else {
        Err(ConfigError::InvalidRunId(run_id.0.clone()))
    }
}

fn resolve_run_id(role: Role, run_id: Option<RunId>) -> Result<RunId, ConfigError> {
    let run_id = run_id.unwrap_or_else(|| RunId::for_role(role));
    validate_run_id(&run_id)?;
    Ok(run_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{OrchestratorError, StateStoreError};
    use crate::events::MemoryEventLog;
    use crate::storage::MemoryStateStore;
    use crate::testing::{scripted_step, ScriptedAction};
    use crate::types::StepId;
    use crate::workflow::executor::PlanDisposition;

    fn orchestrator(store: Arc<MemoryStateStore>) -> Orchestrator {
        Orchestrator::new(
            store,
            Arc::new(MemoryEventLog::new()),
            BootstrapConfig::default(),
        )
    }

    fn two_steps(a: &ScriptedAction, b: &ScriptedAction) -> StepGraph {
        StepGraph::build(vec![
            scripted_step("a", a.clone()).build(),
            scripted_step("b", b.clone()).depends_on(["a"]).build(),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn default_run_id_is_role_name() {
        let store = Arc::new(MemoryStateStore::new());
        let orch = orchestrator(store.clone());
        let graph = two_steps(&ScriptedAction::succeeding(), &ScriptedAction::succeeding());

        let outcome = orch
            .run_graph(
                Role::Worker,
                &graph,
                RunOptions::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        match outcome {
            RunOutcome::Executed { run_id, result, .. } => {
                assert_eq!(run_id, RunId::new("worker"));
                assert_eq!(result, RunResult::Succeeded);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(store.load(&RunId::new("worker")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn role_mismatch_is_a_config_error() {
        let store = Arc::new(MemoryStateStore::new());
        store
            .insert(RunState::new(RunId::new("node1"), Role::ControlPlane))
            .await;
        let orch = orchestrator(store);
        let action = ScriptedAction::succeeding();
        let graph = two_steps(&action, &action);

        let err = orch
            .run_graph(
                Role::Worker,
                &graph,
                RunOptions {
                    run_id: Some(RunId::new("node1")),
                    ..Default::default()
                },
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::Config(ConfigError::RoleMismatch { .. })
        ));
        assert_eq!(action.calls(), 0);
    }

    #[tokio::test]
    async fn resume_requires_prior_state() {
        let orch = orchestrator(Arc::new(MemoryStateStore::new()));
        let action = ScriptedAction::succeeding();
        let graph = two_steps(&action, &action);

        let err = orch
            .run_graph(
                Role::ControlPlane,
                &graph,
                RunOptions {
                    resume: true,
                    ..Default::default()
                },
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::Config(ConfigError::NothingToResume(_))
        ));
        assert_eq!(action.calls(), 0);
    }

    #[tokio::test]
    async fn invalid_run_id_is_rejected() {
        let orch = orchestrator(Arc::new(MemoryStateStore::new()));
        let graph = two_steps(&ScriptedAction::succeeding(), &ScriptedAction::succeeding());

        let err = orch
            .run_graph(
                Role::ControlPlane,
                &graph,
                RunOptions {
                    run_id: Some(RunId::new("../../etc/passwd")),
                    ..Default::default()
                },
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Config(ConfigError::InvalidRunId(_))
        ));
    }

    #[tokio::test]
    async fn dry_run_invokes_nothing() {
        let store = Arc::new(MemoryStateStore::new());
        let orch = orchestrator(store.clone());
        let a = ScriptedAction::succeeding();
        let b = ScriptedAction::succeeding();
        let graph = two_steps(&a, &b);

        let outcome = orch
            .run_graph(
                Role::ControlPlane,
                &graph,
                RunOptions {
                    dry_run: true,
                    ..Default::default()
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        match outcome {
            RunOutcome::Planned { steps, .. } => {
                assert_eq!(steps.len(), 2);
                assert!(steps.iter().all(|s| s.disposition == PlanDisposition::Run));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(a.calls() + b.calls(), 0);
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_invocation_is_locked_out() {
        let store = Arc::new(MemoryStateStore::new());
        let orch = orchestrator(store.clone());
        let graph = two_steps(&ScriptedAction::succeeding(), &ScriptedAction::succeeding());

        let _held = store.lock(&RunId::new("control-plane")).unwrap();
        let err = orch
            .run_graph(
                Role::ControlPlane,
                &graph,
                RunOptions::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::StateStore(StateStoreError::Locked { .. })
        ));
    }

    #[tokio::test]
    async fn reset_forgets_the_run() {
        let store = Arc::new(MemoryStateStore::new());
        let orch = orchestrator(store.clone());
        let graph = two_steps(&ScriptedAction::succeeding(), &ScriptedAction::failing("boom"));

        orch.run_graph(
            Role::ControlPlane,
            &graph,
            RunOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let run_id = RunId::new("control-plane");
        let state = orch.status(&run_id).await.unwrap().unwrap();
        assert_eq!(state.status_of(&StepId::new("b")), Some(StepStatus::Failed));
        assert_eq!(orch.runs().await.unwrap(), vec![run_id.clone()]);

        assert!(orch.reset(&run_id).await.unwrap());
        assert!(orch.status(&run_id).await.unwrap().is_none());
        assert!(!orch.reset(&run_id).await.unwrap());
    }

    #[tokio::test]
    async fn catalog_graph_requires_valid_config() {
        let mut config = BootstrapConfig::default();
        config.join.command_file = std::path::PathBuf::from("/nonexistent/kubestrap/join");
        let orch = Orchestrator::new(
            Arc::new(MemoryStateStore::new()),
            Arc::new(MemoryEventLog::new()),
            config,
        );

        assert!(matches!(
            orch.graph(Role::Worker),
            Err(OrchestratorError::Config(ConfigError::Invalid(_)))
        ));
        assert!(orch.graph(Role::ControlPlane).is_ok());

        let planned = orch.plan(Role::ControlPlane, None).await.unwrap();
        assert_eq!(planned[0].step_id, StepId::new("configure-hosts"));
    }
}
