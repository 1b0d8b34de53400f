//! Declarative bootstrap of kubeadm clusters: idempotent steps, dependency
//! ordering, verification gates and resumable run state.

pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod step;
pub mod storage;
pub mod types;
pub mod workflow;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::BootstrapConfig;
pub use error::{ActionError, ConfigError, GateError, OrchestratorError, StateStoreError};
pub use orchestrator::{Orchestrator, RunOptions, RunOutcome};
pub use step::{Action, ActionOutput, Check, CheckOutcome, ExecContext, Step, StepBuilder};
pub use types::*;
