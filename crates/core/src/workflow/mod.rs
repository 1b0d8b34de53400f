pub mod dag;
pub mod executor;
pub mod gate;
pub mod step_executor;

pub use dag::StepGraph;
pub use executor::{
    plan, reconcile, ExecutionReport, Executor, PlanDisposition, PlannedStep, Reconciliation,
};
pub use gate::{PollPolicy, VerificationGate};
pub use step_executor::StepExecutor;
