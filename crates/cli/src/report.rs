use anyhow::Result;
use kubestrap_core::workflow::{PlanDisposition, PlannedStep};
use kubestrap_core::{RunId, RunOutcome, RunResult, RunState, StepOutcome, StepReport, StepStatus};
use serde_json::json;

pub fn print_outcome(outcome: &RunOutcome, json: bool) -> Result<()> {
    match outcome {
        RunOutcome::Planned { run_id, steps } => {
            if json {
                let value = json!({ "run_id": run_id, "dry_run": true, "steps": steps });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("Dry run of '{}', nothing will be changed", run_id);
                print_plan_lines(steps);
            }
        }
        RunOutcome::Executed {
            run_id,
            result,
            steps,
            ..
        } => {
            if json {
                let value = json!({ "run_id": run_id, "result": result, "steps": steps });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("Run '{}'", run_id);
                for step in steps {
                    println!("  {:<32} {}", step.step_id, describe_outcome(step));
                }
                println!("{}", summary_line(result));
            }
        }
    }
    Ok(())
}

pub fn print_plan(steps: &[PlannedStep], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(steps)?);
    } else {
        print_plan_lines(steps);
    }
    Ok(())
}

fn print_plan_lines(steps: &[PlannedStep]) {
    for (i, step) in steps.iter().enumerate() {
        let marker = match step.disposition {
            PlanDisposition::AlreadySucceeded => "done",
            PlanDisposition::RunUnlessSatisfied => "check",
            PlanDisposition::Run => "run",
        };
        println!("{:>3}. [{:<5}] {} - {}", i + 1, marker, step.step_id, step.description);
        if !step.depends_on.is_empty() {
            let deps: Vec<&str> = step.depends_on.iter().map(|d| d.as_str()).collect();
            println!("           after: {}", deps.join(", "));
        }
        if let Some(precondition) = &step.precondition {
            println!("           skip if: {}", precondition);
        }
        println!("           action: {}", step.action);
        if let Some(verify) = &step.verify {
            println!("           verify: {}", verify);
        }
    }
}

pub fn print_state(state: &RunState, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(state)?);
        return Ok(());
    }

    println!(
        "Run '{}' ({}) status {:?}, updated {}",
        state.run_id,
        state.role,
        state.status,
        state.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "  {} succeeded, {} failed, {} skipped, {} pending",
        state.count(StepStatus::Succeeded),
        state.count(StepStatus::Failed),
        state.count(StepStatus::Skipped),
        state.count(StepStatus::Pending),
    );
    for record in &state.records {
        let mut line = format!(
            "  {:<32} {:<9} attempts={}",
            record.step_id,
            format!("{:?}", record.status).to_lowercase(),
            record.attempts
        );
        if let Some(reason) = &record.skip_reason {
            line.push_str(&format!(" ({})", reason));
        }
        println!("{}", line);
        if let Some(error) = &record.last_error {
            println!("      last error: {}", error);
        }
    }
    if let Some(next) = state.resume_point() {
        println!("Next run resumes at '{}'", next);
    }
    Ok(())
}

pub fn print_runs(runs: &[RunId], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(runs)?);
    } else if runs.is_empty() {
        println!("No runs recorded");
    } else {
        for run in runs {
            println!("{}", run);
        }
    }
    Ok(())
}

fn describe_outcome(step: &StepReport) -> String {
    match &step.outcome {
        StepOutcome::Executed { attempts: 1 } => "done".to_string(),
        StepOutcome::Executed { attempts } => format!("done after {} attempts", attempts),
        StepOutcome::AlreadySatisfied => "already satisfied".to_string(),
        StepOutcome::Resumed => "done earlier".to_string(),
        StepOutcome::Failed { attempts, error } => {
            format!("FAILED after {} attempts: {}", attempts, error)
        }
        StepOutcome::SkippedDependencyFailed { dependency } => {
            format!("skipped, '{}' failed", dependency)
        }
        StepOutcome::NotAttempted => "not attempted".to_string(),
    }
}

fn summary_line(result: &RunResult) -> String {
    match result {
        RunResult::Succeeded => "Bootstrap succeeded".to_string(),
        RunResult::Failed { .. } => format!("Bootstrap {}; rerun to retry from that step", result),
        RunResult::PartiallyComplete { remaining, .. } => match remaining.first() {
            Some(next) => format!("Bootstrap interrupted; rerun to resume at '{}'", next),
            None => "Bootstrap interrupted".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubestrap_core::StepId;

    #[test]
    fn outcomes_read_naturally() {
        let report = |outcome| StepReport {
            step_id: StepId::new("kubeadm-init"),
            outcome,
        };
        assert_eq!(describe_outcome(&report(StepOutcome::Executed { attempts: 1 })), "done");
        assert_eq!(
            describe_outcome(&report(StepOutcome::Executed { attempts: 3 })),
            "done after 3 attempts"
        );
        assert_eq!(
            describe_outcome(&report(StepOutcome::SkippedDependencyFailed {
                dependency: StepId::new("install-containerd"),
            })),
            "skipped, 'install-containerd' failed"
        );
    }

    #[test]
    fn summary_names_resume_point() {
        let result = RunResult::PartiallyComplete {
            completed: vec![StepId::new("configure-hosts")],
            remaining: vec![StepId::new("disable-swap"), StepId::new("kubeadm-init")],
        };
        assert_eq!(
            summary_line(&result),
            "Bootstrap interrupted; rerun to resume at 'disable-swap'"
        );
    }
}
