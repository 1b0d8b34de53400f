//! Readiness checks read from the cluster API through `kubectl -o json`.

use super::command::{shell_quote, ShellCommand};
use crate::error::ActionError;
use crate::step::{Check, CheckOutcome, ExecContext};
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;

fn kubectl(kubeconfig: &Path, args: &str) -> ShellCommand {
    ShellCommand::new(format!(
        "kubectl --kubeconfig {} {}",
        shell_quote(&kubeconfig.display().to_string()),
        args
    ))
}

async fn kubectl_json(command: &ShellCommand) -> Result<Result<Value, String>, ActionError> {
    let output = command.output().await?;
    if !output.success() {
        let reason = output.stderr.trim();
        return Ok(Err(if reason.is_empty() {
            "kubectl failed".to_string()
        } else {
            reason.to_string()
        }));
    }
    Ok(serde_json::from_str(&output.stdout).map_err(|e| format!("unreadable kubectl output: {}", e)))
}

/// All pods matching a label selector are Ready (and at least one exists)
pub struct PodsReady {
    namespace: String,
    selector: String,
    command: ShellCommand,
}

impl PodsReady {
    pub fn new(kubeconfig: &Path, namespace: &str, selector: &str) -> Self {
        let command = kubectl(
            kubeconfig,
            &format!(
                "get pods --namespace {} --selector {} -o json",
                shell_quote(namespace),
                shell_quote(selector)
            ),
        );
        Self {
            namespace: namespace.to_string(),
            selector: selector.to_string(),
            command,
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.command = self.command.with_env(env);
        self
    }
}

#[async_trait]
impl Check for PodsReady {
    fn describe(&self) -> String {
        format!("pods {} in {} are Ready", self.selector, self.namespace)
    }

    async fn evaluate(&self, _ctx: &ExecContext) -> Result<CheckOutcome, ActionError> {
        Ok(match kubectl_json(&self.command).await? {
            Ok(list) => pods_ready(&list),
            Err(reason) => CheckOutcome::unsatisfied(reason),
        })
    }
}

/// Every registered node reports the Ready condition
pub struct NodesReady {
    command: ShellCommand,
}

impl NodesReady {
    pub fn new(kubeconfig: &Path) -> Self {
        Self {
            command: kubectl(kubeconfig, "get nodes -o json"),
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.command = self.command.with_env(env);
        self
    }
}

#[async_trait]
impl Check for NodesReady {
    fn describe(&self) -> String {
        "all nodes are Ready".to_string()
    }

    async fn evaluate(&self, _ctx: &ExecContext) -> Result<CheckOutcome, ActionError> {
        Ok(match kubectl_json(&self.command).await? {
            Ok(list) => nodes_ready(&list),
            Err(reason) => CheckOutcome::unsatisfied(reason),
        })
    }
}

fn items(list: &Value) -> &[Value] {
    list.get("items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn name(object: &Value) -> &str {
    object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or("<unnamed>")
}

fn condition_true(object: &Value, kind: &str) -> bool {
    object
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some(kind)
                    && c.get("status").and_then(Value::as_str) == Some("True")
            })
        })
}

/// Evaluate a `PodList`; completed pods (e.g. admission jobs) are ignored
pub fn pods_ready(list: &Value) -> CheckOutcome {
    let pods: Vec<&Value> = items(list)
        .iter()
        .filter(|pod| pod.pointer("/status/phase").and_then(Value::as_str) != Some("Succeeded"))
        .collect();

    if pods.is_empty() {
        return CheckOutcome::unsatisfied("no pods found");
    }

    let not_ready: Vec<&str> = pods
        .iter()
        .filter(|pod| !condition_true(pod, "Ready"))
        .map(|pod| name(pod))
        .collect();

    if not_ready.is_empty() {
        CheckOutcome::satisfied().with_detail(format!("{} pod(s) Ready", pods.len()))
    } else {
        CheckOutcome::unsatisfied(format!(
            "{}/{} pod(s) not Ready: {}",
            not_ready.len(),
            pods.len(),
            not_ready.join(", ")
        ))
    }
}

/// Evaluate a `NodeList`
pub fn nodes_ready(list: &Value) -> CheckOutcome {
    let nodes = items(list);
    if nodes.is_empty() {
        return CheckOutcome::unsatisfied("no nodes registered");
    }

    let not_ready: Vec<&str> = nodes
        .iter()
        .filter(|n| !condition_true(n, "Ready"))
        .map(name)
        .collect();

    if not_ready.is_empty() {
        CheckOutcome::satisfied().with_detail(format!("{} node(s) Ready", nodes.len()))
    } else {
        CheckOutcome::unsatisfied(format!("node(s) not Ready: {}", not_ready.join(", ")))
    }
}
