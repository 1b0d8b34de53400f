//! Step definitions for a kubeadm + containerd + Flannel cluster on RPM-based hosts.
//!
//! Every step is idempotent: where the effect can be observed, a precondition
//! short-circuits the action on re-runs.

pub mod command;
mod common;
mod control_plane;
pub mod kube;
mod worker;

use crate::config::BootstrapConfig;
use crate::error::ConfigError;
use crate::step::{Step, StepBuilder};
use crate::types::{RetryPolicy, Role, StepId};
use crate::workflow::dag::StepGraph;
use crate::workflow::gate::PollPolicy;
use command::{CommandCheck, ShellAction, ShellCommand};
use kube::{NodesReady, PodsReady};
use std::sync::Arc;
use std::time::Duration;

pub use command::shell_quote;

/// Builds catalog steps with the execution settings and proxy environment applied
pub(crate) struct StepFactory<'a> {
    config: &'a BootstrapConfig,
    retry: RetryPolicy,
    timeout: Duration,
    poll: PollPolicy,
}

impl<'a> StepFactory<'a> {
    pub(crate) fn new(config: &'a BootstrapConfig) -> Self {
        Self {
            config,
            retry: config.execution.retry_policy(),
            timeout: config.execution.step_timeout(),
            poll: config.execution.poll_policy(),
        }
    }

    pub(crate) fn config(&self) -> &BootstrapConfig {
        self.config
    }

    pub(crate) fn poll(&self) -> PollPolicy {
        self.poll
    }

    pub(crate) fn command(&self, script: impl Into<String>) -> ShellCommand {
        ShellCommand::new(script).with_env(self.config.command_env())
    }

    /// A step whose action is a shell script
    pub(crate) fn shell(&self, id: &str, description: &str, script: impl Into<String>) -> StepBuilder {
        let action = ShellAction::new(description, self.command(script));
        StepBuilder::new(StepId::new(id), Arc::new(action))
            .retry(self.retry)
            .timeout(self.timeout)
    }

    pub(crate) fn check(&self, description: &str, script: impl Into<String>) -> CommandCheck {
        CommandCheck::new(description, self.command(script))
    }

    pub(crate) fn pods_ready(&self, namespace: &str, selector: &str) -> PodsReady {
        PodsReady::new(&self.config.cluster.kubeconfig, namespace, selector)
            .with_env(self.config.command_env())
    }

    pub(crate) fn nodes_ready(&self) -> NodesReady {
        NodesReady::new(&self.config.cluster.kubeconfig).with_env(self.config.command_env())
    }
}

/// Steps for a role, in declaration order
pub fn steps_for(role: Role, config: &BootstrapConfig) -> Vec<Step> {
    let factory = StepFactory::new(config);
    let mut steps = common::steps(&factory, role);
    match role {
        Role::ControlPlane => steps.extend(control_plane::steps(&factory)),
        Role::Worker => steps.extend(worker::steps(&factory)),
    }
    steps
}

/// The validated dependency graph for a role
pub fn graph_for(role: Role, config: &BootstrapConfig) -> Result<StepGraph, ConfigError> {
    StepGraph::build(steps_for(role, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostEntry;

    fn position(order: &[StepId], id: &str) -> usize {
        order
            .iter()
            .position(|s| s.as_str() == id)
            .unwrap_or_else(|| panic!("{id} not in order"))
    }

    fn ids(graph: &StepGraph) -> Vec<String> {
        graph
            .topological_ids()
            .into_iter()
            .map(|id| id.0)
            .collect()
    }

    fn worker_config() -> BootstrapConfig {
        let mut config = BootstrapConfig::default();
        config.join.command = Some(
            "kubeadm join 192.168.1.10:6443 --token abc.def --discovery-token-ca-cert-hash sha256:00"
                .to_string(),
        );
        config
    }

    #[test]
    fn control_plane_graph_orders_bootstrap() {
        let graph = graph_for(Role::ControlPlane, &BootstrapConfig::default()).unwrap();
        let order = graph.topological_ids();

        assert!(position(&order, "disable-swap") < position(&order, "install-kubernetes-packages"));
        assert!(position(&order, "load-kernel-modules") < position(&order, "configure-sysctl"));
        assert!(position(&order, "install-containerd") < position(&order, "kubeadm-init"));
        assert!(position(&order, "kubeadm-init") < position(&order, "deploy-flannel"));
        assert!(position(&order, "deploy-flannel") < position(&order, "wait-control-plane-ready"));
        assert!(
            position(&order, "wait-control-plane-ready") < position(&order, "install-ingress-nginx")
        );
        assert!(
            position(&order, "wait-control-plane-ready")
                < position(&order, "export-join-command")
        );
        assert!(!graph.contains(&StepId::new("kubeadm-join")));
        assert!(!graph.contains(&StepId::new("configure-proxy")));
    }

    #[test]
    fn graph_order_is_stable() {
        let config = BootstrapConfig::default();
        let first = ids(&graph_for(Role::ControlPlane, &config).unwrap());
        let second = ids(&graph_for(Role::ControlPlane, &config).unwrap());
        assert_eq!(first, second);
        assert_eq!(first[0], "configure-hosts");
    }

    #[test]
    fn worker_graph_joins_instead_of_init() {
        let graph = graph_for(Role::Worker, &worker_config()).unwrap();
        assert!(graph.contains(&StepId::new("kubeadm-join")));
        assert!(!graph.contains(&StepId::new("kubeadm-init")));
        assert!(!graph.contains(&StepId::new("deploy-flannel")));

        let deps = graph.dependencies(&StepId::new("kubeadm-join"));
        assert!(deps.contains(&StepId::new("install-kubernetes-packages")));
        assert!(deps.contains(&StepId::new("configure-firewall")));
    }

    #[test]
    fn proxy_step_only_when_configured() {
        let mut config = BootstrapConfig::default();
        config.proxy.https_proxy = Some("http://proxy.lab:3128".to_string());
        let graph = graph_for(Role::ControlPlane, &config).unwrap();

        assert!(graph.contains(&StepId::new("configure-proxy")));
        assert!(graph
            .dependencies(&StepId::new("install-containerd"))
            .contains(&StepId::new("configure-proxy")));
    }

    #[test]
    fn commands_and_checks_share_proxy_env() {
        let mut config = BootstrapConfig::default();
        config.proxy.https_proxy = Some("http://proxy.lab:3128".to_string());
        let factory = StepFactory::new(&config);

        let env = factory.command("kubectl apply -f flannel.yml").env().to_vec();
        assert_eq!(env, config.command_env());
        assert!(env
            .iter()
            .any(|(k, v)| k == "NO_PROXY" && v.contains("10.96.0.0/12")));
    }

    #[test]
    fn disabled_addons_are_left_out() {
        let mut config = BootstrapConfig::default();
        config.addons.ingress_nginx = false;
        config.addons.local_path_storage = false;
        let graph = graph_for(Role::ControlPlane, &config).unwrap();

        assert!(!graph.contains(&StepId::new("install-ingress-nginx")));
        assert!(!graph.contains(&StepId::new("install-local-path-storage")));
        assert!(graph.contains(&StepId::new("export-join-command")));
    }

    #[test]
    fn steps_carry_execution_settings() {
        let mut config = BootstrapConfig::default();
        config.execution.max_retries = 7;
        config.execution.step_timeout_secs = 60;

        for step in steps_for(Role::ControlPlane, &config) {
            assert_eq!(step.retry.max_retries, 7, "{}", step.id);
            assert_eq!(step.timeout, Some(Duration::from_secs(60)), "{}", step.id);
        }
    }

    #[test]
    fn idempotent_host_steps_have_preconditions() {
        let mut config = BootstrapConfig::default();
        config.hosts.push(HostEntry {
            address: "192.168.1.10".to_string(),
            names: vec!["k8s-master".to_string()],
        });
        let steps = steps_for(Role::ControlPlane, &config);

        for id in [
            "configure-hosts",
            "disable-swap",
            "load-kernel-modules",
            "configure-sysctl",
            "install-containerd",
            "install-kubernetes-packages",
            "kubeadm-init",
        ] {
            let step = steps.iter().find(|s| s.id.as_str() == id).unwrap();
            assert!(step.precondition.is_some(), "{id} has no precondition");
        }
    }
}
