use super::command::shell_quote;
use super::StepFactory;
use crate::step::Step;

const KUBELET_CONFIG: &str = "/etc/kubernetes/kubelet.conf";
const CLUSTER_CA: &str = "/etc/kubernetes/pki/ca.crt";

pub(super) fn steps(factory: &StepFactory<'_>) -> Vec<Step> {
    vec![kubeadm_join(factory)]
}

/// The join command comes from config, or from the file the control plane exported
fn join_script(factory: &StepFactory<'_>) -> String {
    let join = &factory.config().join;
    match &join.command {
        Some(command) => command.trim().to_string(),
        None => {
            let file = shell_quote(&join.command_file.display().to_string());
            format!(
                r#"command="$(cat {file})"
case "$command" in
  "kubeadm join "*) eval "$command" ;;
  *) echo "{file} does not hold a kubeadm join command" >&2; exit 1 ;;
esac"#
            )
        }
    }
}

/// End state of `kubeadm join`: kubelet configured and running
fn join_done_script() -> String {
    format!("[ -f {} ] && systemctl is-active --quiet kubelet", KUBELET_CONFIG)
}

/// `kubeadm join` refuses to run over an earlier attempt, so leftovers are reset first
fn rejoin_script(factory: &StepFactory<'_>) -> String {
    format!(
        r#"if {done}; then
  exit 0
fi
if [ -e {KUBELET_CONFIG} ] || [ -e {CLUSTER_CA} ]; then
  kubeadm reset -f
fi
{join}"#,
        done = join_done_script(),
        join = join_script(factory),
    )
}

fn kubeadm_join(factory: &StepFactory<'_>) -> Step {
    factory
        .shell(
            "kubeadm-join",
            "Join this node to the cluster",
            rejoin_script(factory),
        )
        .depends_on([
            "install-kubernetes-packages",
            "configure-firewall",
            "configure-hosts",
        ])
        .precondition(factory.check("node already joined, kubelet active", join_done_script()))
        .verify(
            factory.check("kubelet is active", "systemctl is-active --quiet kubelet"),
            factory.poll(),
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootstrapConfig;
    use std::path::PathBuf;

    #[test]
    fn configured_command_is_used_verbatim() {
        let mut config = BootstrapConfig::default();
        config.join.command = Some("  kubeadm join 10.0.0.1:6443 --token t  ".to_string());
        let factory = StepFactory::new(&config);
        assert_eq!(join_script(&factory), "kubeadm join 10.0.0.1:6443 --token t");
    }

    #[test]
    fn joined_means_kubelet_config_and_active_kubelet() {
        let config = BootstrapConfig::default();
        let factory = StepFactory::new(&config);
        let step = kubeadm_join(&factory);

        assert_eq!(
            join_done_script(),
            "[ -f /etc/kubernetes/kubelet.conf ] && systemctl is-active --quiet kubelet"
        );
        assert_eq!(
            step.precondition.as_ref().unwrap().describe(),
            "node already joined, kubelet active"
        );
    }

    #[test]
    fn join_resets_a_partial_attempt_before_rerunning() {
        let mut config = BootstrapConfig::default();
        config.join.command = Some("kubeadm join 10.0.0.1:6443 --token t".to_string());
        let factory = StepFactory::new(&config);
        let script = rejoin_script(&factory);

        let done = script.find(&join_done_script()).unwrap();
        let reset = script.find("kubeadm reset -f").unwrap();
        let join = script.find("kubeadm join 10.0.0.1:6443 --token t").unwrap();
        assert!(done < reset && reset < join);
        assert!(script.contains("[ -e /etc/kubernetes/pki/ca.crt ]"));
    }

    #[test]
    fn falls_back_to_exported_file() {
        let mut config = BootstrapConfig::default();
        config.join.command_file = PathBuf::from("/srv/join");
        let factory = StepFactory::new(&config);
        let script = join_script(&factory);
        assert!(script.starts_with("command=\"$(cat '/srv/join')\""));
        assert!(script.contains("eval \"$command\""));
    }
}
