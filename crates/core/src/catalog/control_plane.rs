use super::command::shell_quote;
use super::StepFactory;
use crate::step::Step;

const MANIFESTS_DIR: &str = "/etc/kubernetes/manifests";

pub(super) fn steps(factory: &StepFactory<'_>) -> Vec<Step> {
    let addons = &factory.config().addons;
    let mut steps = vec![
        kubeadm_init(factory),
        configure_kubeconfig(factory),
        deploy_flannel(factory),
        wait_control_plane_ready(factory),
    ];
    if addons.ingress_nginx {
        steps.push(install_ingress_nginx(factory));
    }
    if addons.local_path_storage {
        steps.push(install_local_path_storage(factory));
    }
    steps.push(export_join_command(factory));
    steps
}

fn kubectl(factory: &StepFactory<'_>) -> String {
    format!(
        "kubectl --kubeconfig {}",
        shell_quote(&factory.config().cluster.kubeconfig.display().to_string())
    )
}

/// `kubeadm init` arguments derived from the cluster settings
fn init_args(factory: &StepFactory<'_>) -> Vec<String> {
    let cluster = &factory.config().cluster;
    let mut args = vec![
        format!("--kubernetes-version=stable-{}", cluster.kubernetes_version),
        format!("--pod-network-cidr={}", cluster.pod_network_cidr),
        format!("--service-cidr={}", cluster.service_cidr),
    ];
    if let Some(address) = &cluster.advertise_address {
        args.push(format!("--apiserver-advertise-address={}", address));
    }
    if let Some(endpoint) = &cluster.control_plane_endpoint {
        args.push(format!("--control-plane-endpoint={}", endpoint));
    }
    args
}

/// API server answering `/readyz` through the admin kubeconfig
fn readyz(factory: &StepFactory<'_>) -> String {
    format!("{} --request-timeout=10s get --raw /readyz", kubectl(factory))
}

/// End state of `kubeadm init`: admin.conf written and the API server ready
fn init_done_script(factory: &StepFactory<'_>) -> String {
    let kubeconfig = shell_quote(&factory.config().cluster.kubeconfig.display().to_string());
    format!("[ -f {} ] && {}", kubeconfig, readyz(factory))
}

/// `kubeadm init` refuses to run over an earlier attempt, so leftovers are reset first
fn init_script(factory: &StepFactory<'_>) -> String {
    let kubeconfig = shell_quote(&factory.config().cluster.kubeconfig.display().to_string());
    let args: Vec<String> = init_args(factory).iter().map(|a| shell_quote(a)).collect();
    format!(
        r#"if {done}; then
  exit 0
fi
if [ -e {kubeconfig} ] || [ -n "$(ls -A {MANIFESTS_DIR} 2>/dev/null)" ]; then
  kubeadm reset -f
fi
kubeadm init {args}"#,
        done = init_done_script(factory),
        args = args.join(" "),
    )
}

fn kubeadm_init(factory: &StepFactory<'_>) -> Step {
    factory
        .shell(
            "kubeadm-init",
            "Initialise the control plane with kubeadm",
            init_script(factory),
        )
        .depends_on([
            "install-kubernetes-packages",
            "configure-firewall",
            "configure-hosts",
        ])
        .precondition(factory.check(
            "control plane already initialised and ready",
            init_done_script(factory),
        ))
        .verify(
            factory.check("API server reports ready", readyz(factory)),
            factory.poll(),
        )
        .build()
}

fn configure_kubeconfig(factory: &StepFactory<'_>) -> Step {
    let kubeconfig = shell_quote(&factory.config().cluster.kubeconfig.display().to_string());
    let action = format!(
        r#"mkdir -p "$HOME/.kube"
cp -f {kubeconfig} "$HOME/.kube/config"
chown "$(id -u):$(id -g)" "$HOME/.kube/config""#
    );

    factory
        .shell(
            "configure-kubeconfig",
            "Install the admin kubeconfig for the current user",
            action,
        )
        .depends_on(["kubeadm-init"])
        .precondition(factory.check(
            "kubeconfig up to date",
            format!(r#"cmp -s {kubeconfig} "$HOME/.kube/config""#),
        ))
        .build()
}

fn deploy_flannel(factory: &StepFactory<'_>) -> Step {
    let manifest = shell_quote(&factory.config().addons.flannel_manifest);

    factory
        .shell(
            "deploy-flannel",
            "Deploy the Flannel pod network",
            format!("{} apply -f {}", kubectl(factory), manifest),
        )
        .depends_on(["kubeadm-init"])
        .verify(
            factory.pods_ready("kube-flannel", "app=flannel"),
            factory.poll(),
        )
        .build()
}

fn wait_control_plane_ready(factory: &StepFactory<'_>) -> Step {
    factory
        .shell(
            "wait-control-plane-ready",
            "Wait for the control plane node to become Ready",
            format!("{} get nodes", kubectl(factory)),
        )
        .depends_on(["deploy-flannel"])
        .verify(factory.nodes_ready(), factory.poll())
        .build()
}

fn install_ingress_nginx(factory: &StepFactory<'_>) -> Step {
    let manifest = shell_quote(&factory.config().addons.ingress_nginx_manifest);

    factory
        .shell(
            "install-ingress-nginx",
            "Install the ingress-nginx controller",
            format!("{} apply -f {}", kubectl(factory), manifest),
        )
        .depends_on(["wait-control-plane-ready"])
        .verify(
            factory.pods_ready("ingress-nginx", "app.kubernetes.io/component=controller"),
            factory.poll(),
        )
        .build()
}

fn install_local_path_storage(factory: &StepFactory<'_>) -> Step {
    let addons = &factory.config().addons;
    let kubectl = kubectl(factory);
    let mut action = format!(
        "{} apply -f {}",
        kubectl,
        shell_quote(&addons.local_path_manifest)
    );
    if addons.default_storage_class {
        action.push_str(&format!(
            "\n{} patch storageclass local-path -p '{{\"metadata\":{{\"annotations\":{{\"storageclass.kubernetes.io/is-default-class\":\"true\"}}}}}}'",
            kubectl
        ));
    }

    factory
        .shell(
            "install-local-path-storage",
            "Install the local-path storage provisioner",
            action,
        )
        .depends_on(["wait-control-plane-ready"])
        .verify(
            factory.pods_ready("local-path-storage", "app=local-path-provisioner"),
            factory.poll(),
        )
        .build()
}

fn export_join_command(factory: &StepFactory<'_>) -> Step {
    let file = shell_quote(&factory.config().join.command_file.display().to_string());
    // Tokens expire, so a fresh join command is written on every run
    let action = format!(
        r#"mkdir -p "$(dirname {file})"
umask 077
kubeadm token create --print-join-command > {file}.tmp
mv -f {file}.tmp {file}"#
    );

    factory
        .shell(
            "export-join-command",
            "Write the worker join command",
            action,
        )
        .depends_on(["wait-control-plane-ready"])
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootstrapConfig;

    #[test]
    fn init_args_follow_cluster_settings() {
        let mut config = BootstrapConfig::default();
        config.cluster.advertise_address = Some("192.168.1.10".to_string());
        let factory = StepFactory::new(&config);

        let args = init_args(&factory);
        assert!(args.contains(&"--pod-network-cidr=10.244.0.0/16".to_string()));
        assert!(args.contains(&"--apiserver-advertise-address=192.168.1.10".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--control-plane-endpoint")));
    }

    #[test]
    fn init_counts_as_done_only_when_api_server_is_ready() {
        let config = BootstrapConfig::default();
        let factory = StepFactory::new(&config);

        assert_eq!(
            init_done_script(&factory),
            "[ -f '/etc/kubernetes/admin.conf' ] && kubectl --kubeconfig '/etc/kubernetes/admin.conf' --request-timeout=10s get --raw /readyz"
        );
    }

    #[test]
    fn init_resets_a_partial_attempt_before_rerunning() {
        let config = BootstrapConfig::default();
        let factory = StepFactory::new(&config);
        let script = init_script(&factory);

        let done = script.find(&init_done_script(&factory)).unwrap();
        let reset = script.find("kubeadm reset -f").unwrap();
        let init = script.find("kubeadm init '--kubernetes-version=stable-1.30'").unwrap();
        assert!(done < reset && reset < init);
        assert!(script.contains("ls -A /etc/kubernetes/manifests"));
    }

    #[test]
    fn init_step_uses_readiness_precondition() {
        let config = BootstrapConfig::default();
        let factory = StepFactory::new(&config);
        let step = kubeadm_init(&factory);

        let precondition = step.precondition.as_ref().unwrap();
        assert_eq!(precondition.describe(), "control plane already initialised and ready");
        assert!(step.verify.is_some());
    }

    #[test]
    fn addon_steps_are_verified() {
        let config = BootstrapConfig::default();
        let factory = StepFactory::new(&config);

        for step in steps(&factory) {
            if ["deploy-flannel", "install-ingress-nginx", "install-local-path-storage"]
                .contains(&step.id.as_str())
            {
                let verify = step.verify.as_ref().expect("addon verification");
                assert!(verify.check.describe().contains("Ready"), "{}", step.id);
            }
        }
    }
}
