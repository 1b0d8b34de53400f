use super::command::shell_quote;
use super::StepFactory;
use crate::step::Step;
use crate::types::Role;

const MODULES_CONFIG: &str = "/etc/modules-load.d/k8s.conf";
const SYSCTL_CONFIG: &str = "/etc/sysctl.d/k8s.conf";
const CONTAINERD_CONFIG: &str = "/etc/containerd/config.toml";
const CONTAINERD_PROXY_DROPIN: &str = "/etc/systemd/system/containerd.service.d/http-proxy.conf";
const KUBERNETES_REPO: &str = "/etc/yum.repos.d/kubernetes.repo";

const KERNEL_MODULES: [&str; 2] = ["overlay", "br_netfilter"];

const SYSCTL_SETTINGS: [(&str, &str); 3] = [
    ("net.bridge.bridge-nf-call-iptables", "1"),
    ("net.bridge.bridge-nf-call-ip6tables", "1"),
    ("net.ipv4.ip_forward", "1"),
];

/// Ports opened on every node; 8472/udp is Flannel's VXLAN backend
const NODE_PORTS: [&str; 4] = ["10250/tcp", "8472/udp", "80/tcp", "443/tcp"];

const CONTROL_PLANE_PORTS: [&str; 4] = ["6443/tcp", "2379-2380/tcp", "10257/tcp", "10259/tcp"];

const WORKER_PORTS: [&str; 1] = ["30000-32767/tcp"];

fn firewall_ports(role: Role) -> Vec<&'static str> {
    let mut ports = NODE_PORTS.to_vec();
    match role {
        Role::ControlPlane => ports.extend(CONTROL_PLANE_PORTS),
        Role::Worker => ports.extend(WORKER_PORTS),
    }
    ports
}

pub(super) fn steps(factory: &StepFactory<'_>, role: Role) -> Vec<Step> {
    let mut steps = vec![
        configure_hosts(factory),
        disable_swap(factory),
        selinux_permissive(factory),
        configure_firewall(factory, role),
        load_kernel_modules(factory),
        configure_sysctl(factory),
    ];
    let proxy = factory.config().proxy.is_configured();
    if proxy {
        steps.push(configure_proxy(factory));
    }
    steps.push(install_containerd(factory, proxy));
    steps.push(install_kubernetes_packages(factory));
    steps
}

fn configure_hosts(factory: &StepFactory<'_>) -> Step {
    let lines: Vec<String> = factory
        .config()
        .hosts
        .iter()
        .map(|h| shell_quote(&h.hosts_line()))
        .collect();
    let list = if lines.is_empty() {
        "()".to_string()
    } else {
        format!("({})", lines.join(" "))
    };

    // Appending only missing lines keeps re-runs from duplicating entries
    let action = format!(
        r#"entries={list}
for line in "${{entries[@]}}"; do
  grep -qxF "$line" /etc/hosts || echo "$line" >> /etc/hosts
done"#
    );
    let check = format!(
        r#"entries={list}
for line in "${{entries[@]}}"; do
  grep -qxF "$line" /etc/hosts || exit 1
done"#
    );

    factory
        .shell("configure-hosts", "Add cluster hosts to /etc/hosts", action)
        .precondition(factory.check("all host entries present", check))
        .build()
}

fn disable_swap(factory: &StepFactory<'_>) -> Step {
    let action = r#"swapoff -a
sed -ri '/^[^#]\S*\s+\S+\s+swap\s/s/^/#/' /etc/fstab"#;
    let check = r#"[ -z "$(swapon --noheadings --show)" ]
! grep -Eq '^[^#]\S*\s+\S+\s+swap\s' /etc/fstab"#;

    factory
        .shell("disable-swap", "Turn swap off now and at boot", action)
        .precondition(factory.check("swap is off and not in fstab", check))
        .build()
}

fn selinux_permissive(factory: &StepFactory<'_>) -> Step {
    let action = r#"setenforce 0 || true
sed -i 's/^SELINUX=enforcing$/SELINUX=permissive/' /etc/selinux/config"#;
    let check = r#"[ "$(getenforce)" != "Enforcing" ]
! grep -q '^SELINUX=enforcing' /etc/selinux/config"#;

    factory
        .shell("selinux-permissive", "Set SELinux to permissive mode", action)
        .precondition(factory.check("SELinux is not enforcing", check))
        .build()
}

fn configure_firewall(factory: &StepFactory<'_>, role: Role) -> Step {
    let ports = firewall_ports(role).join(" ");
    let pod_network = shell_quote(&factory.config().cluster.pod_network_cidr);
    let node_network = shell_quote(&factory.config().cluster.node_network);

    let action = format!(
        r#"for port in {ports}; do
  firewall-cmd --permanent --add-port="$port"
done
firewall-cmd --permanent --zone=trusted --add-source={pod_network}
firewall-cmd --permanent --zone=trusted --add-source={node_network}
firewall-cmd --permanent --add-masquerade
firewall-cmd --reload"#
    );
    let check = format!(
        r#"for port in {ports}; do
  firewall-cmd --query-port="$port" >/dev/null
done
firewall-cmd --zone=trusted --query-source={pod_network} >/dev/null
firewall-cmd --query-masquerade >/dev/null"#
    );

    factory
        .shell(
            "configure-firewall",
            &format!("Open {} ports in firewalld", role),
            action,
        )
        .precondition(factory.check("cluster ports are open", check))
        .build()
}

fn load_kernel_modules(factory: &StepFactory<'_>) -> Step {
    let content = KERNEL_MODULES.join("\n");
    let modules = KERNEL_MODULES.join(" ");

    let action = format!(
        r#"printf '%s\n' {modules} > {MODULES_CONFIG}
for module in {modules}; do
  modprobe "$module"
done"#
    );
    let check = format!(
        r#"[ "$(cat {MODULES_CONFIG})" = {content} ]
for module in {modules}; do
  [ -d "/sys/module/$module" ]
done"#,
        content = shell_quote(&content)
    );

    factory
        .shell(
            "load-kernel-modules",
            "Load overlay and br_netfilter now and at boot",
            action,
        )
        .precondition(factory.check("kernel modules loaded and persisted", check))
        .build()
}

fn configure_sysctl(factory: &StepFactory<'_>) -> Step {
    let content: Vec<String> = SYSCTL_SETTINGS
        .iter()
        .map(|(key, value)| format!("{} = {}", key, value))
        .collect();
    let checks: Vec<String> = SYSCTL_SETTINGS
        .iter()
        .map(|(key, value)| format!("[ \"$(sysctl -n {})\" = \"{}\" ]", key, value))
        .collect();

    let action = format!(
        "printf '%s\\n' {} > {}\nsysctl --system",
        content
            .iter()
            .map(|l| shell_quote(l))
            .collect::<Vec<_>>()
            .join(" "),
        SYSCTL_CONFIG
    );
    let check = format!("[ -f {} ]\n{}", SYSCTL_CONFIG, checks.join("\n"));

    factory
        .shell(
            "configure-sysctl",
            "Enable bridged traffic filtering and IP forwarding",
            action,
        )
        .depends_on(["load-kernel-modules"])
        .precondition(factory.check("kernel parameters applied", check))
        .build()
}

fn proxy_dropin(factory: &StepFactory<'_>) -> String {
    let proxy = &factory.config().proxy;
    let mut lines = vec!["[Service]".to_string()];
    if let Some(http) = &proxy.http_proxy {
        lines.push(format!("Environment=\"HTTP_PROXY={}\"", http));
    }
    if let Some(https) = &proxy.https_proxy {
        lines.push(format!("Environment=\"HTTPS_PROXY={}\"", https));
    }
    if !proxy.no_proxy.is_empty() {
        lines.push(format!("Environment=\"NO_PROXY={}\"", proxy.no_proxy.join(",")));
    }
    lines.join("\n")
}

fn configure_proxy(factory: &StepFactory<'_>) -> Step {
    let content = shell_quote(&proxy_dropin(factory));
    let action = format!(
        r#"mkdir -p "$(dirname {CONTAINERD_PROXY_DROPIN})"
printf '%s\n' {content} > {CONTAINERD_PROXY_DROPIN}
systemctl daemon-reload"#
    );
    let check = format!(r#"[ "$(cat {CONTAINERD_PROXY_DROPIN})" = {content} ]"#);

    factory
        .shell(
            "configure-proxy",
            "Pass the HTTP proxy to containerd",
            action,
        )
        .precondition(factory.check("containerd proxy drop-in up to date", check))
        .build()
}

fn install_containerd(factory: &StepFactory<'_>, proxy: bool) -> Step {
    let action = format!(
        r#"dnf -y install dnf-plugins-core
dnf config-manager --add-repo https://download.docker.com/linux/centos/docker-ce.repo
dnf -y install containerd.io
mkdir -p /etc/containerd
if ! grep -q 'SystemdCgroup' {CONTAINERD_CONFIG} 2>/dev/null; then
  containerd config default > {CONTAINERD_CONFIG}
fi
sed -i 's/SystemdCgroup = false/SystemdCgroup = true/' {CONTAINERD_CONFIG}
systemctl enable containerd
systemctl restart containerd"#
    );
    let check = format!(
        r#"rpm -q containerd.io >/dev/null
grep -q 'SystemdCgroup = true' {CONTAINERD_CONFIG}
systemctl is-active --quiet containerd"#
    );

    let mut deps = vec!["load-kernel-modules", "configure-sysctl"];
    if proxy {
        deps.push("configure-proxy");
    }

    factory
        .shell(
            "install-containerd",
            "Install containerd with the systemd cgroup driver",
            action,
        )
        .depends_on(deps)
        .precondition(factory.check("containerd installed, configured and active", check))
        .verify(
            factory.check(
                "containerd is active",
                "systemctl is-active --quiet containerd",
            ),
            factory.poll(),
        )
        .build()
}

fn install_kubernetes_packages(factory: &StepFactory<'_>) -> Step {
    let version = &factory.config().cluster.kubernetes_version;
    let repo = format!(
        "[kubernetes]\nname=Kubernetes\nbaseurl=https://pkgs.k8s.io/core:/stable:/v{version}/rpm/\nenabled=1\ngpgcheck=1\ngpgkey=https://pkgs.k8s.io/core:/stable:/v{version}/rpm/repodata/repomd.xml.key\nexclude=kubelet kubeadm kubectl cri-tools kubernetes-cni"
    );

    let action = format!(
        r#"printf '%s\n' {repo} > {KUBERNETES_REPO}
dnf -y install kubelet kubeadm kubectl --disableexcludes=kubernetes
systemctl enable --now kubelet"#,
        repo = shell_quote(&repo)
    );
    let check = r#"rpm -q kubelet kubeadm kubectl >/dev/null
systemctl is-enabled --quiet kubelet"#;

    factory
        .shell(
            "install-kubernetes-packages",
            &format!("Install kubelet, kubeadm and kubectl {}", version),
            action,
        )
        .depends_on(["install-containerd", "disable-swap", "selinux-permissive"])
        .precondition(factory.check("kubernetes packages installed", check))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootstrapConfig;

    #[test]
    fn firewall_ports_depend_on_role() {
        let control_plane = firewall_ports(Role::ControlPlane);
        assert!(control_plane.contains(&"6443/tcp"));
        assert!(control_plane.contains(&"8472/udp"));
        assert!(!control_plane.contains(&"30000-32767/tcp"));

        let worker = firewall_ports(Role::Worker);
        assert!(worker.contains(&"10250/tcp"));
        assert!(worker.contains(&"30000-32767/tcp"));
        assert!(!worker.contains(&"6443/tcp"));
    }

    #[test]
    fn proxy_dropin_lists_configured_variables() {
        let mut config = BootstrapConfig::default();
        config.proxy.http_proxy = Some("http://proxy.lab:3128".to_string());
        config.proxy.no_proxy = vec!["localhost".to_string(), "10.0.0.0/8".to_string()];
        let factory = StepFactory::new(&config);

        assert_eq!(
            proxy_dropin(&factory),
            "[Service]\nEnvironment=\"HTTP_PROXY=http://proxy.lab:3128\"\nEnvironment=\"NO_PROXY=localhost,10.0.0.0/8\""
        );
    }

    #[test]
    fn common_steps_without_proxy() {
        let config = BootstrapConfig::default();
        let factory = StepFactory::new(&config);
        let ids: Vec<String> = steps(&factory, Role::Worker)
            .into_iter()
            .map(|s| s.id.0)
            .collect();
        assert_eq!(
            ids,
            vec![
                "configure-hosts",
                "disable-swap",
                "selinux-permissive",
                "configure-firewall",
                "load-kernel-modules",
                "configure-sysctl",
                "install-containerd",
                "install-kubernetes-packages",
            ]
        );
    }
}
