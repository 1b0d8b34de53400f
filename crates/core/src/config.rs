use crate::error::ConfigError;
use crate::types::{RetryPolicy, Role};
use crate::workflow::gate::PollPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bootstrap configuration, read from a TOML file
///
/// Values are handed to actions as command arguments and environment; the
/// engine itself never interprets them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Entries every node needs in /etc/hosts
    #[serde(default)]
    pub hosts: Vec<HostEntry>,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub join: JoinConfig,

    #[serde(default)]
    pub addons: AddonsConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_kubernetes_version")]
    pub kubernetes_version: String,

    #[serde(default = "default_pod_network_cidr")]
    pub pod_network_cidr: String,

    #[serde(default = "default_service_cidr")]
    pub service_cidr: String,

    /// Address the API server advertises; kubeadm picks the default route when unset
    #[serde(default)]
    pub advertise_address: Option<String>,

    #[serde(default)]
    pub control_plane_endpoint: Option<String>,

    /// Network allowed through the firewall for cluster traffic
    #[serde(default = "default_node_network")]
    pub node_network: String,

    #[serde(default = "default_kubeconfig")]
    pub kubeconfig: PathBuf,
}

fn default_kubernetes_version() -> String {
    "1.30".to_string()
}

fn default_pod_network_cidr() -> String {
    // Flannel's default
    "10.244.0.0/16".to_string()
}

fn default_service_cidr() -> String {
    "10.96.0.0/12".to_string()
}

fn default_node_network() -> String {
    "192.168.0.0/16".to_string()
}

fn default_kubeconfig() -> PathBuf {
    PathBuf::from("/etc/kubernetes/admin.conf")
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubernetes_version: default_kubernetes_version(),
            pod_network_cidr: default_pod_network_cidr(),
            service_cidr: default_service_cidr(),
            advertise_address: None,
            control_plane_endpoint: None,
            node_network: default_node_network(),
            kubeconfig: default_kubeconfig(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub address: String,
    pub names: Vec<String>,
}

impl HostEntry {
    /// The line this entry contributes to /etc/hosts
    pub fn hosts_line(&self) -> String {
        format!("{} {}", self.address, self.names.join(" "))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub http_proxy: Option<String>,

    #[serde(default)]
    pub https_proxy: Option<String>,

    #[serde(default)]
    pub no_proxy: Vec<String>,
}

impl ProxyConfig {
    pub fn is_configured(&self) -> bool {
        self.http_proxy.is_some() || self.https_proxy.is_some()
    }

    /// Environment variables passed to commands that reach the network
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Some(proxy) = &self.http_proxy {
            env.push(("HTTP_PROXY".to_string(), proxy.clone()));
            env.push(("http_proxy".to_string(), proxy.clone()));
        }
        if let Some(proxy) = &self.https_proxy {
            env.push(("HTTPS_PROXY".to_string(), proxy.clone()));
            env.push(("https_proxy".to_string(), proxy.clone()));
        }
        if self.is_configured() && !self.no_proxy.is_empty() {
            let no_proxy = self.no_proxy.join(",");
            env.push(("NO_PROXY".to_string(), no_proxy.clone()));
            env.push(("no_proxy".to_string(), no_proxy));
        }
        env
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinConfig {
    /// Full `kubeadm join ...` command printed by the control plane
    #[serde(default)]
    pub command: Option<String>,

    /// Where the control plane writes the join command, and where a worker
    /// reads it from when `command` is unset
    #[serde(default = "default_join_command_file")]
    pub command_file: PathBuf,
}

fn default_join_command_file() -> PathBuf {
    PathBuf::from("/etc/kubestrap/join-command")
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            command: None,
            command_file: default_join_command_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddonsConfig {
    #[serde(default = "default_flannel_manifest")]
    pub flannel_manifest: String,

    #[serde(default = "default_true")]
    pub ingress_nginx: bool,

    #[serde(default = "default_ingress_nginx_manifest")]
    pub ingress_nginx_manifest: String,

    #[serde(default = "default_true")]
    pub local_path_storage: bool,

    #[serde(default = "default_local_path_manifest")]
    pub local_path_manifest: String,

    /// Mark local-path as the default StorageClass
    #[serde(default = "default_true")]
    pub default_storage_class: bool,
}

fn default_true() -> bool {
    true
}

fn default_flannel_manifest() -> String {
    "https://github.com/flannel-io/flannel/releases/latest/download/kube-flannel.yml".to_string()
}

fn default_ingress_nginx_manifest() -> String {
    "https://raw.githubusercontent.com/kubernetes/ingress-nginx/controller-v1.10.1/deploy/static/provider/baremetal/deploy.yaml".to_string()
}

fn default_local_path_manifest() -> String {
    "https://raw.githubusercontent.com/rancher/local-path-provisioner/v0.0.28/deploy/local-path-storage.yaml".to_string()
}

impl Default for AddonsConfig {
    fn default() -> Self {
        Self {
            flannel_manifest: default_flannel_manifest(),
            ingress_nginx: true,
            ingress_nginx_manifest: default_ingress_nginx_manifest(),
            local_path_storage: true,
            local_path_manifest: default_local_path_manifest(),
            default_storage_class: true,
        }
    }
}

/// Retry, timeout and polling defaults applied to every catalog step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    #[serde(default = "default_verify_timeout_secs")]
    pub verify_timeout_secs: u64,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_poll_max_interval_secs")]
    pub poll_max_interval_secs: u64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_base_secs() -> u64 {
    5
}

fn default_backoff_max_secs() -> u64 {
    60
}

fn default_step_timeout_secs() -> u64 {
    900
}

fn default_verify_timeout_secs() -> u64 {
    300
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_poll_max_interval_secs() -> u64 {
    30
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            step_timeout_secs: default_step_timeout_secs(),
            verify_timeout_secs: default_verify_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            poll_max_interval_secs: default_poll_max_interval_secs(),
        }
    }
}

impl ExecutionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_secs(self.backoff_base_secs),
            Duration::from_secs(self.backoff_max_secs.max(self.backoff_base_secs)),
        )
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(self.verify_timeout_secs),
            Duration::from_secs(self.poll_interval_secs.max(1)),
        )
        .with_backoff(2, Duration::from_secs(self.poll_max_interval_secs))
    }
}

impl BootstrapConfig {
    /// Load from `path`, falling back to defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(
                "Configuration file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse configuration file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Proxy environment for catalog commands
    ///
    /// Cluster-internal destinations (loopback, cluster networks, the API
    /// endpoint and configured hosts) are always added to `NO_PROXY`, so
    /// `kubectl` reaches the API server directly whether it applies a
    /// manifest or polls readiness.
    pub fn command_env(&self) -> Vec<(String, String)> {
        if !self.proxy.is_configured() {
            return Vec::new();
        }

        let cluster = &self.cluster;
        let mut exempt = self.proxy.no_proxy.clone();
        let mut internal = vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
            cluster.pod_network_cidr.clone(),
            cluster.service_cidr.clone(),
            cluster.node_network.clone(),
        ];
        internal.extend(cluster.advertise_address.clone());
        if let Some(endpoint) = &cluster.control_plane_endpoint {
            let host = endpoint.rsplit_once(':').map_or(endpoint.as_str(), |(h, _)| h);
            internal.push(host.to_string());
        }
        for host in &self.hosts {
            internal.push(host.address.clone());
            internal.extend(host.names.iter().cloned());
        }
        for entry in internal {
            if !exempt.contains(&entry) {
                exempt.push(entry);
            }
        }

        ProxyConfig {
            no_proxy: exempt,
            ..self.proxy.clone()
        }
        .env()
    }

    /// Check the settings a run for `role` relies on
    pub fn validate(&self, role: Role) -> Result<(), ConfigError> {
        validate_cidr("cluster.pod_network_cidr", &self.cluster.pod_network_cidr)?;
        validate_cidr("cluster.service_cidr", &self.cluster.service_cidr)?;
        validate_cidr("cluster.node_network", &self.cluster.node_network)?;

        if self.cluster.kubernetes_version.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "cluster.kubernetes_version must not be empty".to_string(),
            ));
        }

        if let Some(address) = &self.cluster.advertise_address {
            address.parse::<Ipv4Addr>().map_err(|_| {
                ConfigError::Invalid(format!(
                    "cluster.advertise_address '{}' is not an IPv4 address",
                    address
                ))
            })?;
        }

        for host in &self.hosts {
            host.address.parse::<Ipv4Addr>().map_err(|_| {
                ConfigError::Invalid(format!("host address '{}' is not an IPv4 address", host.address))
            })?;
            if host.names.is_empty() || host.names.iter().any(|n| !is_hostname(n)) {
                return Err(ConfigError::Invalid(format!(
                    "host {} needs one or more valid names, got {:?}",
                    host.address, host.names
                )));
            }
        }

        if role == Role::Worker {
            match &self.join.command {
                Some(command) if !command.trim_start().starts_with("kubeadm join") => {
                    return Err(ConfigError::Invalid(
                        "join.command must be a 'kubeadm join' command".to_string(),
                    ));
                }
                Some(_) => {}
                None if self.join.command_file.exists() => {}
                None => {
                    return Err(ConfigError::Invalid(format!(
                        "worker nodes need join.command or a join command file at {}",
                        self.join.command_file.display()
                    )));
                }
            }
        }

        Ok(())
    }
}

fn validate_cidr(field: &str, value: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::Invalid(format!("{} '{}' is not an IPv4 CIDR", field, value));
    let (address, prefix) = value.split_once('/').ok_or_else(invalid)?;
    address.parse::<Ipv4Addr>().map_err(|_| invalid())?;
    match prefix.parse::<u8>() {
        Ok(bits) if bits <= 32 => Ok(()),
        _ => Err(invalid()),
    }
}

fn is_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}
