//! Cluster definitions for both backends.
//!
//! A definition file is a YAML document tagged with `backend: k3s` or
//! `backend: talos`. Node identity fields are immutable once a cluster
//! exists; [`ClusterConfig::replacement_field`] and
//! [`TalosClusterConfig::replacement_field`] report the first one that
//! changed.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::wait::DEFAULT_POLL_INTERVAL;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default k3s pod network.
pub const DEFAULT_POD_CIDR: &str = "10.42.0.0/16";

/// Default k3s service network.
pub const DEFAULT_SERVICE_CIDR: &str = "10.43.0.0/16";

/// Default Talos install disk.
pub const DEFAULT_INSTALL_DISK: &str = "/dev/sda";

/// Kubernetes API server port on both backends.
pub const K8S_API_PORT: u16 = 6443;

/// SSH credentials for a node.
///
/// Key-based authentication wins when both a key and a password are set.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Inline private key (PEM).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// Path to a private key file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,
    /// Password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Resolved authentication method.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Inline private key material.
    KeyMaterial(String),
    /// Private key on disk.
    KeyFile(PathBuf),
    /// Password authentication.
    Password(String),
}

impl Credentials {
    /// Key-based credentials from a file.
    #[must_use]
    pub fn key_file(path: impl Into<PathBuf>) -> Self {
        Self {
            private_key_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Password credentials.
    #[must_use]
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Self::default()
        }
    }

    /// Pick the authentication method, preferring keys.
    #[must_use]
    pub fn auth_method(&self) -> Option<AuthMethod> {
        if let Some(key) = self.private_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Some(AuthMethod::KeyMaterial(key.clone()));
        }
        if let Some(path) = &self.private_key_path {
            return Some(AuthMethod::KeyFile(path.clone()));
        }
        self.password
            .as_ref()
            .filter(|p| !p.is_empty())
            .map(|p| AuthMethod::Password(p.clone()))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("private_key_path", &self.private_key_path)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyMaterial(_) => write!(f, "KeyMaterial(<redacted>)"),
            Self::KeyFile(path) => write!(f, "KeyFile({})", path.display()),
            Self::Password(_) => write!(f, "Password(<redacted>)"),
        }
    }
}

/// A physical machine reachable over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// IP address or DNS name.
    pub host: String,
    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// SSH user.
    #[serde(default = "default_ssh_user")]
    pub user: String,
    /// SSH credentials.
    #[serde(default)]
    pub credentials: Credentials,
    /// Kubernetes node name, if it differs from the OS hostname.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_ssh_user() -> String {
    "root".to_string()
}

impl NodeConfig {
    /// Create a node definition with default port and user.
    #[must_use]
    pub fn new(host: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            user: default_ssh_user(),
            credentials,
            hostname: None,
        }
    }

    /// Set the Kubernetes node name.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// `host:port` for the SSH connection.
    #[must_use]
    pub fn ssh_address(&self) -> String {
        format!("{}:{}", url_host(&self.host), self.port)
    }

    fn validate(&self, role: &str) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::validation(format!("{role}: host must not be empty")));
        }
        if self.port == 0 {
            return Err(Error::validation(format!("{role} {}: port must not be 0", self.host)));
        }
        if self.credentials.auth_method().is_none() {
            return Err(Error::validation(format!(
                "{role} {}: a private key or password is required",
                self.host
            )));
        }
        Ok(())
    }
}

/// A Talos node. Talos nodes need no SSH credentials: before joining they
/// accept an unauthenticated maintenance-mode connection, afterwards the
/// certificate-based Talos API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TalosNodeConfig {
    /// Node IP address.
    pub host: String,
    /// Hostname to assign through the machine config patch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl TalosNodeConfig {
    /// Create a Talos node definition.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            hostname: None,
        }
    }

    /// Set the hostname.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }
}

/// MetalLB address pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerSpec {
    /// Whether to deploy MetalLB.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// `start-end` range or CIDR handed to the address pool.
    pub ip_range: String,
    /// Helm chart version; latest when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_version: Option<String>,
}

/// ingress-nginx deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressSpec {
    /// Whether to deploy ingress-nginx.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fixed load balancer IP. Defaults to the first pool address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Helm chart version; latest when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_version: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Optional add-ons deployed after the cluster is reachable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addons {
    /// MetalLB load balancer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancerSpec>,
    /// ingress-nginx controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSpec>,
}

impl Addons {
    /// The load balancer spec, if enabled.
    #[must_use]
    pub fn enabled_load_balancer(&self) -> Option<&LoadBalancerSpec> {
        self.load_balancer.as_ref().filter(|lb| lb.enabled)
    }

    /// The ingress spec, if enabled.
    #[must_use]
    pub fn enabled_ingress(&self) -> Option<&IngressSpec> {
        self.ingress.as_ref().filter(|i| i.enabled)
    }

    /// Whether anything needs deploying.
    #[must_use]
    pub fn any_enabled(&self) -> bool {
        self.enabled_load_balancer().is_some() || self.enabled_ingress().is_some()
    }

    fn validate(&self) -> Result<()> {
        if let Some(lb) = self.enabled_load_balancer() {
            first_address(&lb.ip_range)?;
        }
        if let Some(ip) = self.enabled_ingress().and_then(|i| i.ip.as_deref()) {
            ip.parse::<IpAddr>()
                .map_err(|_| Error::validation(format!("ingress ip '{ip}' is not an IP address")))?;
        }
        Ok(())
    }
}

/// Timeouts and polling cadence for one provisioning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerSettings {
    /// Seconds between polling attempts.
    pub poll_interval_secs: u64,
    /// Seconds to wait for SSH to answer before installing.
    pub ssh_timeout_secs: u64,
    /// Seconds to wait for the control plane to report Ready.
    pub install_timeout_secs: u64,
    /// Seconds to wait for each worker to report Ready. A worker that
    /// misses it is skipped and the cluster reported degraded.
    pub node_ready_timeout_secs: u64,
    /// Seconds to wait for add-on controllers.
    pub addon_timeout_secs: u64,
    /// Seconds allowed for the health check used on read.
    pub health_check_timeout_secs: u64,
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
            ssh_timeout_secs: 300,
            install_timeout_secs: 600,
            node_ready_timeout_secs: 300,
            addon_timeout_secs: 120,
            health_check_timeout_secs: 30,
        }
    }
}

impl ProvisionerSettings {
    /// Polling interval, never below one second.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// SSH reachability wait.
    #[must_use]
    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout_secs)
    }

    /// Control plane install and readiness wait.
    #[must_use]
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    /// Per-worker readiness wait.
    #[must_use]
    pub fn node_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.node_ready_timeout_secs)
    }

    /// Add-on readiness wait.
    #[must_use]
    pub fn addon_timeout(&self) -> Duration {
        Duration::from_secs(self.addon_timeout_secs)
    }

    /// Health check wait used on read.
    #[must_use]
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }
}

/// A k3s cluster: one control plane plus any number of agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name; immutable.
    pub name: String,
    /// k3s version (e.g. `v1.31.4+k3s1`); channel default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Join token. Generated once when empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// The single control plane node.
    pub control_plane: NodeConfig,
    /// Agent nodes.
    #[serde(default)]
    pub workers: Vec<NodeConfig>,
    /// Pod network.
    #[serde(default = "default_pod_cidr")]
    pub pod_cidr: String,
    /// Service network.
    #[serde(default = "default_service_cidr")]
    pub service_cidr: String,
    /// Optional add-ons.
    #[serde(flatten)]
    pub addons: Addons,
    /// Write the kubeconfig here (mode 0600).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig_path: Option<PathBuf>,
    /// Timeouts and polling cadence.
    #[serde(default)]
    pub settings: ProvisionerSettings,
}

fn default_pod_cidr() -> String {
    DEFAULT_POD_CIDR.to_string()
}

fn default_service_cidr() -> String {
    DEFAULT_SERVICE_CIDR.to_string()
}

impl ClusterConfig {
    /// Create a cluster definition with default networks and no workers.
    #[must_use]
    pub fn new(name: impl Into<String>, control_plane: NodeConfig) -> Self {
        Self {
            name: name.into(),
            version: None,
            token: None,
            control_plane,
            workers: Vec::new(),
            pod_cidr: default_pod_cidr(),
            service_cidr: default_service_cidr(),
            addons: Addons::default(),
            kubeconfig_path: None,
            settings: ProvisionerSettings::default(),
        }
    }

    /// Add a worker node.
    #[must_use]
    pub fn with_worker(mut self, worker: NodeConfig) -> Self {
        self.workers.push(worker);
        self
    }

    /// Operator-supplied token, ignoring empty strings.
    #[must_use]
    pub fn supplied_token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.trim().is_empty())
    }

    /// `https://<control plane>:6443`.
    #[must_use]
    pub fn api_endpoint(&self) -> String {
        format!("https://{}:{K8S_API_PORT}", url_host(&self.control_plane.host))
    }

    /// Check the definition before any node is contacted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        self.control_plane.validate("control plane")?;
        for worker in &self.workers {
            worker.validate("worker")?;
        }
        ensure_unique_hosts(
            std::iter::once(self.control_plane.host.as_str())
                .chain(self.workers.iter().map(|w| w.host.as_str())),
        )?;
        validate_cidr("pod_cidr", &self.pod_cidr)?;
        validate_cidr("service_cidr", &self.service_cidr)?;
        self.addons.validate()
    }

    /// First immutable attribute that differs from `previous`, if any.
    ///
    /// An empty token on the new definition means "keep the generated one"
    /// and is not a change.
    #[must_use]
    pub fn replacement_field(&self, previous: &Self) -> Option<&'static str> {
        if self.name != previous.name {
            return Some("name");
        }
        if self.control_plane != previous.control_plane {
            return Some("control_plane");
        }
        if self.workers != previous.workers {
            return Some("workers");
        }
        if self.supplied_token().is_some() && self.supplied_token() != previous.supplied_token() {
            return Some("token");
        }
        if self.version != previous.version {
            return Some("version");
        }
        if self.pod_cidr != previous.pod_cidr {
            return Some("pod_cidr");
        }
        if self.service_cidr != previous.service_cidr {
            return Some("service_cidr");
        }
        None
    }
}

/// A Talos cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TalosClusterConfig {
    /// Cluster name.
    pub name: String,
    /// Kubernetes endpoint; defaults to the first control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Disk Talos installs onto.
    #[serde(default = "default_install_disk")]
    pub install_disk: String,
    /// Control plane nodes (at least one).
    pub control_planes: Vec<TalosNodeConfig>,
    /// Worker nodes.
    #[serde(default)]
    pub workers: Vec<TalosNodeConfig>,
    /// Let workloads schedule on control planes.
    #[serde(default)]
    pub allow_scheduling_on_control_plane: bool,
    /// Seconds allowed for the post-bootstrap health check.
    #[serde(default = "default_bootstrap_timeout")]
    pub bootstrap_timeout_secs: u64,
    /// Optional add-ons.
    #[serde(flatten)]
    pub addons: Addons,
    /// Write the kubeconfig here (mode 0600).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig_path: Option<PathBuf>,
    /// Write the talosconfig here (mode 0600).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub talosconfig_path: Option<PathBuf>,
    /// Write the cluster secrets here (mode 0600).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_path: Option<PathBuf>,
    /// Timeouts and polling cadence.
    #[serde(default)]
    pub settings: ProvisionerSettings,
}

fn default_install_disk() -> String {
    DEFAULT_INSTALL_DISK.to_string()
}

fn default_bootstrap_timeout() -> u64 {
    600
}

impl TalosClusterConfig {
    /// Create a Talos cluster definition.
    #[must_use]
    pub fn new(name: impl Into<String>, control_planes: Vec<TalosNodeConfig>) -> Self {
        Self {
            name: name.into(),
            endpoint: None,
            install_disk: default_install_disk(),
            control_planes,
            workers: Vec::new(),
            allow_scheduling_on_control_plane: false,
            bootstrap_timeout_secs: default_bootstrap_timeout(),
            addons: Addons::default(),
            kubeconfig_path: None,
            talosconfig_path: None,
            secrets_path: None,
            settings: ProvisionerSettings::default(),
        }
    }

    /// Add a worker node.
    #[must_use]
    pub fn with_worker(mut self, worker: TalosNodeConfig) -> Self {
        self.workers.push(worker);
        self
    }

    /// Post-bootstrap health wait.
    #[must_use]
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }

    /// The first control plane, which receives the bootstrap call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when no control plane is defined.
    pub fn first_control_plane(&self) -> Result<&TalosNodeConfig> {
        self.control_planes
            .first()
            .ok_or_else(|| Error::validation("at least one control plane is required"))
    }

    /// Kubernetes endpoint, defaulting to `https://<first control plane>:6443`.
    #[must_use]
    pub fn resolved_endpoint(&self) -> String {
        match self.endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
            Some(endpoint) => endpoint.to_string(),
            None => self.control_planes.first().map_or_else(String::new, |cp| {
                format!("https://{}:{K8S_API_PORT}", url_host(&cp.host))
            }),
        }
    }

    /// Control plane addresses.
    #[must_use]
    pub fn control_plane_ips(&self) -> Vec<String> {
        self.control_planes.iter().map(|n| n.host.clone()).collect()
    }

    /// Worker addresses.
    #[must_use]
    pub fn worker_ips(&self) -> Vec<String> {
        self.workers.iter().map(|n| n.host.clone()).collect()
    }

    /// Check the definition before any node is contacted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        self.first_control_plane()?;
        for node in self.control_planes.iter().chain(&self.workers) {
            if node.host.trim().is_empty() {
                return Err(Error::validation("node host must not be empty"));
            }
        }
        ensure_unique_hosts(
            self.control_planes
                .iter()
                .chain(&self.workers)
                .map(|n| n.host.as_str()),
        )?;
        if !self.install_disk.starts_with("/dev/") {
            return Err(Error::validation(format!(
                "install_disk '{}' must be a /dev/ path",
                self.install_disk
            )));
        }
        if self.bootstrap_timeout_secs == 0 {
            return Err(Error::validation("bootstrap_timeout_secs must be positive"));
        }
        self.addons.validate()
    }

    /// First immutable attribute that differs from `previous`, if any.
    #[must_use]
    pub fn replacement_field(&self, previous: &Self) -> Option<&'static str> {
        if self.name != previous.name {
            return Some("name");
        }
        if self.resolved_endpoint() != previous.resolved_endpoint() {
            return Some("endpoint");
        }
        if self.install_disk != previous.install_disk {
            return Some("install_disk");
        }
        if self.control_planes != previous.control_planes {
            return Some("control_planes");
        }
        if self.workers != previous.workers {
            return Some("workers");
        }
        if self.allow_scheduling_on_control_plane != previous.allow_scheduling_on_control_plane {
            return Some("allow_scheduling_on_control_plane");
        }
        if self.bootstrap_timeout_secs != previous.bootstrap_timeout_secs {
            return Some("bootstrap_timeout_secs");
        }
        None
    }
}

/// Provisioning backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// SSH-driven k3s.
    K3s,
    /// talosctl-driven Talos Linux.
    Talos,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::K3s => write!(f, "k3s"),
            Self::Talos => write!(f, "talos"),
        }
    }
}

/// A cluster definition file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum ClusterDefinition {
    /// k3s cluster.
    K3s(ClusterConfig),
    /// Talos cluster.
    Talos(TalosClusterConfig),
}

impl ClusterDefinition {
    /// Parse a YAML definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read and parse a definition file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Cluster name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::K3s(c) => &c.name,
            Self::Talos(c) => &c.name,
        }
    }

    /// Backend this definition targets.
    #[must_use]
    pub fn backend(&self) -> Backend {
        match self {
            Self::K3s(_) => Backend::K3s,
            Self::Talos(_) => Backend::Talos,
        }
    }

    /// Validate the inner definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::K3s(c) => c.validate(),
            Self::Talos(c) => c.validate(),
        }
    }
}

/// Format a host for use inside a URL, bracketing IPv6 literals.
#[must_use]
pub fn url_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{v6}]"),
        _ => host.to_string(),
    }
}

/// First address of a `start-end` range or a CIDR block.
///
/// # Errors
///
/// Returns [`Error::Validation`] if the range is malformed.
pub fn first_address(range: &str) -> Result<IpAddr> {
    let invalid = || Error::validation(format!("invalid address range '{range}'"));
    let range = range.trim();

    if let Some((start, end)) = range.split_once('-') {
        let start: IpAddr = start.trim().parse().map_err(|_| invalid())?;
        let end: IpAddr = end.trim().parse().map_err(|_| invalid())?;
        if start.is_ipv4() != end.is_ipv4() || start > end {
            return Err(invalid());
        }
        return Ok(start);
    }

    if let Some((addr, prefix)) = range.split_once('/') {
        let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(invalid());
        }
        return Ok(addr);
    }

    Err(invalid())
}

fn validate_cidr(field: &str, cidr: &str) -> Result<()> {
    if cidr.contains('/') && first_address(cidr).is_ok() {
        Ok(())
    } else {
        Err(Error::validation(format!("{field} '{cidr}' is not a CIDR block")))
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "cluster name '{name}' must be a lowercase DNS label"
        )))
    }
}

fn ensure_unique_hosts<'a>(hosts: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for host in hosts {
        if !seen.insert(host) {
            return Err(Error::validation(format!("host {host} is listed twice")));
        }
    }
    Ok(())
}
