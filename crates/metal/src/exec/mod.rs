//! Narrow interfaces to the external tools the provisioners drive.
//!
//! Each tool has exactly one production implementation here and a
//! deterministic fake under `crate::testing`. Provisioners depend only on
//! the traits.

mod helm;
mod kubectl;
mod ssh;
mod talosctl;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::NodeConfig;
use crate::error::Result;
use crate::state::write_private;

pub use helm::HelmCli;
pub use kubectl::Kubectl;
pub use ssh::SshShell;
pub use talosctl::Talosctl;

/// Opens remote shell sessions to nodes.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Connect and authenticate to `node`.
    async fn connect(&self, node: &NodeConfig) -> Result<Box<dyn RemoteSession>>;
}

/// An authenticated remote shell session.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run `command` and return its combined stdout/stderr.
    ///
    /// A non-zero exit status is an [`Error::Command`](crate::Error::Command).
    async fn run(&self, command: &str) -> Result<String>;

    /// Close the session. Errors are not interesting to callers.
    async fn close(&self);
}

/// Runs `talosctl` with a working directory.
#[async_trait]
pub trait TalosCli: Send + Sync {
    /// Run `talosctl <args>` inside `workdir`, returning combined output.
    async fn run(&self, workdir: &Path, args: &[String]) -> Result<String>;
}

/// Helm release status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    Deployed,
    Failed,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
    Superseded,
    Uninstalling,
    Uninstalled,
    #[serde(other)]
    Unknown,
}

impl ReleaseStatus {
    /// Whether helm is still working on the release.
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            Self::PendingInstall | Self::PendingUpgrade | Self::PendingRollback
        )
    }
}

/// A helm release as reported by the chart installer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    /// Release name.
    pub name: String,
    /// Namespace the release lives in.
    pub namespace: String,
    /// Last reported status.
    pub status: ReleaseStatus,
    /// Helm revision, starting at 1.
    pub revision: u32,
}

/// Install-or-upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseSpec {
    /// Release name.
    pub release_name: String,
    /// `repo/chart` reference.
    pub chart: String,
    /// Chart version; latest when unset.
    pub version: Option<String>,
    /// Target namespace.
    pub namespace: String,
    /// Values file contents.
    pub values_yaml: String,
    /// Create the namespace if missing.
    pub create_namespace: bool,
    /// Wait for resources to become ready.
    pub wait: bool,
    /// Helm operation timeout.
    pub timeout: std::time::Duration,
    /// Roll back on failure.
    pub atomic: bool,
}

/// Adds chart repositories and installs releases.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChartInstaller: Send + Sync {
    /// Register a chart repository. Re-adding an existing one succeeds.
    async fn add_repository(&self, name: &str, url: &str) -> Result<()>;

    /// Install or upgrade a release.
    async fn install_or_upgrade(&self, spec: &ReleaseSpec) -> Result<Release>;

    /// Look up a release.
    async fn get_release(&self, name: &str, namespace: &str) -> Result<Release>;
}

/// Minimal Kubernetes API surface.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KubeApi: Send + Sync {
    /// Server-side upsert of one or more manifests.
    async fn apply(&self, manifest_yaml: &str) -> Result<()>;

    /// Delete the objects in a manifest. Missing objects are ignored.
    async fn delete(&self, manifest_yaml: &str) -> Result<()>;

    /// Fetch an object as JSON. An empty namespace means cluster scope.
    async fn get(&self, kind: &str, name: &str, namespace: &str) -> Result<String>;
}

/// Chart and API clients bound to one cluster's kubeconfig.
#[derive(Clone)]
pub struct ClusterClients {
    pub charts: Arc<dyn ChartInstaller>,
    pub kube: Arc<dyn KubeApi>,
    // Keeps the kubeconfig file alive as long as the clients.
    _kubeconfig: Option<Arc<tempfile::TempPath>>,
}

impl ClusterClients {
    /// Wrap existing clients.
    #[must_use]
    pub fn new(charts: Arc<dyn ChartInstaller>, kube: Arc<dyn KubeApi>) -> Self {
        Self {
            charts,
            kube,
            _kubeconfig: None,
        }
    }
}

/// Builds [`ClusterClients`] once cluster credentials exist.
pub trait ClientFactory: Send + Sync {
    /// Clients that talk to the cluster described by `kubeconfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if the kubeconfig cannot be staged.
    fn clients(&self, kubeconfig: &str) -> Result<ClusterClients>;
}

/// Production factory: `helm` and `kubectl` against a private kubeconfig.
#[derive(Debug, Clone, Default)]
pub struct CliClientFactory;

impl ClientFactory for CliClientFactory {
    fn clients(&self, kubeconfig: &str) -> Result<ClusterClients> {
        let file = tempfile::Builder::new()
            .prefix("metal-cluster-kubeconfig-")
            .tempfile()?;
        let path = file.into_temp_path();
        write_private(&path, kubeconfig)?;

        Ok(ClusterClients {
            charts: Arc::new(HelmCli::new(path.to_path_buf())),
            kube: Arc::new(Kubectl::new(path.to_path_buf())),
            _kubeconfig: Some(Arc::new(path)),
        })
    }
}

/// Merge stdout and stderr the way a terminal would show them.
pub(crate) fn combined_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut out = String::from_utf8_lossy(stdout).into_owned();
    let err = String::from_utf8_lossy(stderr);
    if !err.trim().is_empty() {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&err);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_output() {
        assert_eq!(combined_output(b"ok", b""), "ok");
        assert_eq!(combined_output(b"ok", b"warn\n"), "ok\nwarn\n");
        assert_eq!(combined_output(b"", b"boom"), "boom");
    }

    #[test]
    fn test_release_status_parsing() {
        let status: ReleaseStatus = serde_json::from_str("\"pending-install\"").unwrap();
        assert!(status.is_pending());
        let status: ReleaseStatus = serde_json::from_str("\"something-new\"").unwrap();
        assert_eq!(status, ReleaseStatus::Unknown);
    }

    #[test]
    fn test_cli_factory_stages_private_kubeconfig() {
        let clients = CliClientFactory.clients("apiVersion: v1\n").unwrap();
        let path = clients._kubeconfig.as_ref().unwrap().to_path_buf();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "apiVersion: v1\n");
        drop(clients);
        assert!(!path.exists());
    }
}
