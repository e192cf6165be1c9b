//! Per-node machine config patches and the run's working directory.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::TempDir;

use crate::config::TalosNodeConfig;
use crate::error::Result;
use crate::state::write_private;

/// Cluster secrets file inside the workspace.
pub const SECRETS_FILE: &str = "secrets.yaml";

/// Control plane machine config.
pub const CONTROLPLANE_FILE: &str = "controlplane.yaml";

/// Worker machine config.
pub const WORKER_FILE: &str = "worker.yaml";

/// talosctl client config.
pub const TALOSCONFIG_FILE: &str = "talosconfig";

/// Fetched kubeconfig.
pub const KUBECONFIG_FILE: &str = "kubeconfig";

/// Machine role a config is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    ControlPlane,
    Worker,
}

impl Role {
    /// Base machine config for this role.
    #[must_use]
    pub fn config_file(self) -> &'static str {
        match self {
            Self::ControlPlane => CONTROLPLANE_FILE,
            Self::Worker => WORKER_FILE,
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct MachinePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    machine: Option<MachineSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cluster: Option<ClusterSection>,
}

#[derive(Debug, Serialize)]
struct MachineSection {
    network: NetworkSection,
}

#[derive(Debug, Serialize)]
struct NetworkSection {
    hostname: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterSection {
    allow_scheduling_on_control_planes: bool,
}

/// Strategic-merge patch for one node, or `None` when nothing differs
/// from the generated role config.
///
/// # Errors
///
/// Returns an error if the patch cannot be serialized.
pub fn node_patch(
    node: &TalosNodeConfig,
    role: Role,
    allow_scheduling_on_control_plane: bool,
) -> Result<Option<String>> {
    let mut patch = MachinePatch::default();
    if let Some(hostname) = node.hostname.as_deref().filter(|h| !h.is_empty()) {
        patch.machine = Some(MachineSection {
            network: NetworkSection {
                hostname: hostname.to_string(),
            },
        });
    }
    if role == Role::ControlPlane && allow_scheduling_on_control_plane {
        patch.cluster = Some(ClusterSection {
            allow_scheduling_on_control_planes: true,
        });
    }

    if patch.machine.is_none() && patch.cluster.is_none() {
        return Ok(None);
    }
    Ok(Some(serde_yaml::to_string(&patch)?))
}

/// Private working directory for one talosctl session.
///
/// Holds secrets, generated machine configs, talosconfig and kubeconfig.
/// Removed when dropped.
#[derive(Debug)]
pub struct TalosWorkspace {
    dir: TempDir,
}

impl TalosWorkspace {
    /// Create an empty workspace.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("metal-cluster-talos-")
            .tempdir()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self { dir })
    }

    /// A workspace holding an existing talosconfig, for talking to a
    /// cluster provisioned earlier.
    ///
    /// # Errors
    ///
    /// Returns an error if the workspace cannot be written.
    pub fn with_talosconfig(talos_config: &str) -> Result<Self> {
        let workspace = Self::new()?;
        workspace.write(TALOSCONFIG_FILE, talos_config)?;
        Ok(workspace)
    }

    /// Directory talosctl runs in.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path of a file inside the workspace.
    #[must_use]
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write a file owner-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write(&self, name: &str, content: &str) -> Result<()> {
        write_private(&self.file(name), content)
    }

    /// Read a file produced by talosctl.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist.
    pub fn read(&self, name: &str) -> Result<String> {
        Ok(std::fs::read_to_string(self.file(name))?)
    }
}

/// File name for a node's patch; safe for IPv6 hosts.
#[must_use]
pub fn patch_file_name(host: &str) -> String {
    let safe: String = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("patch-{safe}.yaml")
}
