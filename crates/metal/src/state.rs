//! Computed cluster state and its persistence.
//!
//! The orchestrator returns a [`ClusterState`] or [`TalosClusterState`];
//! the CLI stores it, together with the definition that produced it, in a
//! JSON state file so later reads and updates can judge drift and reuse the
//! join token or cluster secrets.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ClusterDefinition;
use crate::error::{Error, Result};

/// Health of a provisioned cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    /// Provisioning has started but not finished.
    Bootstrapping,
    /// All expected nodes are Ready / the health check passed.
    Ready,
    /// Reachable with usable credentials but failing a health check.
    Degraded,
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bootstrapping => write!(f, "bootstrapping"),
            Self::Ready => write!(f, "ready"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// Outputs of a k3s cluster.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Admin kubeconfig with the real API address.
    pub kubeconfig: String,
    /// Node token read back from the control plane.
    pub node_token: String,
    /// Join token the cluster was installed with.
    pub token: String,
    /// `https://<control plane>:6443`.
    pub api_endpoint: String,
    /// Last derived status.
    pub status: ClusterStatus,
    /// Node names observed on the last read.
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterState")
            .field("api_endpoint", &self.api_endpoint)
            .field("status", &self.status)
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

/// Outputs of a Talos cluster.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TalosClusterState {
    /// Cluster PKI generated once; losing it makes the cluster unmanageable.
    pub secrets_yaml: String,
    /// talosctl client configuration.
    pub talos_config: String,
    /// Admin kubeconfig.
    pub kubeconfig: String,
    /// Kubernetes endpoint.
    pub api_endpoint: String,
    /// Last derived status.
    pub status: ClusterStatus,
    /// Control plane addresses.
    pub control_plane_ips: Vec<String>,
    /// Worker addresses.
    pub worker_ips: Vec<String>,
}

impl fmt::Debug for TalosClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TalosClusterState")
            .field("api_endpoint", &self.api_endpoint)
            .field("status", &self.status)
            .field("control_plane_ips", &self.control_plane_ips)
            .field("worker_ips", &self.worker_ips)
            .finish_non_exhaustive()
    }
}

/// Backend-specific computed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum ComputedState {
    /// k3s outputs.
    K3s(ClusterState),
    /// Talos outputs.
    Talos(TalosClusterState),
}

impl ComputedState {
    /// Current status.
    #[must_use]
    pub fn status(&self) -> ClusterStatus {
        match self {
            Self::K3s(s) => s.status,
            Self::Talos(s) => s.status,
        }
    }

    /// Admin kubeconfig.
    #[must_use]
    pub fn kubeconfig(&self) -> &str {
        match self {
            Self::K3s(s) => &s.kubeconfig,
            Self::Talos(s) => &s.kubeconfig,
        }
    }

    /// Kubernetes endpoint.
    #[must_use]
    pub fn api_endpoint(&self) -> &str {
        match self {
            Self::K3s(s) => &s.api_endpoint,
            Self::Talos(s) => &s.api_endpoint,
        }
    }
}

/// What the CLI remembers between invocations for one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    /// Definition the cluster was created from.
    pub definition: ClusterDefinition,
    /// Outputs of the last create/read/update.
    pub state: ComputedState,
    /// Timestamp of last update.
    pub updated_at: String,
}

impl StateRecord {
    /// Wrap a definition and its computed state.
    #[must_use]
    pub fn new(definition: ClusterDefinition, state: ComputedState) -> Self {
        Self {
            definition,
            state,
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// State file path for a cluster.
    #[must_use]
    pub fn state_file(state_dir: &Path, cluster_name: &str) -> PathBuf {
        state_dir.join(format!("{cluster_name}.state.json"))
    }

    /// Load a cluster's state, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(state_dir: &Path, cluster_name: &str) -> Result<Option<Self>> {
        let path = Self::state_file(state_dir, cluster_name);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)?;
        let record: Self = serde_json::from_str(&content)?;
        debug!(path = %path.display(), status = %record.state.status(), "Loaded cluster state");
        Ok(Some(record))
    }

    /// Save state. The file holds secrets and is written owner-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&mut self, state_dir: &Path) -> Result<PathBuf> {
        self.updated_at = chrono::Utc::now().to_rfc3339();
        std::fs::create_dir_all(state_dir)?;

        let path = Self::state_file(state_dir, self.definition.name());
        let content = serde_json::to_string_pretty(self)?;
        write_private(&path, &content)?;
        Ok(path)
    }

    /// Remove a cluster's state file. Missing files are fine.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove(state_dir: &Path, cluster_name: &str) -> Result<()> {
        let path = Self::state_file(state_dir, cluster_name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Receives intermediate state while a create is still running.
///
/// Provisioning saves a [`ClusterStatus::Bootstrapping`] state holding the
/// join token or cluster secrets before the first node is changed, and again
/// after each phase, so a failed run can be resumed with the same identity.
pub trait Checkpoint: Send + Sync {
    /// Persist `state`.
    ///
    /// # Errors
    ///
    /// A failing checkpoint aborts provisioning.
    fn save(&self, state: &ComputedState) -> Result<()>;
}

/// Discards checkpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCheckpoint;

impl Checkpoint for NoCheckpoint {
    fn save(&self, _state: &ComputedState) -> Result<()> {
        Ok(())
    }
}

/// Saves checkpoints as the cluster's [`StateRecord`].
#[derive(Debug, Clone)]
pub struct StateFileCheckpoint {
    state_dir: PathBuf,
    definition: ClusterDefinition,
}

impl StateFileCheckpoint {
    /// Checkpoint `definition`'s state into `state_dir`.
    #[must_use]
    pub fn new(state_dir: impl Into<PathBuf>, definition: ClusterDefinition) -> Self {
        Self {
            state_dir: state_dir.into(),
            definition,
        }
    }
}

impl Checkpoint for StateFileCheckpoint {
    fn save(&self, state: &ComputedState) -> Result<()> {
        let mut record = StateRecord::new(self.definition.clone(), state.clone());
        let path = record.save(&self.state_dir)?;
        debug!(path = %path.display(), status = %state.status(), "Checkpointed cluster state");
        Ok(())
    }
}

/// Write `content` to `path` readable and writable by the owner only.
///
/// # Errors
///
/// Returns an error if the parent directory or file cannot be written.
pub fn write_private(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(content.as_bytes())?;

    // `mode` only applies on creation; tighten files that already existed.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

/// Write an optional artifact, logging where it went.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_artifact(kind: &str, path: Option<&Path>, content: &str) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    if content.is_empty() {
        debug!(kind, "Skipping empty artifact");
        return Ok(());
    }
    write_private(path, content)?;
    info!(kind, path = %path.display(), "Wrote artifact");
    Ok(())
}
