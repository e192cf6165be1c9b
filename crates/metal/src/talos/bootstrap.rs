//! Talos cluster bootstrapping over `talosctl`.
//!
//! A run generates (or reuses) cluster secrets, renders machine configs for
//! both roles, pushes them to nodes in maintenance mode, bootstraps etcd on
//! the first control plane exactly once and then joins workers one by one.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{
    node_patch, patch_file_name, Role, TalosWorkspace, KUBECONFIG_FILE, SECRETS_FILE,
    TALOSCONFIG_FILE,
};
use super::parse;
use crate::config::{TalosClusterConfig, TalosNodeConfig};
use crate::error::{Error, Result};
use crate::exec::TalosCli;
use crate::state::{
    write_artifact, Checkpoint, ClusterStatus, ComputedState, NoCheckpoint, TalosClusterState,
};
use crate::wait::{wait_until, WaitOptions, DEFAULT_POLL_INTERVAL};

/// Default Talos API port.
pub const TALOS_API_PORT: u16 = 50000;

fn args(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| (*w).to_string()).collect()
}

/// Subcommand aimed at one node through the workspace talosconfig.
///
/// The endpoint is passed explicitly because a fresh talosconfig has no
/// endpoints until `config endpoint` runs.
fn node_args(subcommand: &[&str], node_ip: &str) -> Vec<String> {
    let mut out = args(subcommand);
    out.extend(args(&[
        "--talosconfig",
        TALOSCONFIG_FILE,
        "-e",
        node_ip,
        "-n",
        node_ip,
    ]));
    out
}

/// Drives Talos clusters through a [`TalosCli`].
#[derive(Clone)]
pub struct TalosProvisioner {
    cli: Arc<dyn TalosCli>,
    interval: Duration,
    cancel: CancellationToken,
    checkpoint: Arc<dyn Checkpoint>,
}

impl TalosProvisioner {
    /// Create a provisioner running `cli`.
    #[must_use]
    pub fn new(cli: Arc<dyn TalosCli>) -> Self {
        Self {
            cli,
            interval: DEFAULT_POLL_INTERVAL,
            cancel: CancellationToken::new(),
            checkpoint: Arc::new(NoCheckpoint),
        }
    }

    /// Override the polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Stop waiting and skip remaining nodes when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Save intermediate state through `checkpoint` during
    /// [`provision_cluster`](Self::provision_cluster).
    #[must_use]
    pub fn with_checkpoint(mut self, checkpoint: Arc<dyn Checkpoint>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    fn wait_options(&self, timeout: Duration) -> WaitOptions {
        WaitOptions::new(timeout).with_interval(self.interval)
    }

    fn ensure_active(&self, step: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled(step.to_string()));
        }
        Ok(())
    }

    async fn talosctl(&self, workspace: &TalosWorkspace, args: &[String]) -> Result<String> {
        self.cli.run(workspace.path(), args).await
    }

    /// Generate cluster secrets, or reuse `existing` when the caller kept
    /// them from an earlier run. Returns the secrets document.
    ///
    /// # Errors
    ///
    /// Returns an error if talosctl fails or the secrets cannot be written.
    pub async fn generate_secrets(
        &self,
        workspace: &TalosWorkspace,
        existing: Option<&str>,
    ) -> Result<String> {
        if let Some(secrets) = existing.filter(|s| !s.trim().is_empty()) {
            info!("Reusing existing Talos secrets");
            workspace.write(SECRETS_FILE, secrets)?;
            return Ok(secrets.to_string());
        }

        info!("Generating Talos secrets...");
        self.talosctl(workspace, &args(&["gen", "secrets", "-o", SECRETS_FILE]))
            .await?;
        let secrets = workspace.read(SECRETS_FILE)?;
        info!("✅ Secrets generated");
        Ok(secrets)
    }

    /// Render control plane and worker configs plus a talosconfig aimed at
    /// the control planes.
    ///
    /// # Errors
    ///
    /// Returns an error if talosctl fails.
    pub async fn generate_configs(
        &self,
        workspace: &TalosWorkspace,
        config: &TalosClusterConfig,
    ) -> Result<()> {
        let endpoint = config.resolved_endpoint();
        info!("Generating Talos config for cluster '{}'...", config.name);

        self.talosctl(
            workspace,
            &args(&[
                "gen",
                "config",
                &config.name,
                &endpoint,
                "--with-secrets",
                SECRETS_FILE,
                "--output-dir",
                ".",
                "--install-disk",
                &config.install_disk,
            ]),
        )
        .await?;

        let first = config.first_control_plane()?;
        let mut endpoints = args(&["config", "endpoint"]);
        endpoints.extend(config.control_plane_ips());
        endpoints.extend(args(&["--talosconfig", TALOSCONFIG_FILE]));
        self.talosctl(workspace, &endpoints).await?;
        self.talosctl(
            workspace,
            &args(&["config", "node", &first.host, "--talosconfig", TALOSCONFIG_FILE]),
        )
        .await?;

        info!("✅ Configs generated");
        Ok(())
    }

    /// Push the role config, plus the node's patch, to a node in maintenance
    /// mode. The node installs to disk and reboots.
    ///
    /// # Errors
    ///
    /// Returns an error if talosctl fails.
    pub async fn apply_config(
        &self,
        workspace: &TalosWorkspace,
        node: &TalosNodeConfig,
        role: Role,
        config: &TalosClusterConfig,
    ) -> Result<()> {
        info!("Applying Talos config to {}...", node.host);

        let mut apply = args(&[
            "apply-config",
            "--insecure",
            "--nodes",
            &node.host,
            "--file",
            role.config_file(),
        ]);
        if let Some(patch) = node_patch(node, role, config.allow_scheduling_on_control_plane)? {
            let name = patch_file_name(&node.host);
            workspace.write(&name, &patch)?;
            apply.push("--config-patch".into());
            apply.push(format!("@{name}"));
        }

        self.talosctl(workspace, &apply).await?;
        info!("✅ Config applied to {}! Node will install and reboot.", node.host);
        Ok(())
    }

    /// Wait until the node answers on the authenticated Talos API.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] or [`Error::Cancelled`].
    pub async fn wait_for_api(
        &self,
        workspace: &TalosWorkspace,
        node_ip: &str,
        timeout: Duration,
    ) -> Result<()> {
        info!(
            "Waiting for Talos API at {node_ip}:{TALOS_API_PORT} (timeout: {}s)...",
            timeout.as_secs()
        );
        let version = node_args(&["version"], node_ip);
        let what = format!("Talos API on {node_ip}");
        let version = &version;
        wait_until(&what, self.wait_options(timeout), &self.cancel, move || async move {
            self.talosctl(workspace, version).await.map(|_| true)
        })
        .await
    }

    /// Whether etcd on `node_ip` already has members. Unreachable nodes and
    /// unreadable output count as not bootstrapped.
    pub async fn is_bootstrapped(&self, workspace: &TalosWorkspace, node_ip: &str) -> bool {
        match self
            .talosctl(workspace, &node_args(&["etcd", "status"], node_ip))
            .await
        {
            Ok(out) => parse::is_bootstrapped(&out),
            Err(e) => {
                debug!(node = node_ip, error = %e, "etcd status unavailable");
                false
            }
        }
    }

    /// Bootstrap etcd on `node_ip` unless it already is, then wait for the
    /// etcd service to run.
    ///
    /// # Errors
    ///
    /// Returns an error if the bootstrap call fails or etcd never starts.
    pub async fn bootstrap(
        &self,
        workspace: &TalosWorkspace,
        node_ip: &str,
        timeout: Duration,
    ) -> Result<()> {
        if self.is_bootstrapped(workspace, node_ip).await {
            warn!("Cluster appears to already be bootstrapped");
        } else {
            info!("Bootstrapping Talos cluster on {node_ip}...");
            match self
                .talosctl(workspace, &node_args(&["bootstrap"], node_ip))
                .await
            {
                Ok(_) => info!("✅ Cluster bootstrapped!"),
                Err(e) if parse::is_already_bootstrapped(&e.to_string()) => {
                    warn!("Cluster appears to already be bootstrapped");
                }
                Err(e) => return Err(e),
            }
        }

        self.wait_for_service(workspace, node_ip, "etcd", timeout)
            .await
    }

    /// Poll `talosctl service <service>` until it is `Running`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] or [`Error::Cancelled`].
    pub async fn wait_for_service(
        &self,
        workspace: &TalosWorkspace,
        node_ip: &str,
        service: &str,
        timeout: Duration,
    ) -> Result<()> {
        info!(
            "Waiting for {service} on {node_ip} (timeout: {}s)...",
            timeout.as_secs()
        );
        let status_args = node_args(&["service", service], node_ip);
        let what = format!("{service} running on {node_ip}");
        let status_args = &status_args;
        wait_until(&what, self.wait_options(timeout), &self.cancel, move || async move {
            let out = self.talosctl(workspace, status_args).await?;
            Ok(parse::is_service_running(&out))
        })
        .await?;

        info!("✅ {service} is running on {node_ip}");
        Ok(())
    }

    /// Run the cluster health check from `control_plane_ip`.
    ///
    /// Never fails: an unhealthy or unreachable cluster is
    /// [`ClusterStatus::Degraded`].
    pub async fn check_cluster_health(
        &self,
        workspace: &TalosWorkspace,
        config: &TalosClusterConfig,
        control_plane_ip: &str,
        wait: Duration,
    ) -> ClusterStatus {
        let wait_timeout = format!("{}s", wait.as_secs().max(1));
        let mut check = args(&["health", "--wait-timeout", &wait_timeout]);
        check.push("--control-plane-nodes".into());
        check.push(config.control_plane_ips().join(","));
        if !config.workers.is_empty() {
            check.push("--worker-nodes".into());
            check.push(config.worker_ips().join(","));
        }
        check.extend(node_args(&[], control_plane_ip));

        match self.talosctl(workspace, &check).await {
            Ok(_) => {
                info!("✅ Cluster {} is healthy", config.name);
                ClusterStatus::Ready
            }
            Err(e) => {
                warn!(
                    cluster = %config.name,
                    error = %e,
                    "Health check failed, cluster is degraded"
                );
                ClusterStatus::Degraded
            }
        }
    }

    /// Fetch the admin kubeconfig through `node_ip`.
    ///
    /// # Errors
    ///
    /// Returns an error if talosctl fails.
    pub async fn get_kubeconfig(
        &self,
        workspace: &TalosWorkspace,
        node_ip: &str,
    ) -> Result<String> {
        info!("Fetching kubeconfig...");
        self.talosctl(
            workspace,
            &node_args(&["kubeconfig", KUBECONFIG_FILE, "--force"], node_ip),
        )
        .await?;
        workspace.read(KUBECONFIG_FILE)
    }

    /// Talos version running on `node_ip`.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is unreachable or reports no version.
    pub async fn get_version(&self, workspace: &TalosWorkspace, node_ip: &str) -> Result<String> {
        let out = self
            .talosctl(workspace, &node_args(&["version"], node_ip))
            .await?;
        parse::server_version(&out)
            .map(str::to_string)
            .ok_or_else(|| Error::command("talosctl version", "no server version in output"))
    }

    /// Wipe a node and reboot it into maintenance mode.
    ///
    /// The node drops its API mid-call; such disconnects count as success.
    ///
    /// # Errors
    ///
    /// Returns any other talosctl failure.
    pub async fn reset_node(&self, workspace: &TalosWorkspace, node_ip: &str) -> Result<()> {
        info!("Resetting Talos node {node_ip}...");
        let reset = node_args(
            &["reset", "--graceful=false", "--reboot", "--wait=false"],
            node_ip,
        );
        match self.talosctl(workspace, &reset).await {
            Ok(_) => Ok(()),
            Err(e) if parse::is_reset_disconnect(&e.to_string()) => {
                debug!(node = node_ip, error = %e, "Node dropped connection while resetting");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Reset workers, then control planes. Every node is attempted once;
    /// failures are logged and never abort the teardown.
    pub async fn destroy_cluster(
        &self,
        workspace: &TalosWorkspace,
        control_plane_ips: &[String],
        worker_ips: &[String],
    ) {
        for ip in worker_ips.iter().chain(control_plane_ips) {
            if let Err(e) = self.reset_node(workspace, ip).await {
                warn!(node = %ip, error = %e, "Failed to reset node, continuing");
            }
        }
        info!("✅ Teardown finished");
    }

    /// Provision the whole cluster described by `config`.
    ///
    /// Pass the secrets from an earlier run as `existing_secrets` to keep
    /// the cluster's identity. The secrets are written to `secrets_path` and
    /// checkpointed before any node is touched. A worker whose kubelet never
    /// starts is skipped, and a failing final health check yields
    /// [`ClusterStatus::Degraded`] rather than an error.
    ///
    /// # Errors
    ///
    /// Returns the first failing step before the health check.
    pub async fn provision_cluster(
        &self,
        config: &TalosClusterConfig,
        existing_secrets: Option<&str>,
    ) -> Result<TalosClusterState> {
        config.validate()?;
        let settings = &config.settings;
        let workspace = TalosWorkspace::new()?;
        let first = config.first_control_plane()?;

        let secrets_yaml = self.generate_secrets(&workspace, existing_secrets).await?;
        write_artifact("secrets", config.secrets_path.as_deref(), &secrets_yaml)?;
        let mut state = TalosClusterState {
            secrets_yaml,
            talos_config: String::new(),
            kubeconfig: String::new(),
            api_endpoint: config.resolved_endpoint(),
            status: ClusterStatus::Bootstrapping,
            control_plane_ips: config.control_plane_ips(),
            worker_ips: config.worker_ips(),
        };
        self.checkpoint.save(&ComputedState::Talos(state.clone()))?;

        self.generate_configs(&workspace, config).await?;
        state.talos_config = workspace.read(TALOSCONFIG_FILE)?;
        self.checkpoint.save(&ComputedState::Talos(state.clone()))?;

        for node in &config.control_planes {
            self.ensure_active("control plane config")?;
            self.apply_config(&workspace, node, Role::ControlPlane, config)
                .await?;
        }

        self.wait_for_api(&workspace, &first.host, settings.install_timeout())
            .await?;
        self.bootstrap(&workspace, &first.host, settings.install_timeout())
            .await?;

        for worker in &config.workers {
            self.ensure_active("worker join")?;
            self.apply_config(&workspace, worker, Role::Worker, config)
                .await?;
            let kubelet = self
                .wait_for_service(
                    &workspace,
                    &worker.host,
                    "kubelet",
                    settings.node_ready_timeout(),
                )
                .await;
            match kubelet {
                Ok(()) => {}
                Err(e @ Error::Timeout { .. }) => {
                    warn!(node = %worker.host, error = %e, "Worker did not join, continuing");
                }
                Err(e) => return Err(e),
            }
        }

        state.status = self
            .check_cluster_health(&workspace, config, &first.host, config.bootstrap_timeout())
            .await;
        state.kubeconfig = self.get_kubeconfig(&workspace, &first.host).await?;
        Ok(state)
    }
}
