//! Cluster lifecycle: create, read, update and delete for both backends.
//!
//! Orchestrators sequence the provisioners, deploy add-ons once the cluster
//! answers, and write the operator's artifacts. They hold no state between
//! calls; the caller passes back whatever a previous call returned.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::addons::AddonDeployer;
use crate::config::{Addons, ClusterConfig, ProvisionerSettings, TalosClusterConfig};
use crate::error::{Error, Result};
use crate::exec::{ClientFactory, RemoteShell, TalosCli};
use crate::k3s::{derive_status, generate_cluster_token, K3sProvisioner};
use crate::state::{
    write_artifact, Checkpoint, ClusterState, ClusterStatus, ComputedState, NoCheckpoint,
    TalosClusterState,
};
use crate::talos::{TalosProvisioner, TalosWorkspace};

async fn deploy_addons(
    factory: &dyn ClientFactory,
    kubeconfig: &str,
    addons: &Addons,
    settings: &ProvisionerSettings,
    cancel: &CancellationToken,
) -> Result<()> {
    if !addons.any_enabled() {
        return Ok(());
    }
    let deployer = AddonDeployer::new(factory.clients(kubeconfig)?)
        .with_timing(settings.poll_interval(), settings.addon_timeout())
        .with_cancellation(cancel.clone());
    deployer.deploy_all(addons).await
}

fn ensure_active(cancel: &CancellationToken, step: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled(step.to_string()));
    }
    Ok(())
}

/// Lifecycle of k3s clusters.
pub struct K3sOrchestrator {
    shell: Arc<dyn RemoteShell>,
    clients: Arc<dyn ClientFactory>,
    cancel: CancellationToken,
    checkpoint: Arc<dyn Checkpoint>,
}

impl K3sOrchestrator {
    /// Create an orchestrator using `shell` for nodes and `clients` for
    /// add-ons.
    #[must_use]
    pub fn new(shell: Arc<dyn RemoteShell>, clients: Arc<dyn ClientFactory>) -> Self {
        Self {
            shell,
            clients,
            cancel: CancellationToken::new(),
            checkpoint: Arc::new(NoCheckpoint),
        }
    }

    /// Abort waits and skip remaining nodes when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Save the in-progress state, token included, while creating.
    #[must_use]
    pub fn with_checkpoint(mut self, checkpoint: Arc<dyn Checkpoint>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    fn save_progress(&self, state: &ClusterState) -> Result<()> {
        self.checkpoint.save(&ComputedState::K3s(state.clone()))
    }

    fn provisioner(&self, settings: &ProvisionerSettings) -> K3sProvisioner {
        K3sProvisioner::new(Arc::clone(&self.shell))
            .with_poll_interval(settings.poll_interval())
            .with_cancellation(self.cancel.clone())
    }

    /// Install the control plane, join workers one at a time, deploy
    /// add-ons and write the kubeconfig.
    ///
    /// The token is checkpointed as [`ClusterStatus::Bootstrapping`] before
    /// any node is contacted. A worker that never turns Ready is skipped
    /// and leaves the cluster [`ClusterStatus::Degraded`].
    ///
    /// # Errors
    ///
    /// Returns the first failing step. Nodes already installed stay
    /// installed; running create again with the checkpointed token
    /// converges.
    pub async fn create(&self, config: &ClusterConfig) -> Result<ClusterState> {
        config.validate()?;
        let settings = &config.settings;
        let k3s = self.provisioner(settings);

        let mut config = config.clone();
        let token = match config.supplied_token() {
            Some(token) => token.to_string(),
            None => {
                info!("No cluster token supplied, generating one");
                generate_cluster_token()
            }
        };
        config.token = Some(token.clone());

        let mut state = ClusterState {
            kubeconfig: String::new(),
            node_token: String::new(),
            token,
            api_endpoint: config.api_endpoint(),
            status: ClusterStatus::Bootstrapping,
            nodes: Vec::new(),
        };
        self.save_progress(&state)?;

        let control_plane = &config.control_plane;
        info!("🚀 Creating k3s cluster '{}'", config.name);
        k3s.wait_for_ssh(control_plane, settings.ssh_timeout()).await?;
        k3s.install_control_plane(control_plane, &config, settings.install_timeout())
            .await?;

        state.node_token = k3s.get_node_token(control_plane).await?;
        state.kubeconfig = k3s.get_kubeconfig(control_plane).await?;
        self.save_progress(&state)?;

        for worker in &config.workers {
            ensure_active(&self.cancel, "worker join")?;
            k3s.install_agent(
                worker,
                &state.api_endpoint,
                &state.node_token,
                config.version.as_deref(),
                settings.ssh_timeout(),
            )
            .await?;
            let ready = k3s
                .wait_for_node_ready(control_plane, worker, settings.node_ready_timeout())
                .await;
            match ready {
                Ok(()) => {}
                Err(e @ Error::Timeout { .. }) => {
                    warn!(node = %worker.host, error = %e, "Worker not Ready, continuing");
                }
                Err(e) => return Err(e),
            }
        }

        let nodes = k3s.get_cluster_nodes(control_plane).await?;
        state.status = derive_status(&nodes, &config);
        state.nodes = nodes.into_iter().map(|n| n.name).collect();

        deploy_addons(
            self.clients.as_ref(),
            &state.kubeconfig,
            &config.addons,
            settings,
            &self.cancel,
        )
        .await?;
        write_artifact("kubeconfig", config.kubeconfig_path.as_deref(), &state.kubeconfig)?;

        info!("✅ Cluster '{}' is {}", config.name, state.status);
        Ok(state)
    }

    /// Refresh state from the nodes. `None` means k3s is gone from the
    /// control plane and the cluster should be considered deleted.
    ///
    /// # Errors
    ///
    /// Fails if the control plane cannot be reached at all.
    pub async fn read(
        &self,
        config: &ClusterConfig,
        previous: &ClusterState,
    ) -> Result<Option<ClusterState>> {
        let k3s = self.provisioner(&config.settings);
        let control_plane = &config.control_plane;

        if !k3s.check_installed(control_plane).await? {
            warn!("k3s is not installed on {}, cluster was removed", control_plane.host);
            return Ok(None);
        }

        let mut state = previous.clone();
        match k3s.get_cluster_nodes(control_plane).await {
            Ok(nodes) => {
                state.status = derive_status(&nodes, config);
                state.nodes = nodes.into_iter().map(|n| n.name).collect();
            }
            Err(e) => {
                warn!(error = %e, "Could not list nodes, cluster is degraded");
                state.status = ClusterStatus::Degraded;
            }
        }
        match k3s.get_kubeconfig(control_plane).await {
            Ok(kubeconfig) => state.kubeconfig = kubeconfig,
            Err(e) => warn!(error = %e, "Keeping previous kubeconfig"),
        }
        Ok(Some(state))
    }

    /// Apply changes to an existing cluster. Only add-ons, artifact paths
    /// and timings may change; anything touching nodes needs a new cluster.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequiresReplacement`] for immutable changes.
    pub async fn update(
        &self,
        config: &ClusterConfig,
        previous_config: &ClusterConfig,
        previous: &ClusterState,
    ) -> Result<ClusterState> {
        if let Some(field) = config.replacement_field(previous_config) {
            return Err(Error::requires_replacement(field));
        }
        config.validate()?;

        let state = self
            .read(config, previous)
            .await?
            .ok_or_else(|| {
                Error::command("update", "k3s is no longer installed on the control plane")
            })?;

        if config.addons != previous_config.addons {
            info!("Add-ons changed, redeploying");
            deploy_addons(
                self.clients.as_ref(),
                &state.kubeconfig,
                &config.addons,
                &config.settings,
                &self.cancel,
            )
            .await?;
        }
        write_artifact("kubeconfig", config.kubeconfig_path.as_deref(), &state.kubeconfig)?;
        Ok(state)
    }

    /// Uninstall agents, then the control plane.
    ///
    /// # Errors
    ///
    /// Worker failures are logged; a control plane failure is returned.
    pub async fn delete(&self, config: &ClusterConfig) -> Result<()> {
        let k3s = self.provisioner(&config.settings);
        info!("🗑️  Deleting k3s cluster '{}'", config.name);

        for worker in &config.workers {
            if let Err(e) = k3s.uninstall_agent(worker).await {
                warn!(node = %worker.host, error = %e, "Failed to uninstall agent, continuing");
            }
        }
        k3s.uninstall_control_plane(&config.control_plane).await?;

        info!("✅ Cluster '{}' deleted", config.name);
        Ok(())
    }
}

/// Lifecycle of Talos clusters.
pub struct TalosOrchestrator {
    cli: Arc<dyn TalosCli>,
    clients: Arc<dyn ClientFactory>,
    cancel: CancellationToken,
    checkpoint: Arc<dyn Checkpoint>,
}

impl TalosOrchestrator {
    /// Create an orchestrator running `cli` and deploying add-ons through
    /// `clients`.
    #[must_use]
    pub fn new(cli: Arc<dyn TalosCli>, clients: Arc<dyn ClientFactory>) -> Self {
        Self {
            cli,
            clients,
            cancel: CancellationToken::new(),
            checkpoint: Arc::new(NoCheckpoint),
        }
    }

    /// Abort waits and skip remaining nodes when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Save the in-progress state, secrets included, while creating.
    #[must_use]
    pub fn with_checkpoint(mut self, checkpoint: Arc<dyn Checkpoint>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    fn provisioner(&self, settings: &ProvisionerSettings) -> TalosProvisioner {
        TalosProvisioner::new(Arc::clone(&self.cli))
            .with_poll_interval(settings.poll_interval())
            .with_cancellation(self.cancel.clone())
            .with_checkpoint(Arc::clone(&self.checkpoint))
    }

    fn write_artifacts(config: &TalosClusterConfig, state: &TalosClusterState) -> Result<()> {
        write_artifact("kubeconfig", config.kubeconfig_path.as_deref(), &state.kubeconfig)?;
        write_artifact("talosconfig", config.talosconfig_path.as_deref(), &state.talos_config)?;
        write_artifact("secrets", config.secrets_path.as_deref(), &state.secrets_yaml)
    }

    /// Provision the cluster, deploy add-ons and write artifacts.
    ///
    /// # Errors
    ///
    /// Returns the first failing step.
    pub async fn create(
        &self,
        config: &TalosClusterConfig,
        existing_secrets: Option<&str>,
    ) -> Result<TalosClusterState> {
        info!("🚀 Creating Talos cluster '{}'", config.name);
        let state = self
            .provisioner(&config.settings)
            .provision_cluster(config, existing_secrets)
            .await?;

        Self::write_artifacts(config, &state)?;

        deploy_addons(
            self.clients.as_ref(),
            &state.kubeconfig,
            &config.addons,
            &config.settings,
            &self.cancel,
        )
        .await?;

        info!("✅ Cluster '{}' is {}", config.name, state.status);
        Ok(state)
    }

    /// Re-run the health check and refresh the kubeconfig when healthy.
    ///
    /// # Errors
    ///
    /// Fails only if the local workspace cannot be created.
    pub async fn read(
        &self,
        config: &TalosClusterConfig,
        previous: &TalosClusterState,
    ) -> Result<Option<TalosClusterState>> {
        let talos = self.provisioner(&config.settings);
        let workspace = TalosWorkspace::with_talosconfig(&previous.talos_config)?;
        let first = config.first_control_plane()?;

        let mut state = previous.clone();
        state.status = talos
            .check_cluster_health(
                &workspace,
                config,
                &first.host,
                config.settings.health_check_timeout(),
            )
            .await;
        if state.status == ClusterStatus::Ready {
            match talos.get_kubeconfig(&workspace, &first.host).await {
                Ok(kubeconfig) => state.kubeconfig = kubeconfig,
                Err(e) => warn!(error = %e, "Keeping previous kubeconfig"),
            }
        }
        Ok(Some(state))
    }

    /// Apply add-on and artifact changes. Every node attribute is immutable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequiresReplacement`] for immutable changes.
    pub async fn update(
        &self,
        config: &TalosClusterConfig,
        previous_config: &TalosClusterConfig,
        previous: &TalosClusterState,
    ) -> Result<TalosClusterState> {
        if let Some(field) = config.replacement_field(previous_config) {
            return Err(Error::requires_replacement(field));
        }
        config.validate()?;

        let state = self
            .read(config, previous)
            .await?
            .unwrap_or_else(|| previous.clone());

        if config.addons != previous_config.addons {
            info!("Add-ons changed, redeploying");
            deploy_addons(
                self.clients.as_ref(),
                &state.kubeconfig,
                &config.addons,
                &config.settings,
                &self.cancel,
            )
            .await?;
        }
        Self::write_artifacts(config, &state)?;
        Ok(state)
    }

    /// Reset every node back to maintenance mode, workers first.
    ///
    /// # Errors
    ///
    /// Node failures are logged and tolerated; only a local workspace
    /// failure is returned.
    pub async fn delete(
        &self,
        config: &TalosClusterConfig,
        state: &TalosClusterState,
    ) -> Result<()> {
        info!("🗑️  Deleting Talos cluster '{}'", config.name);
        let workspace = TalosWorkspace::with_talosconfig(&state.talos_config)?;
        self.provisioner(&config.settings)
            .destroy_cluster(&workspace, &state.control_plane_ips, &state.worker_ips)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, IngressSpec, LoadBalancerSpec, NodeConfig, TalosNodeConfig};
    use crate::testing::{FakeClientFactory, FakeShell, FakeTalosctl, RecordingCheckpoint};
    use pretty_assertions::assert_eq;

    const K3S_YAML: &str = "apiVersion: v1\nclusters:\n- cluster:\n    server: https://127.0.0.1:6443\n  name: default\nkind: Config\n";

    const BOTH_READY: &str = "\
turing-1   Ready   control-plane,master   2m   v1.31.4+k3s1   10.0.0.10   <none>   Ubuntu 22.04.4 LTS   5.15.0   containerd://1.7.23
turing-2   Ready   <none>                 1m   v1.31.4+k3s1   10.0.0.11   <none>   Ubuntu 22.04.4 LTS   5.15.0   containerd://1.7.23
";

    const SECOND_NOT_READY: &str = "\
turing-1   Ready      control-plane,master   9m   v1.31.4+k3s1   10.0.0.10   <none>   Ubuntu 22.04.4 LTS   5.15.0   containerd://1.7.23
turing-2   NotReady   <none>                 8m   v1.31.4+k3s1   10.0.0.11   <none>   Ubuntu 22.04.4 LTS   5.15.0   containerd://1.7.23
turing-3   Ready      <none>                 1m   v1.31.4+k3s1   10.0.0.12   <none>   Ubuntu 22.04.4 LTS   5.15.0   containerd://1.7.23
";

    fn node(host: &str) -> NodeConfig {
        NodeConfig::new(host, Credentials::key_file("/root/.ssh/id_ed25519"))
    }

    fn demo() -> ClusterConfig {
        let mut cfg = ClusterConfig::new("demo", node("10.0.0.10")).with_worker(node("10.0.0.11"));
        cfg.settings.poll_interval_secs = 1;
        cfg
    }

    fn with_addons(mut cfg: ClusterConfig) -> ClusterConfig {
        cfg.addons = Addons {
            load_balancer: Some(LoadBalancerSpec {
                enabled: true,
                ip_range: "10.0.0.80-10.0.0.89".into(),
                chart_version: None,
            }),
            ingress: Some(IngressSpec {
                enabled: true,
                ip: None,
                chart_version: None,
            }),
        };
        cfg
    }

    fn k3s_cluster() -> FakeShell {
        let shell = FakeShell::new();
        shell
            .respond("[ -e", "no\n")
            .respond("hostname", "turing-1\n")
            .respond("get nodes", BOTH_READY)
            .respond("node-token", "K10abc::server:def\n")
            .respond("k3s.yaml", K3S_YAML);
        shell
    }

    fn k3s(shell: &FakeShell, factory: &FakeClientFactory) -> K3sOrchestrator {
        K3sOrchestrator::new(Arc::new(shell.clone()), Arc::new(factory.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_two_node_cluster() {
        let shell = k3s_cluster();
        let factory = FakeClientFactory::default();
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = with_addons(demo());
        cfg.kubeconfig_path = Some(dir.path().join("demo.kubeconfig"));

        let state = k3s(&shell, &factory).create(&cfg).await.unwrap();

        assert_eq!(state.token.len(), 64);
        assert_eq!(state.node_token, "K10abc::server:def");
        assert_eq!(state.api_endpoint, "https://10.0.0.10:6443");
        assert_eq!(state.status, ClusterStatus::Ready);
        assert_eq!(state.nodes, ["turing-1", "turing-2"]);
        assert!(state.kubeconfig.contains("https://10.0.0.10:6443"));
        assert!(!state.kubeconfig.contains("127.0.0.1"));

        // The control plane installs with the generated token, the agent
        // joins with the server's node token.
        let server_install = shell
            .commands_on("10.0.0.10")
            .into_iter()
            .find(|c| c.contains("get.k3s.io"))
            .unwrap();
        assert!(server_install.contains(&state.token));
        let agent_install = shell
            .commands_on("10.0.0.11")
            .into_iter()
            .find(|c| c.contains("get.k3s.io"))
            .unwrap();
        assert!(agent_install.contains("K3S_TOKEN='K10abc::server:def'"));

        assert_eq!(factory.charts.installed(), ["metallb", "ingress-nginx"]);
        let ingress = factory.charts.installs.lock().unwrap()[1].clone();
        assert!(ingress.values_yaml.contains("10.0.0.80"));
        assert!(factory.kube.applied.lock().unwrap()[0].contains("IPAddressPool"));
        assert_eq!(*factory.kubeconfigs.lock().unwrap(), [state.kubeconfig.clone()]);

        let written = std::fs::read_to_string(dir.path().join("demo.kubeconfig")).unwrap();
        assert_eq!(written, state.kubeconfig);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_keeps_supplied_token() {
        let shell = k3s_cluster();
        let factory = FakeClientFactory::default();
        let mut cfg = demo();
        cfg.token = Some("operator-token".into());

        let state = k3s(&shell, &factory).create(&cfg).await.unwrap();
        assert_eq!(state.token, "operator-token");
        assert!(factory.charts.installed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_failure_stops_before_addons() {
        let shell = k3s_cluster();
        shell.fail_on("10.0.0.11", "get.k3s.io", "curl: (7) Failed to connect");
        let factory = FakeClientFactory::default();

        let err = k3s(&shell, &factory)
            .create(&with_addons(demo()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Command { .. }), "{err}");
        assert!(factory.charts.installed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_worker_leaves_cluster_degraded() {
        let shell = k3s_cluster();
        shell.respond("get nodes", SECOND_NOT_READY);
        let factory = FakeClientFactory::default();
        let mut cfg = with_addons(demo().with_worker(node("10.0.0.12")));
        cfg.settings.node_ready_timeout_secs = 30;

        let state = k3s(&shell, &factory).create(&cfg).await.unwrap();

        assert_eq!(state.status, ClusterStatus::Degraded);
        assert_eq!(state.nodes, ["turing-1", "turing-2", "turing-3"]);
        assert_eq!(shell.count("10.0.0.12", "get.k3s.io"), 1);
        assert_eq!(factory.charts.installed(), ["metallb", "ingress-nginx"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_create_keeps_generated_token() {
        let shell = k3s_cluster();
        shell.fail_on("10.0.0.11", "get.k3s.io", "curl: (7) Failed to connect");
        let factory = FakeClientFactory::default();
        let checkpoint = RecordingCheckpoint::default();
        let orchestrator = k3s(&shell, &factory).with_checkpoint(Arc::new(checkpoint.clone()));

        orchestrator.create(&demo()).await.unwrap_err();

        let saved: Vec<ClusterState> = checkpoint
            .saved
            .lock()
            .unwrap()
            .iter()
            .map(|s| match s {
                ComputedState::K3s(state) => state.clone(),
                ComputedState::Talos(_) => panic!("unexpected Talos checkpoint"),
            })
            .collect();
        assert_eq!(saved.len(), 2);
        assert!(saved.iter().all(|s| s.status == ClusterStatus::Bootstrapping));
        assert_eq!(saved[0].token, saved[1].token);
        assert!(saved[0].kubeconfig.is_empty());
        assert_eq!(saved[1].node_token, "K10abc::server:def");
        assert!(saved[1].kubeconfig.contains("https://10.0.0.10:6443"));

        let server_install = shell
            .commands_on("10.0.0.10")
            .into_iter()
            .find(|c| c.contains("get.k3s.io"))
            .unwrap();
        assert!(server_install.contains(&format!("K3S_TOKEN='{}'", saved[0].token)));

        // Resuming with the saved token keeps the cluster identity.
        shell.respond("get.k3s.io", "");
        let mut resumed = demo();
        resumed.token = Some(saved[0].token.clone());
        let state = k3s(&shell, &factory).create(&resumed).await.unwrap();
        assert_eq!(state.token, saved[0].token);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_definition_touches_nothing() {
        let shell = k3s_cluster();
        let factory = FakeClientFactory::default();
        let mut cfg = demo();
        cfg.workers.push(node("10.0.0.10"));

        let err = k3s(&shell, &factory).create(&cfg).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(shell.connections("10.0.0.10"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_detects_removed_cluster() {
        let shell = k3s_cluster();
        let factory = FakeClientFactory::default();
        let orchestrator = k3s(&shell, &factory);
        let state = orchestrator.create(&demo()).await.unwrap();

        shell.respond("[ -e", "yes\n");
        let refreshed = orchestrator.read(&demo(), &state).await.unwrap().unwrap();
        assert_eq!(refreshed.status, ClusterStatus::Ready);
        assert_eq!(refreshed, state);

        let gone = FakeShell::new();
        gone.respond("[ -e", "no\n");
        assert!(k3s(&gone, &factory).read(&demo(), &state).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_reports_degraded_node() {
        let shell = k3s_cluster();
        let factory = FakeClientFactory::default();
        let orchestrator = k3s(&shell, &factory);
        let state = orchestrator.create(&demo()).await.unwrap();

        shell.respond("[ -e", "yes\n").respond(
            "get nodes",
            &BOTH_READY.replace("turing-2   Ready", "turing-2   NotReady"),
        );
        let refreshed = orchestrator.read(&demo(), &state).await.unwrap().unwrap();
        assert_eq!(refreshed.status, ClusterStatus::Degraded);
        assert_eq!(refreshed.token, state.token);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_rejects_node_changes_and_applies_addons() {
        let shell = k3s_cluster();
        let factory = FakeClientFactory::default();
        let orchestrator = k3s(&shell, &factory);
        let cfg = demo();
        let state = orchestrator.create(&cfg).await.unwrap();

        let mut moved = cfg.clone();
        moved.workers = vec![node("10.0.0.12")];
        let err = orchestrator.update(&moved, &cfg, &state).await.unwrap_err();
        assert!(matches!(err, Error::RequiresReplacement { ref field } if field == "workers"));

        shell.respond("[ -e", "yes\n");
        let updated = orchestrator
            .update(&with_addons(cfg.clone()), &cfg, &state)
            .await
            .unwrap();
        assert_eq!(updated.token, state.token);
        assert_eq!(factory.charts.installed(), ["metallb", "ingress-nginx"]);
    }

    #[tokio::test]
    async fn test_delete_uninstalls_workers_first_and_tolerates_worker_failure() {
        let shell = FakeShell::new();
        shell.respond("[ -e", "yes\n");
        shell.fail_on("10.0.0.11", "k3s-agent-uninstall.sh", "exit status 1");
        let factory = FakeClientFactory::default();

        k3s(&shell, &factory).delete(&demo()).await.unwrap();

        let order = shell.hosts_running("uninstall.sh");
        assert_eq!(order.first().map(String::as_str), Some("10.0.0.11"));
        assert_eq!(order.last().map(String::as_str), Some("10.0.0.10"));
        assert_eq!(shell.count("10.0.0.10", "/usr/local/bin/k3s-uninstall.sh"), 2);
    }

    #[tokio::test]
    async fn test_delete_propagates_control_plane_failure() {
        let shell = FakeShell::new();
        shell.respond("[ -e", "yes\n");
        shell.fail_on("10.0.0.10", "k3s-uninstall.sh", "exit status 1");
        let factory = FakeClientFactory::default();

        assert!(k3s(&shell, &factory).delete(&demo()).await.is_err());
        assert_eq!(shell.count("10.0.0.11", "k3s-agent-uninstall.sh"), 2);
    }

    fn lab() -> TalosClusterConfig {
        let mut cfg = TalosClusterConfig::new("lab", vec![TalosNodeConfig::new("10.0.0.20")])
            .with_worker(TalosNodeConfig::new("10.0.0.21"));
        cfg.settings.poll_interval_secs = 1;
        cfg
    }

    fn talos_cluster() -> FakeTalosctl {
        let fake = FakeTalosctl::new();
        fake.respond("service etcd", "ID etcd\nSTATE Running\n")
            .respond("service kubelet", "ID kubelet\nSTATE Running\n");
        fake
    }

    fn talos(fake: &FakeTalosctl, factory: &FakeClientFactory) -> TalosOrchestrator {
        TalosOrchestrator::new(Arc::new(fake.clone()), Arc::new(factory.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_talos_create_writes_private_artifacts() {
        let fake = talos_cluster();
        let factory = FakeClientFactory::default();
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = lab();
        cfg.kubeconfig_path = Some(dir.path().join("kubeconfig"));
        cfg.talosconfig_path = Some(dir.path().join("talosconfig"));
        cfg.secrets_path = Some(dir.path().join("secrets.yaml"));

        let state = talos(&fake, &factory).create(&cfg, None).await.unwrap();
        assert_eq!(state.status, ClusterStatus::Ready);

        for (name, content) in [
            ("kubeconfig", &state.kubeconfig),
            ("talosconfig", &state.talos_config),
            ("secrets.yaml", &state.secrets_yaml),
        ] {
            let path = dir.path().join(name);
            assert_eq!(&std::fs::read_to_string(&path).unwrap(), content);
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
                assert_eq!(mode, 0o600, "{name}");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_talos_failed_create_checkpoints_secrets() {
        let fake = talos_cluster();
        fake.fail("apply-config --insecure --nodes 10.0.0.21", "connection refused");
        let factory = FakeClientFactory::default();
        let checkpoint = RecordingCheckpoint::default();

        talos(&fake, &factory)
            .with_checkpoint(Arc::new(checkpoint.clone()))
            .create(&lab(), None)
            .await
            .unwrap_err();

        let Some(ComputedState::Talos(saved)) = checkpoint.last() else {
            panic!("no Talos checkpoint");
        };
        assert_eq!(saved.status, ClusterStatus::Bootstrapping);
        assert!(saved.secrets_yaml.contains("fake-cluster-id"));
        assert!(factory.charts.installed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_talos_read_update_delete() {
        let fake = talos_cluster();
        let factory = FakeClientFactory::default();
        let orchestrator = talos(&fake, &factory);
        let cfg = lab();
        let state = orchestrator.create(&cfg, None).await.unwrap();

        fake.fail("health", "timeout waiting for nodes");
        let read = orchestrator.read(&cfg, &state).await.unwrap().unwrap();
        assert_eq!(read.status, ClusterStatus::Degraded);
        assert_eq!(read.kubeconfig, state.kubeconfig);

        let mut disk = cfg.clone();
        disk.install_disk = "/dev/nvme0n1".into();
        let err = orchestrator.update(&disk, &cfg, &state).await.unwrap_err();
        assert!(matches!(err, Error::RequiresReplacement { .. }));

        orchestrator.delete(&cfg, &state).await.unwrap();
        let resets: Vec<String> = fake
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("reset"))
            .collect();
        assert_eq!(resets.len(), 2);
        assert!(resets[0].contains("10.0.0.21"));
    }
}
