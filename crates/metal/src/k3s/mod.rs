//! k3s provisioning over SSH.
//!
//! Every step opens its own session, runs idempotent shell commands and
//! closes the session again. Installs are skipped when k3s is already on
//! the node, so re-running a create converges instead of reinstalling.

mod kubeconfig;
mod nodes;

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ClusterConfig, NodeConfig};
use crate::error::{Error, Result};
use crate::exec::{RemoteSession, RemoteShell};
use crate::wait::{wait_until, WaitOptions, DEFAULT_POLL_INTERVAL};

pub use kubeconfig::rewrite_server_address;
pub use nodes::{derive_status, parse_node_list, NodeInfo};

/// k3s binary installed by the upstream script.
pub const K3S_BINARY: &str = "/usr/local/bin/k3s";

/// Configuration directory.
pub const K3S_CONFIG_DIR: &str = "/etc/rancher/k3s";

/// Admin kubeconfig written by the server.
pub const K3S_KUBECONFIG: &str = "/etc/rancher/k3s/k3s.yaml";

/// Join token written by the server.
pub const NODE_TOKEN_PATH: &str = "/var/lib/rancher/k3s/server/node-token";

/// Server uninstall script.
pub const SERVER_UNINSTALL: &str = "/usr/local/bin/k3s-uninstall.sh";

/// Agent uninstall script.
pub const AGENT_UNINSTALL: &str = "/usr/local/bin/k3s-agent-uninstall.sh";

/// Agent systemd unit written by the install script.
const AGENT_SERVICE: &str = "/etc/systemd/system/k3s-agent.service";

/// Upstream install script.
pub const INSTALL_SCRIPT_URL: &str = "https://get.k3s.io";

const NODE_LIST: &str = "k3s kubectl get nodes -o wide --no-headers";

/// Generate a cluster join token: 32 random bytes, hex encoded.
#[must_use]
pub fn generate_cluster_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Single-quote a value for `sh`.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// `[ -e path ]` as a command whose output is `yes` or `no`.
fn exists_check(paths: &[&str]) -> String {
    let tests: Vec<String> = paths.iter().map(|p| format!("[ -e {p} ]")).collect();
    format!("if {}; then echo yes; else echo no; fi", tests.join(" && "))
}

async fn paths_exist(session: &dyn RemoteSession, paths: &[&str]) -> Result<bool> {
    let out = session.run(&exists_check(paths)).await?;
    Ok(out.trim() == "yes")
}

fn install_command(env: &[(&str, &str)], role: &str, args: &[(&str, &str)]) -> String {
    let env: Vec<String> = env
        .iter()
        .map(|(k, v)| format!("{k}={}", quote(v)))
        .collect();
    let args: Vec<String> = args
        .iter()
        .map(|(flag, v)| format!("{flag} {}", quote(v)))
        .collect();
    format!(
        "curl -sfL {INSTALL_SCRIPT_URL} | {} sh -s - {role} {}",
        env.join(" "),
        args.join(" ")
    )
    .trim_end()
    .to_string()
}

/// Drives k3s installation and teardown on nodes over a [`RemoteShell`].
#[derive(Clone)]
pub struct K3sProvisioner {
    shell: Arc<dyn RemoteShell>,
    interval: Duration,
    cancel: CancellationToken,
}

impl K3sProvisioner {
    /// Create a provisioner using `shell` for remote access.
    #[must_use]
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            shell,
            interval: DEFAULT_POLL_INTERVAL,
            cancel: CancellationToken::new(),
        }
    }

    /// Override the polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Stop waiting when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn wait_options(&self, timeout: Duration) -> WaitOptions {
        WaitOptions::new(timeout).with_interval(self.interval)
    }

    /// Run one command in its own session.
    async fn run(&self, node: &NodeConfig, command: &str) -> Result<String> {
        let session = self.shell.connect(node).await?;
        let out = session.run(command).await;
        session.close().await;
        out
    }

    /// Wait until `node` accepts SSH sessions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] carrying the last connection error.
    pub async fn wait_for_ssh(&self, node: &NodeConfig, timeout: Duration) -> Result<()> {
        info!(
            "Waiting for SSH on {} (timeout: {}s)...",
            node.ssh_address(),
            timeout.as_secs()
        );
        let what = format!("SSH on {}", node.ssh_address());
        wait_until(&what, self.wait_options(timeout), &self.cancel, move || async move {
            self.run(node, "true").await.map(|_| true)
        })
        .await
    }

    /// Install the k3s server on `node` and wait for it to report Ready.
    ///
    /// The token comes from `cluster` and must already be resolved.
    ///
    /// # Errors
    ///
    /// Remote command failures are returned as-is; only the readiness poll
    /// produces [`Error::Timeout`].
    pub async fn install_control_plane(
        &self,
        node: &NodeConfig,
        cluster: &ClusterConfig,
        timeout: Duration,
    ) -> Result<()> {
        let token = cluster
            .supplied_token()
            .ok_or_else(|| Error::validation("cluster token must be resolved before install"))?;

        let session = self.shell.connect(node).await?;
        let result = self
            .install_server(session.as_ref(), node, cluster, token)
            .await;
        let node_name = match result {
            Ok(name) => name,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        let what = format!("control plane {node_name} Ready");
        let (remote, name) = (session.as_ref(), node_name.as_str());
        let options = self.wait_options(timeout);
        let ready = wait_until(&what, options, &self.cancel, move || async move {
            let listing = remote.run(NODE_LIST).await?;
            Ok(parse_node_list(&listing)
                .iter()
                .any(|n| n.ready && (n.name == name || n.matches(node))))
        })
        .await;
        session.close().await;
        ready?;

        info!("✅ k3s control plane {} is Ready", node.host);
        Ok(())
    }

    async fn install_server(
        &self,
        session: &dyn RemoteSession,
        node: &NodeConfig,
        cluster: &ClusterConfig,
        token: &str,
    ) -> Result<String> {
        session.run("swapoff -a").await?;
        session.run(&format!("mkdir -p {K3S_CONFIG_DIR}")).await?;

        if paths_exist(session, &[K3S_BINARY]).await? {
            info!("k3s already present on {}, skipping install", node.host);
        } else {
            info!("Installing k3s server on {}...", node.host);
            let mut env = vec![("K3S_TOKEN", token)];
            if let Some(version) = &cluster.version {
                env.push(("INSTALL_K3S_VERSION", version.as_str()));
            }
            let mut args = vec![
                ("--cluster-cidr", cluster.pod_cidr.as_str()),
                ("--service-cidr", cluster.service_cidr.as_str()),
                ("--tls-san", node.host.as_str()),
                ("--write-kubeconfig-mode", "0600"),
            ];
            if let Some(hostname) = &node.hostname {
                args.push(("--node-name", hostname.as_str()));
            }
            session.run(&install_command(&env, "server", &args)).await?;
        }

        match &node.hostname {
            Some(hostname) => Ok(hostname.clone()),
            None => Ok(session.run("hostname").await?.trim().to_string()),
        }
    }

    /// Read the join token agents use to register.
    ///
    /// # Errors
    ///
    /// Fails if the token file does not exist yet.
    pub async fn get_node_token(&self, node: &NodeConfig) -> Result<String> {
        let out = self
            .run(node, &format!("cat {NODE_TOKEN_PATH}"))
            .await?;
        let token = out.trim_end().to_string();
        if token.is_empty() {
            return Err(Error::command("read node token", format!("{NODE_TOKEN_PATH} is empty")));
        }
        Ok(token)
    }

    /// Read the admin kubeconfig, pointed at the node's real address.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or is not a kubeconfig.
    pub async fn get_kubeconfig(&self, node: &NodeConfig) -> Result<String> {
        let raw = self
            .run(node, &format!("cat {K3S_KUBECONFIG}"))
            .await?;
        rewrite_server_address(&raw, &node.host)
    }

    /// Install the k3s agent on `node` and join it to `server_url`.
    ///
    /// Waits up to `timeout` for SSH first; node readiness is checked
    /// separately with [`wait_for_node_ready`](Self::wait_for_node_ready).
    ///
    /// # Errors
    ///
    /// Returns the first failing remote command.
    pub async fn install_agent(
        &self,
        node: &NodeConfig,
        server_url: &str,
        token: &str,
        version: Option<&str>,
        timeout: Duration,
    ) -> Result<()> {
        self.wait_for_ssh(node, timeout).await?;

        let session = self.shell.connect(node).await?;
        let result = async {
            session.run("swapoff -a").await?;
            if paths_exist(session.as_ref(), &[K3S_BINARY, AGENT_SERVICE]).await? {
                info!("k3s agent already present on {}, skipping install", node.host);
                return Ok(());
            }

            info!("Installing k3s agent on {} (server {server_url})...", node.host);
            let mut env = vec![("K3S_URL", server_url), ("K3S_TOKEN", token)];
            if let Some(version) = version {
                env.push(("INSTALL_K3S_VERSION", version));
            }
            let mut args = Vec::new();
            if let Some(hostname) = &node.hostname {
                args.push(("--node-name", hostname.as_str()));
            }
            session.run(&install_command(&env, "agent", &args)).await?;
            Ok::<_, Error>(())
        }
        .await;
        session.close().await;
        result?;

        info!("✅ k3s agent installed on {}", node.host);
        Ok(())
    }

    /// Poll the control plane's node list until `worker` reports Ready.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] or [`Error::Cancelled`].
    pub async fn wait_for_node_ready(
        &self,
        control_plane: &NodeConfig,
        worker: &NodeConfig,
        timeout: Duration,
    ) -> Result<()> {
        let label = worker.hostname.as_deref().unwrap_or(&worker.host);
        info!("Waiting for node {label} to be Ready (timeout: {}s)...", timeout.as_secs());

        let what = format!("node {label} Ready");
        wait_until(&what, self.wait_options(timeout), &self.cancel, move || async move {
            let nodes = self.get_cluster_nodes(control_plane).await?;
            Ok(nodes.iter().any(|n| n.ready && n.matches(worker)))
        })
        .await?;

        info!("✅ Node {label} is Ready");
        Ok(())
    }

    /// Whether the k3s binary is present on `node`.
    ///
    /// # Errors
    ///
    /// Fails if the node cannot be reached.
    pub async fn check_installed(&self, node: &NodeConfig) -> Result<bool> {
        let session = self.shell.connect(node).await?;
        let present = paths_exist(session.as_ref(), &[K3S_BINARY]).await;
        session.close().await;
        present
    }

    /// Nodes as reported by the control plane.
    ///
    /// # Errors
    ///
    /// Fails if the node cannot be reached or kubectl fails.
    pub async fn get_cluster_nodes(&self, node: &NodeConfig) -> Result<Vec<NodeInfo>> {
        let listing = self.run(node, NODE_LIST).await?;
        Ok(parse_node_list(&listing))
    }

    /// Installed k3s version banner.
    ///
    /// # Errors
    ///
    /// Fails if k3s is not installed.
    pub async fn get_version(&self, node: &NodeConfig) -> Result<String> {
        let out = self.run(node, &format!("{K3S_BINARY} --version")).await?;
        Ok(out.trim().to_string())
    }

    /// Remove the k3s server. A missing uninstall script means it is gone.
    ///
    /// # Errors
    ///
    /// Fails if the node is unreachable or the script fails.
    pub async fn uninstall_control_plane(&self, node: &NodeConfig) -> Result<()> {
        self.uninstall(node, SERVER_UNINSTALL).await
    }

    /// Remove the k3s agent. A missing uninstall script means it is gone.
    ///
    /// # Errors
    ///
    /// Fails if the node is unreachable or the script fails.
    pub async fn uninstall_agent(&self, node: &NodeConfig) -> Result<()> {
        self.uninstall(node, AGENT_UNINSTALL).await
    }

    async fn uninstall(&self, node: &NodeConfig, script: &str) -> Result<()> {
        let session = self.shell.connect(node).await?;
        let result = async {
            if !paths_exist(session.as_ref(), &[script]).await? {
                debug!(host = %node.host, script, "Uninstall script absent, nothing to remove");
                return Ok(false);
            }
            info!("Running {script} on {}...", node.host);
            session.run(script).await?;
            Ok::<_, Error>(true)
        }
        .await;
        session.close().await;

        if result? {
            info!("✅ k3s removed from {}", node.host);
        }
        Ok(())
    }
}
