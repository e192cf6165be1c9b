//! `kubectl` CLI cluster API client.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{combined_output, KubeApi};
use crate::error::{Error, Result};

/// Production [`KubeApi`] shelling out to `kubectl`.
#[derive(Debug, Clone)]
pub struct Kubectl {
    kubeconfig: PathBuf,
}

impl Kubectl {
    /// Talk to the cluster in `kubeconfig`.
    #[must_use]
    pub fn new(kubeconfig: PathBuf) -> Self {
        Self { kubeconfig }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("kubectl");
        cmd.arg("--kubeconfig").arg(&self.kubeconfig).kill_on_drop(true);
        cmd
    }

    /// Run kubectl with `yaml` fed through stdin.
    async fn with_stdin(&self, step: &str, args: &[&str], yaml: &str) -> Result<String> {
        debug!(?args, "Running kubectl with manifest on stdin");
        let mut child = self
            .command()
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::command(step, format!("failed to spawn kubectl: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(yaml.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let text = combined_output(&output.stdout, &output.stderr);
            return Err(Error::command(step, text.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl KubeApi for Kubectl {
    async fn apply(&self, manifest_yaml: &str) -> Result<()> {
        self.with_stdin("kubectl apply", &["apply", "-f", "-"], manifest_yaml)
            .await
            .map(|_| ())
    }

    async fn delete(&self, manifest_yaml: &str) -> Result<()> {
        self.with_stdin(
            "kubectl delete",
            &["delete", "--ignore-not-found", "-f", "-"],
            manifest_yaml,
        )
        .await
        .map(|_| ())
    }

    async fn get(&self, kind: &str, name: &str, namespace: &str) -> Result<String> {
        let mut cmd = self.command();
        cmd.args(["get", kind, name, "-o", "json"]);
        if !namespace.is_empty() {
            cmd.args(["--namespace", namespace]);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| Error::command("kubectl get", format!("failed to execute kubectl: {e}")))?;
        if !output.status.success() {
            let text = combined_output(&output.stdout, &output.stderr);
            return Err(Error::command(format!("kubectl get {kind}/{name}"), text.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
