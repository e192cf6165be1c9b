//! `helm` CLI chart installer.

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use super::{combined_output, ChartInstaller, Release, ReleaseSpec, ReleaseStatus};
use crate::error::{Error, Result};

/// Production [`ChartInstaller`] shelling out to `helm`.
#[derive(Debug, Clone)]
pub struct HelmCli {
    kubeconfig: PathBuf,
}

impl HelmCli {
    /// Run helm against the cluster in `kubeconfig`.
    #[must_use]
    pub fn new(kubeconfig: PathBuf) -> Self {
        Self { kubeconfig }
    }

    async fn helm(&self, args: &[String]) -> Result<String> {
        let step = format!("helm {}", args.first().map_or("", String::as_str));
        debug!(?args, "Running helm");

        let output = Command::new("helm")
            .env("KUBECONFIG", &self.kubeconfig)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::command(&step, format!("failed to execute helm: {e}")))?;

        if !output.status.success() {
            let text = combined_output(&output.stdout, &output.stderr);
            return Err(Error::command(step, text.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[derive(Deserialize)]
struct HelmRelease {
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    version: u32,
    info: HelmReleaseInfo,
}

#[derive(Deserialize)]
struct HelmReleaseInfo {
    status: ReleaseStatus,
}

fn parse_release(json: &str) -> Result<Release> {
    let raw: HelmRelease = serde_json::from_str(json.trim())?;
    Ok(Release {
        name: raw.name,
        namespace: raw.namespace,
        status: raw.info.status,
        revision: raw.version,
    })
}

fn install_args(spec: &ReleaseSpec, values_path: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "upgrade".into(),
        "--install".into(),
        spec.release_name.clone(),
        spec.chart.clone(),
        "--namespace".into(),
        spec.namespace.clone(),
        "--values".into(),
        values_path.into(),
        "--timeout".into(),
        format!("{}s", spec.timeout.as_secs().max(1)),
        "--output".into(),
        "json".into(),
    ];
    if let Some(version) = &spec.version {
        args.extend(["--version".into(), version.clone()]);
    }
    if spec.create_namespace {
        args.push("--create-namespace".into());
    }
    if spec.wait {
        args.push("--wait".into());
    }
    if spec.atomic {
        args.push("--atomic".into());
    }
    args
}

#[async_trait]
impl ChartInstaller for HelmCli {
    async fn add_repository(&self, name: &str, url: &str) -> Result<()> {
        self.helm(&[
            "repo".into(),
            "add".into(),
            name.into(),
            url.into(),
            "--force-update".into(),
        ])
        .await?;
        self.helm(&["repo".into(), "update".into(), name.into()])
            .await?;
        Ok(())
    }

    async fn install_or_upgrade(&self, spec: &ReleaseSpec) -> Result<Release> {
        let mut values = tempfile::Builder::new()
            .prefix("metal-cluster-values-")
            .suffix(".yaml")
            .tempfile()?;
        values.write_all(spec.values_yaml.as_bytes())?;
        let values_path = values.path().to_string_lossy().into_owned();

        info!(
            release = %spec.release_name,
            chart = %spec.chart,
            namespace = %spec.namespace,
            "Installing chart"
        );
        let output = self.helm(&install_args(spec, &values_path)).await?;
        parse_release(&output)
    }

    async fn get_release(&self, name: &str, namespace: &str) -> Result<Release> {
        let output = self
            .helm(&[
                "status".into(),
                name.into(),
                "--namespace".into(),
                namespace.into(),
                "--output".into(),
                "json".into(),
            ])
            .await?;
        parse_release(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_release() {
        let json = r#"{"name":"metallb","namespace":"metallb-system","version":2,
            "info":{"status":"deployed","description":"Upgrade complete"}}"#;
        let release = parse_release(json).unwrap();
        assert_eq!(release.name, "metallb");
        assert_eq!(release.status, ReleaseStatus::Deployed);
        assert_eq!(release.revision, 2);
    }

    #[test]
    fn test_install_args() {
        let spec = ReleaseSpec {
            release_name: "ingress-nginx".into(),
            chart: "ingress-nginx/ingress-nginx".into(),
            version: Some("4.11.3".into()),
            namespace: "ingress-nginx".into(),
            values_yaml: String::new(),
            create_namespace: true,
            wait: true,
            timeout: Duration::from_secs(300),
            atomic: false,
        };
        let args = install_args(&spec, "/tmp/values.yaml");
        assert_eq!(
            &args[..4],
            ["upgrade", "--install", "ingress-nginx", "ingress-nginx/ingress-nginx"]
        );
        assert!(args.windows(2).any(|w| w == ["--version", "4.11.3"]));
        assert!(args.windows(2).any(|w| w == ["--timeout", "300s"]));
        assert!(args.contains(&"--create-namespace".to_string()));
        assert!(args.contains(&"--wait".to_string()));
        assert!(!args.contains(&"--atomic".to_string()));
    }
}
