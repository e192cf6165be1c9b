//! `talosctl` subprocess wrapper.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{combined_output, TalosCli};
use crate::error::{Error, Result};

/// Production [`TalosCli`] running the `talosctl` binary.
#[derive(Debug, Clone)]
pub struct Talosctl {
    binary: PathBuf,
}

impl Talosctl {
    /// Run `binary`, either a path or a name looked up on `PATH`.
    #[must_use]
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Check that the binary runs.
    ///
    /// # Errors
    ///
    /// Returns an error if talosctl is not installed or not working.
    pub async fn check(&self) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(["version", "--client"])
            .output()
            .await
            .map_err(|e| {
                Error::command(
                    "talosctl version",
                    format!("failed to run {} - is it installed? ({e})", self.binary.display()),
                )
            })?;

        let text = combined_output(&output.stdout, &output.stderr);
        if !output.status.success() {
            return Err(Error::command("talosctl version", text.trim()));
        }
        Ok(text)
    }
}

#[async_trait]
impl TalosCli for Talosctl {
    async fn run(&self, workdir: &Path, args: &[String]) -> Result<String> {
        let step = format!("talosctl {}", args.first().map_or("", String::as_str));
        debug!(workdir = %workdir.display(), ?args, "Running talosctl");

        let output = Command::new(&self.binary)
            .args(args)
            .current_dir(workdir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::command(&step, format!("failed to execute: {e}")))?;

        let text = combined_output(&output.stdout, &output.stderr);
        if output.status.success() {
            Ok(text)
        } else {
            Err(Error::command(step, text.trim()))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_uses_workdir_and_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "x").unwrap();

        // `sh` stands in for talosctl: same argv/exit-code contract.
        let cli = Talosctl::with_binary("sh");
        let out = cli
            .run(dir.path(), &["-c".into(), "ls".into()])
            .await
            .unwrap();
        assert!(out.contains("marker"));

        let err = cli
            .run(dir.path(), &["-c".into(), "echo nope >&2; exit 3".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn test_check_returns_version_output() {
        // `echo` prints its arguments and exits 0.
        let out = Talosctl::with_binary("echo").check().await.unwrap();
        assert_eq!(out.trim(), "version --client");
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let err = Talosctl::with_binary("/nonexistent/talosctl")
            .check()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("is it installed"));
    }
}
