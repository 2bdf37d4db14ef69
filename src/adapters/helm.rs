//! Kubernetes platform adapter (Helm for releases, kubectl for observation).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use super::process;
use super::{Convergence, Platform, RolloutProbe};
use crate::domain::{DeploymentTarget, Instance};

/// Label Helm charts conventionally put on every pod of a release
const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

/// Platform adapter using the `helm` and `kubectl` CLIs
pub struct HelmPlatform {
    repo_root: PathBuf,
    kubeconfig: Option<PathBuf>,
}

impl HelmPlatform {
    pub fn new(repo_root: &Path, kubeconfig: Option<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            kubeconfig,
        }
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.current_dir(&self.repo_root);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.env("KUBECONFIG", kubeconfig);
        }
        cmd
    }
}

fn is_helm_timeout(stderr: &str) -> bool {
    stderr.contains("timed out waiting for the condition") || stderr.contains("context deadline exceeded")
}

/// Interpret `kubectl rollout status --watch=false` output
pub fn parse_rollout_status(stdout: &str) -> RolloutProbe {
    let line = stdout.trim();
    if line.contains("successfully rolled out") {
        RolloutProbe::Complete
    } else if line.starts_with("Waiting for") {
        RolloutProbe::Progressing(line.to_string())
    } else {
        RolloutProbe::Pending
    }
}

/// Extract instances from `kubectl get pods -o json`
pub fn parse_pods(json: &str) -> Result<Vec<Instance>> {
    let root: Value = serde_json::from_str(json).context("kubectl returned invalid JSON")?;
    let items = root
        .get("items")
        .and_then(Value::as_array)
        .context("kubectl output has no 'items' array")?;

    let instances = items
        .iter()
        .map(|pod| {
            let name = pod
                .pointer("/metadata/name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let phase = pod
                .pointer("/status/phase")
                .and_then(Value::as_str)
                .unwrap_or("Unknown")
                .to_string();
            let ready = pod
                .pointer("/status/containerStatuses")
                .and_then(Value::as_array)
                .map(|statuses| {
                    !statuses.is_empty()
                        && statuses
                            .iter()
                            .all(|s| s.get("ready").and_then(Value::as_bool).unwrap_or(false))
                })
                .unwrap_or(false);

            Instance { name, phase, ready }
        })
        .collect();

    Ok(instances)
}

#[async_trait]
impl Platform for HelmPlatform {
    async fn upgrade(
        &self,
        target: &DeploymentTarget,
        image_repository: &str,
        image_tag: &str,
        timeout: Duration,
    ) -> Result<Convergence> {
        let mut cmd = self.command("helm");
        cmd.args(["upgrade", "--install", target.release_name.as_str()])
            .arg(&target.chart)
            .args(["--namespace", target.namespace.as_str()])
            .arg("--set")
            .arg(format!("image.repository={}", image_repository))
            .arg("--set")
            .arg(format!("image.tag={}", image_tag))
            .arg("--wait")
            .arg("--timeout")
            .arg(format!("{}s", timeout.as_secs().max(1)));

        let what = format!("helm upgrade {}", target.release_name);
        let output = process::capture(&mut cmd, None, &what).await?;

        if output.success() {
            return Ok(Convergence::Converged);
        }
        if is_helm_timeout(&output.stderr) {
            return Ok(Convergence::TimedOut);
        }

        anyhow::bail!(
            "{} failed with exit code {}: {}",
            what,
            output.code,
            process::failure_message(&output)
        )
    }

    async fn rollout_status(&self, target: &DeploymentTarget) -> Result<RolloutProbe> {
        let resource = format!("deployment/{}", target.release_name);
        let mut cmd = self.command("kubectl");
        cmd.args([
            "rollout",
            "status",
            resource.as_str(),
            "--namespace",
            target.namespace.as_str(),
            "--watch=false",
        ]);

        let output = process::capture(&mut cmd, None, "kubectl rollout status").await?;
        if output.success() {
            return Ok(parse_rollout_status(&output.stdout));
        }

        let message = process::failure_message(&output);
        if message.contains("exceeded its progress deadline") {
            return Ok(RolloutProbe::Failed(message));
        }

        anyhow::bail!("kubectl rollout status for {} failed: {}", resource, message)
    }

    async fn list_instances(&self, target: &DeploymentTarget) -> Result<Vec<Instance>> {
        let selector = format!("{}={}", INSTANCE_LABEL, target.release_name);
        let mut cmd = self.command("kubectl");
        cmd.args([
            "get",
            "pods",
            "--namespace",
            target.namespace.as_str(),
            "--selector",
            selector.as_str(),
            "--output",
            "json",
        ]);

        let stdout = process::run(&mut cmd, None, "kubectl get pods").await?;
        parse_pods(&stdout)
    }
}
