//! Git revision source.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use super::process;
use super::RevisionSource;

/// Revision source backed by the `git` CLI
pub struct GitRevisionSource {
    repo_root: PathBuf,
    binary_path: String,
}

impl GitRevisionSource {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            binary_path: "git".to_string(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary_path);
        cmd.current_dir(&self.repo_root);
        cmd
    }
}

#[async_trait]
impl RevisionSource for GitRevisionSource {
    async fn resolve(&self, revision: &str) -> Result<String> {
        let spec = format!("{}^{{commit}}", revision);
        let stdout = process::run(
            self.command().args(["rev-parse", "--verify", "--quiet", spec.as_str()]),
            None,
            "git rev-parse",
        )
        .await
        .with_context(|| format!("Revision '{}' cannot be resolved", revision))?;

        let sha = stdout.trim();
        if sha.is_empty() {
            anyhow::bail!("Revision '{}' resolved to nothing", revision);
        }
        Ok(sha.to_string())
    }

    async fn changed_paths(&self, previous: &str, current: &str) -> Result<Vec<String>> {
        let stdout = process::run(
            self.command()
                .args(["diff", "-z", "--name-only", "--no-renames", previous, current]),
            None,
            "git diff",
        )
        .await
        .with_context(|| format!("Failed to diff {}..{}", previous, current))?;

        Ok(parse_name_only(&stdout))
    }
}

/// Split `-z` output; paths are NUL-terminated and never quoted
fn parse_name_only(stdout: &str) -> Vec<String> {
    stdout
        .split('\0')
        .filter(|path| !path.is_empty())
        .map(str::to_string)
        .collect()
}
