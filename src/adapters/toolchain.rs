//! Command-driven toolchain for the install and test stages.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use glob::Pattern;
use tokio::process::Command;

use super::process;
use super::Toolchain;
use crate::core::pipeline::ToolchainSpec;
use crate::domain::{ServiceDescriptor, StageOutcome};

/// Runs the configured install/test commands inside each service directory
pub struct CommandToolchain {
    repo_root: PathBuf,
    spec: ToolchainSpec,
}

impl CommandToolchain {
    pub fn new(repo_root: &Path, spec: ToolchainSpec) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            spec,
        }
    }

    fn service_dir(&self, service: &ServiceDescriptor) -> PathBuf {
        self.repo_root.join(&service.path_prefix)
    }

    fn command(&self, argv: &[String], dir: &Path) -> Result<Command> {
        let (program, args) = argv.split_first().context("Toolchain command is empty")?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(dir);
        Ok(cmd)
    }
}

/// Whether any file under `dir` matches one of the test patterns
pub fn has_test_files(dir: &Path, patterns: &[String]) -> bool {
    let base = Pattern::escape(&dir.to_string_lossy());

    patterns.iter().any(|pattern| {
        let full = format!("{}/{}", base, pattern);
        match glob::glob(&full) {
            Ok(mut paths) => paths.any(|entry| entry.map(|p| p.is_file()).unwrap_or(false)),
            Err(_) => false,
        }
    })
}

#[async_trait]
impl Toolchain for CommandToolchain {
    async fn install(&self, service: &ServiceDescriptor) -> Result<StageOutcome> {
        let dir = self.service_dir(service);
        let manifest = dir.join(&self.spec.dependency_manifest);

        if !manifest.is_file() {
            return Ok(StageOutcome::NotApplicable(format!(
                "no {} declared",
                self.spec.dependency_manifest
            )));
        }

        let what = format!("dependency install for {}", service.id);
        let mut cmd = self.command(&self.spec.install_command, &dir)?;
        process::run(&mut cmd, None, &what).await?;

        Ok(StageOutcome::Completed)
    }

    async fn test(&self, service: &ServiceDescriptor) -> Result<StageOutcome> {
        let dir = self.service_dir(service);

        if !has_test_files(&dir, &self.spec.test_patterns) {
            return Ok(StageOutcome::NotApplicable("no test suite".to_string()));
        }

        let what = format!("tests for {}", service.id);
        let mut cmd = self.command(&self.spec.test_command, &dir)?;
        let output = process::capture(&mut cmd, None, &what).await?;

        if output.success() {
            return Ok(StageOutcome::Completed);
        }

        if self.spec.no_tests_exit_code == Some(output.code) {
            return Ok(StageOutcome::NotApplicable(
                "test runner collected no tests".to_string(),
            ));
        }

        anyhow::bail!(
            "{} failed with exit code {}: {}",
            what,
            output.code,
            process::failure_message(&output)
        )
    }
}
