//! Docker image builder and registry adapters.
//!
//! Registry logins are scoped to the run: the docker client configuration
//! lives in a temporary directory (via `DOCKER_CONFIG`) that is logged out of
//! and removed during cleanup, so credentials never land in the user's
//! `~/.docker/config.json`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info};

use super::credentials::Credentials;
use super::process;
use super::{ArtifactRegistry, CleanupHook, PackageBuilder, RegistrySession};
use crate::domain::ServiceDescriptor;

/// Builds images with `docker build`
pub struct DockerBuilder {
    repo_root: PathBuf,
    binary_path: String,
}

impl DockerBuilder {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            binary_path: "docker".to_string(),
        }
    }
}

#[async_trait]
impl PackageBuilder for DockerBuilder {
    async fn build(&self, service: &ServiceDescriptor, images: &[String]) -> Result<()> {
        let context_dir = self.repo_root.join(&service.path_prefix);

        let mut cmd = Command::new(&self.binary_path);
        cmd.current_dir(&self.repo_root).arg("build");
        for image in images {
            cmd.args(["-t", image.as_str()]);
        }
        cmd.arg(&context_dir);

        let what = format!("docker build for {}", service.id);
        process::run(&mut cmd, None, &what).await?;
        Ok(())
    }
}

/// Pushes images with `docker push`, using a run-scoped client config
pub struct DockerRegistry {
    host: Option<String>,
    binary_path: String,
    config_path: PathBuf,
    config_dir: Mutex<Option<TempDir>>,
    logged_in: Mutex<BTreeSet<String>>,
}

impl DockerRegistry {
    /// Create an adapter for an image registry such as `ghcr.io/acme`
    pub fn new(registry: &str) -> Result<Self> {
        let config_dir = tempfile::Builder::new()
            .prefix("deltaship-docker-")
            .tempdir()
            .context("Failed to create run-scoped docker config directory")?;

        Ok(Self {
            host: registry_host(registry),
            binary_path: "docker".to_string(),
            config_path: config_dir.path().to_path_buf(),
            config_dir: Mutex::new(Some(config_dir)),
            logged_in: Mutex::new(BTreeSet::new()),
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary_path);
        cmd.env("DOCKER_CONFIG", &self.config_path);
        cmd
    }

    fn session_host(&self) -> String {
        self.host.clone().unwrap_or_else(|| "docker.io".to_string())
    }
}

/// Host part of a registry reference, or None for Docker Hub shorthand
pub fn registry_host(registry: &str) -> Option<String> {
    let first = registry.trim().split('/').next()?;
    if first.contains('.') || first.contains(':') || first == "localhost" {
        Some(first.to_string())
    } else {
        None
    }
}

/// Extract `sha256:...` from `docker push` output
pub fn parse_push_digest(stdout: &str) -> Option<String> {
    stdout.lines().rev().find_map(|line| {
        let (_, rest) = line.split_once("digest: ")?;
        rest.split_whitespace()
            .next()
            .filter(|d| d.starts_with("sha256:"))
            .map(str::to_string)
    })
}

#[async_trait]
impl ArtifactRegistry for DockerRegistry {
    async fn authenticate(&self, credentials: &Credentials) -> Result<RegistrySession> {
        let mut cmd = self.command();
        cmd.arg("login");
        if let Some(host) = &self.host {
            cmd.arg(host);
        }
        cmd.args(["--username", credentials.username.as_str(), "--password-stdin"]);

        process::run(&mut cmd, Some(credentials.password_bytes()), "docker login").await?;

        let host = self.session_host();
        if let Ok(mut hosts) = self.logged_in.lock() {
            hosts.insert(host.clone());
        }

        Ok(RegistrySession { host })
    }

    async fn push(&self, session: &RegistrySession, image: &str) -> Result<String> {
        debug!(host = %session.host, %image, "Pushing image");

        let mut cmd = self.command();
        cmd.args(["push", image]);

        let stdout = process::run(&mut cmd, None, "docker push").await?;
        parse_push_digest(&stdout)
            .with_context(|| format!("docker push for {} did not report a digest", image))
    }
}

#[async_trait]
impl CleanupHook for DockerRegistry {
    fn name(&self) -> &str {
        "docker-registry-logout"
    }

    async fn cleanup(&self) -> Result<()> {
        let hosts: Vec<String> = match self.logged_in.lock() {
            Ok(mut hosts) => std::mem::take(&mut *hosts).into_iter().collect(),
            Err(_) => Vec::new(),
        };

        let mut failures = Vec::new();
        for host in hosts {
            let mut cmd = self.command();
            cmd.arg("logout");
            if self.host.is_some() {
                cmd.arg(&host);
            }
            if let Err(e) = process::run(&mut cmd, None, "docker logout").await {
                failures.push(format!("{}: {:#}", host, e));
            } else {
                info!(%host, "Logged out of registry");
            }
        }

        let dir = self.config_dir.lock().ok().and_then(|mut d| d.take());
        if let Some(dir) = dir {
            dir.close()
                .context("Failed to remove run-scoped docker config directory")?;
        }

        if !failures.is_empty() {
            anyhow::bail!("Registry logout failed: {}", failures.join("; "));
        }
        Ok(())
    }
}
