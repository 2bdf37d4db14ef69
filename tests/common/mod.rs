//! In-memory adapters for driving the controller without git, docker or a cluster.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use deltaship::adapters::{
    Adapters, ArtifactRegistry, CleanupHook, Convergence, CredentialProvider, Credentials,
    PackageBuilder, Platform, RegistrySession, RevisionSource, RolloutProbe, Toolchain,
};
use deltaship::config::ResolvedConfig;
use deltaship::core::{hash_input, Pipeline};
use deltaship::domain::{DeploymentTarget, Instance, ServiceDescriptor, StageOutcome};

pub const RELEASE_PREFIX: &str = "deltaship";

/// Three services with short deploy/verify budgets
pub const PIPELINE_YAML: &str = r#"
name: services
description: Test services

services:
  - svc-a
  - svc-b
  - svc-c

timeouts:
  deploy_seconds: 1
  verify_seconds: 2
  poll_interval_ms: 10

publish_retry:
  max_attempts: 2
  initial_delay_ms: 1
"#;

pub fn pipeline() -> Pipeline {
    Pipeline::from_yaml(PIPELINE_YAML).unwrap()
}

pub fn config(home: &Path) -> ResolvedConfig {
    ResolvedConfig {
        home: home.to_path_buf(),
        registry: Some("registry.test/acme".to_string()),
        credentials_ref: "registry".to_string(),
        namespace: "ci".to_string(),
        release_prefix: RELEASE_PREFIX.to_string(),
        build_id: None,
        kubeconfig: None,
        previous_revision: None,
        config_file: None,
    }
}

pub fn service(id: &str) -> ServiceDescriptor {
    ServiceDescriptor {
        id: id.to_string(),
        path_prefix: id.to_string(),
        chart: PathBuf::from(format!("charts/{}", id)),
        release_name: format!("{}-{}", RELEASE_PREFIX, id),
        image_repository: format!("registry.test/acme/{}", id),
    }
}

fn service_of(release: &str) -> String {
    release
        .strip_prefix(&format!("{}-", RELEASE_PREFIX))
        .unwrap_or(release)
        .to_string()
}

/// Scripted behaviour of the fakes
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub changed_paths: Vec<String>,
    pub unresolvable: Vec<String>,
    pub failing_tests: Vec<String>,
    pub panicking_installs: Vec<String>,
    pub slow_deploys: Vec<String>,
    pub deploy_delay: Duration,
    pub no_instances: Vec<String>,
    pub stalled_rollouts: Vec<String>,
    pub credentials_fail: bool,
    pub cleanup_fails: bool,
}

impl Script {
    pub fn changed(paths: &[&str]) -> Self {
        Self {
            changed_paths: paths.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }
}

/// Ordered record of every adapter invocation, e.g. `test:svc-a`
#[derive(Debug, Default)]
pub struct Calls {
    log: Mutex<Vec<String>>,
}

impl Calls {
    pub fn record(&self, call: String) {
        self.log.lock().unwrap().push(call);
    }

    pub fn all(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn has(&self, call: &str) -> bool {
        self.log.lock().unwrap().iter().any(|c| c == call)
    }

    /// Calls for one service, any stage
    pub fn for_service(&self, id: &str) -> Vec<String> {
        let suffix = format!(":{}", id);
        self.all().into_iter().filter(|c| c.ends_with(&suffix)).collect()
    }
}

pub struct FakeRevisionSource {
    script: Script,
    calls: Arc<Calls>,
}

#[async_trait]
impl RevisionSource for FakeRevisionSource {
    async fn resolve(&self, revision: &str) -> Result<String> {
        if self.script.unresolvable.iter().any(|r| r == revision) {
            anyhow::bail!("unknown revision '{}'", revision);
        }
        Ok(revision.to_string())
    }

    async fn changed_paths(&self, previous: &str, current: &str) -> Result<Vec<String>> {
        self.calls.record(format!("diff:{}..{}", previous, current));
        Ok(self.script.changed_paths.clone())
    }
}

pub struct FakeToolchain {
    script: Script,
    calls: Arc<Calls>,
}

#[async_trait]
impl Toolchain for FakeToolchain {
    async fn install(&self, service: &ServiceDescriptor) -> Result<StageOutcome> {
        self.calls.record(format!("install:{}", service.id));
        if self.script.panicking_installs.contains(&service.id) {
            panic!("toolchain crashed while installing {}", service.id);
        }
        Ok(StageOutcome::Completed)
    }

    async fn test(&self, service: &ServiceDescriptor) -> Result<StageOutcome> {
        self.calls.record(format!("test:{}", service.id));
        if self.script.failing_tests.contains(&service.id) {
            anyhow::bail!("2 tests failed");
        }
        Ok(StageOutcome::Completed)
    }
}

pub struct FakeBuilder {
    calls: Arc<Calls>,
}

#[async_trait]
impl PackageBuilder for FakeBuilder {
    async fn build(&self, service: &ServiceDescriptor, _images: &[String]) -> Result<()> {
        self.calls.record(format!("package:{}", service.id));
        Ok(())
    }
}

/// Registry keeping `image -> digest`; the digest depends only on the repository
#[derive(Default)]
pub struct FakeRegistry {
    calls: Arc<Calls>,
    pub tags: Mutex<HashMap<String, String>>,
    pub logins: AtomicUsize,
}

impl FakeRegistry {
    pub fn new(calls: Arc<Calls>) -> Self {
        Self {
            calls,
            ..Default::default()
        }
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.tags.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactRegistry for FakeRegistry {
    async fn authenticate(&self, _credentials: &Credentials) -> Result<RegistrySession> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        Ok(RegistrySession {
            host: "registry.test".to_string(),
        })
    }

    async fn push(&self, _session: &RegistrySession, image: &str) -> Result<String> {
        let (repository, _tag) = image.rsplit_once(':').unwrap_or((image, "latest"));
        let id = repository.rsplit('/').next().unwrap_or(repository);
        self.calls.record(format!("push:{}", id));

        let digest = format!("sha256:{}", hash_input(repository));
        self.tags
            .lock()
            .unwrap()
            .insert(image.to_string(), digest.clone());
        Ok(digest)
    }
}

pub struct FakePlatform {
    script: Script,
    calls: Arc<Calls>,
}

#[async_trait]
impl Platform for FakePlatform {
    async fn upgrade(
        &self,
        target: &DeploymentTarget,
        _image_repository: &str,
        _image_tag: &str,
        _timeout: Duration,
    ) -> Result<Convergence> {
        let id = service_of(&target.release_name);
        self.calls.record(format!("deploy:{}", id));
        if self.script.slow_deploys.contains(&id) {
            tokio::time::sleep(self.script.deploy_delay).await;
        }
        Ok(Convergence::Converged)
    }

    async fn rollout_status(&self, target: &DeploymentTarget) -> Result<RolloutProbe> {
        let id = service_of(&target.release_name);
        self.calls.record(format!("verify:{}", id));
        if self.script.stalled_rollouts.contains(&id) {
            return Ok(RolloutProbe::Progressing("1 of 2 replicas updated".to_string()));
        }
        Ok(RolloutProbe::Complete)
    }

    async fn list_instances(&self, target: &DeploymentTarget) -> Result<Vec<Instance>> {
        let id = service_of(&target.release_name);
        if self.script.no_instances.contains(&id) {
            return Ok(Vec::new());
        }
        Ok(vec![Instance {
            name: format!("{}-0", target.release_name),
            phase: "Running".to_string(),
            ready: true,
        }])
    }
}

pub struct FakeCredentials {
    script: Script,
    pub acquired: AtomicUsize,
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn acquire(&self, reference: &str) -> Result<Credentials> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        if self.script.credentials_fail {
            anyhow::bail!("{}_PASSWORD is not set", reference.to_uppercase());
        }
        Ok(Credentials::new("ci-bot", "s3cret"))
    }
}

pub struct CountingCleanup {
    fail: bool,
    pub runs: AtomicUsize,
}

#[async_trait]
impl CleanupHook for CountingCleanup {
    fn name(&self) -> &str {
        "counting-cleanup"
    }

    async fn cleanup(&self) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("logout failed");
        }
        Ok(())
    }
}

/// All fakes for one run, sharing a call log
pub struct Fakes {
    pub calls: Arc<Calls>,
    pub registry: Arc<FakeRegistry>,
    pub credentials: Arc<FakeCredentials>,
    pub cleanup: Arc<CountingCleanup>,
    script: Script,
}

impl Fakes {
    pub fn new(script: Script) -> Self {
        let calls = Arc::new(Calls::default());
        Self {
            registry: Arc::new(FakeRegistry::new(calls.clone())),
            credentials: Arc::new(FakeCredentials {
                script: script.clone(),
                acquired: AtomicUsize::new(0),
            }),
            cleanup: Arc::new(CountingCleanup {
                fail: script.cleanup_fails,
                runs: AtomicUsize::new(0),
            }),
            calls,
            script,
        }
    }

    pub fn adapters(&self) -> Adapters {
        Adapters {
            revisions: Arc::new(FakeRevisionSource {
                script: self.script.clone(),
                calls: self.calls.clone(),
            }),
            toolchain: Arc::new(FakeToolchain {
                script: self.script.clone(),
                calls: self.calls.clone(),
            }),
            builder: Arc::new(FakeBuilder {
                calls: self.calls.clone(),
            }),
            registry: self.registry.clone(),
            platform: Arc::new(FakePlatform {
                script: self.script.clone(),
                calls: self.calls.clone(),
            }),
            credentials: self.credentials.clone(),
            cleanup: vec![self.cleanup.clone() as Arc<dyn CleanupHook>],
        }
    }

    pub fn platform(&self) -> Arc<FakePlatform> {
        Arc::new(FakePlatform {
            script: self.script.clone(),
            calls: self.calls.clone(),
        })
    }

    pub fn cleanup_runs(&self) -> usize {
        self.cleanup.runs.load(Ordering::SeqCst)
    }

    /// Stage calls (anything but the diff)
    pub fn stage_calls(&self) -> Vec<String> {
        self.calls
            .all()
            .into_iter()
            .filter(|c| !c.starts_with("diff:"))
            .collect()
    }
}
