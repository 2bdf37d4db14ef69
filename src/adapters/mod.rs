//! Adapter interfaces for external systems.
//!
//! Every external collaborator of the pipeline (version control, the
//! language toolchain, the image builder, the artifact registry, the
//! orchestration platform and the credential source) sits behind a trait so
//! the controller can be driven by subprocess adapters in production and by
//! in-memory fakes in tests.

pub mod credentials;
pub mod docker;
pub mod git;
pub mod helm;
pub mod process;
pub mod toolchain;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::ResolvedConfig;
use crate::core::pipeline::ToolchainSpec;
use crate::domain::{DeploymentTarget, Instance, ServiceDescriptor, StageOutcome};

pub use credentials::{Credentials, EnvCredentialProvider};
pub use docker::{DockerBuilder, DockerRegistry};
pub use git::GitRevisionSource;
pub use helm::HelmPlatform;
pub use toolchain::CommandToolchain;

/// Source of revision information (e.g. git)
#[async_trait]
pub trait RevisionSource: Send + Sync {
    /// Resolve a revision marker to a commit id
    async fn resolve(&self, revision: &str) -> Result<String>;

    /// Paths changed between two resolved revisions
    async fn changed_paths(&self, previous: &str, current: &str) -> Result<Vec<String>>;
}

/// Installs dependencies and runs tests for a service
#[async_trait]
pub trait Toolchain: Send + Sync {
    async fn install(&self, service: &ServiceDescriptor) -> Result<StageOutcome>;

    async fn test(&self, service: &ServiceDescriptor) -> Result<StageOutcome>;
}

/// Builds a service image under a set of tags
#[async_trait]
pub trait PackageBuilder: Send + Sync {
    async fn build(&self, service: &ServiceDescriptor, images: &[String]) -> Result<()>;
}

/// Authenticated handle on the artifact registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySession {
    /// Registry host the session is bound to
    pub host: String,
}

/// Artifact registry (e.g. a container registry)
#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    /// Log in with run-scoped credentials
    async fn authenticate(&self, credentials: &Credentials) -> Result<RegistrySession>;

    /// Push an image reference; returns the content digest
    async fn push(&self, session: &RegistrySession, image: &str) -> Result<String>;
}

/// Result of a converge request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence {
    Converged,
    /// The platform gave up waiting within its own timeout
    TimedOut,
}

/// Single observation of a release's rollout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutProbe {
    Pending,
    Progressing(String),
    Complete,
    Failed(String),
}

/// Orchestration platform (e.g. Kubernetes via Helm)
#[async_trait]
pub trait Platform: Send + Sync {
    /// Converge a release to an image, blocking up to `timeout`
    async fn upgrade(
        &self,
        target: &DeploymentTarget,
        image_repository: &str,
        image_tag: &str,
        timeout: Duration,
    ) -> Result<Convergence>;

    /// Current rollout status of a release
    async fn rollout_status(&self, target: &DeploymentTarget) -> Result<RolloutProbe>;

    /// Instances currently backing a release
    async fn list_instances(&self, target: &DeploymentTarget) -> Result<Vec<Instance>>;
}

/// Resolves a credentials reference into credential material
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn acquire(&self, reference: &str) -> Result<Credentials>;
}

/// Best-effort teardown run once at the end of every pipeline run
#[async_trait]
pub trait CleanupHook: Send + Sync {
    fn name(&self) -> &str;

    async fn cleanup(&self) -> Result<()>;
}

/// The full set of collaborators a pipeline run needs
#[derive(Clone)]
pub struct Adapters {
    pub revisions: Arc<dyn RevisionSource>,
    pub toolchain: Arc<dyn Toolchain>,
    pub builder: Arc<dyn PackageBuilder>,
    pub registry: Arc<dyn ArtifactRegistry>,
    pub platform: Arc<dyn Platform>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub cleanup: Vec<Arc<dyn CleanupHook>>,
}

impl Adapters {
    /// Subprocess-backed adapters rooted at a repository checkout
    pub fn subprocess(
        repo_root: &Path,
        toolchain: &ToolchainSpec,
        config: &ResolvedConfig,
    ) -> Result<Self> {
        let registry = Arc::new(DockerRegistry::new(config.registry()?)?);

        Ok(Self {
            revisions: Arc::new(GitRevisionSource::new(repo_root)),
            toolchain: Arc::new(CommandToolchain::new(repo_root, toolchain.clone())),
            builder: Arc::new(DockerBuilder::new(repo_root)),
            registry: registry.clone(),
            platform: Arc::new(HelmPlatform::new(repo_root, config.kubeconfig.clone())),
            credentials: Arc::new(EnvCredentialProvider::new()),
            cleanup: vec![registry],
        })
    }
}
