//! Pipeline definitions and loading.
//!
//! A pipeline is defined in YAML (`deltaship.yaml` by default) and names the
//! service registry, the toolchain commands used to install and test each
//! service, the per-stage budgets, and the publish retry policy.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::budgets::StageBudgets;
use crate::domain::{ServiceDescriptor, ServiceRegistry};

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (recorded in the run log)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Directory holding one Helm chart per service (default: "charts")
    #[serde(default = "default_charts_dir")]
    pub charts_dir: String,

    /// Known services, in registry order
    pub services: Vec<ServiceSpec>,

    /// Per-stage time budgets
    #[serde(default)]
    pub timeouts: StageBudgets,

    /// Install/test commands
    #[serde(default)]
    pub toolchain: ToolchainSpec,

    /// Retry policy for registry pushes
    #[serde(default)]
    pub publish_retry: RetryPolicy,
}

fn default_charts_dir() -> String {
    "charts".to_string()
}

impl Pipeline {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Pipeline name cannot be empty");
        }

        if self.services.is_empty() {
            anyhow::bail!("Pipeline must declare at least one service");
        }

        let mut ids = HashSet::new();
        let mut prefixes = HashSet::new();

        for (i, spec) in self.services.iter().enumerate() {
            let id = spec.id();
            if id.trim().is_empty() {
                anyhow::bail!("Service {} has an empty id", i);
            }
            if id.contains('/') {
                anyhow::bail!("Service id '{}' must not contain '/'", id);
            }
            if !ids.insert(id) {
                anyhow::bail!("Service '{}' is declared more than once", id);
            }

            let prefix = spec.path_prefix();
            if prefix.is_empty() || prefix.contains('/') {
                anyhow::bail!(
                    "Service '{}' must map to a top-level directory (got '{}')",
                    id,
                    prefix
                );
            }
            if !prefixes.insert(prefix.clone()) {
                anyhow::bail!("Path prefix '{}' is claimed by more than one service", prefix);
            }
        }

        if self.toolchain.install_command.is_empty() {
            anyhow::bail!("toolchain.install_command cannot be empty");
        }
        if self.toolchain.test_command.is_empty() {
            anyhow::bail!("toolchain.test_command cannot be empty");
        }

        let zero = self.timeouts.zero_budgets();
        if !zero.is_empty() {
            anyhow::bail!("Stage budgets must be positive (zero for: {:?})", zero);
        }
        if self.timeouts.poll_interval_ms == 0 {
            anyhow::bail!("timeouts.poll_interval_ms must be positive");
        }

        if self.publish_retry.max_attempts == 0 {
            anyhow::bail!("publish_retry.max_attempts must be at least 1");
        }

        Ok(())
    }

    /// Derive the service registry for an image registry and release prefix
    pub fn registry(&self, image_registry: &str, release_prefix: &str) -> ServiceRegistry {
        let image_registry = image_registry.trim_end_matches('/');
        let charts_dir = PathBuf::from(&self.charts_dir);

        let services = self
            .services
            .iter()
            .map(|spec| {
                let id = spec.id().to_string();
                let chart = match spec {
                    ServiceSpec::Detailed {
                        chart: Some(chart), ..
                    } => PathBuf::from(chart),
                    _ => charts_dir.join(&id),
                };

                ServiceDescriptor {
                    path_prefix: spec.path_prefix(),
                    chart,
                    release_name: format!("{}-{}", release_prefix, id),
                    image_repository: format!("{}/{}", image_registry, id),
                    id,
                }
            })
            .collect();

        ServiceRegistry::new(services)
    }
}

/// A service entry in the pipeline file
///
/// Supports two YAML formats:
/// - Simple: `- user-service`
/// - Detailed: `- { id: user-service, path: users, chart: helm/users }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceSpec {
    /// Directory name equals the service id
    Id(String),

    Detailed {
        id: String,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        chart: Option<String>,
    },
}

impl ServiceSpec {
    pub fn id(&self) -> &str {
        match self {
            ServiceSpec::Id(id) => id,
            ServiceSpec::Detailed { id, .. } => id,
        }
    }

    /// Top-level directory owned by the service (no leading `./`, no trailing `/`)
    pub fn path_prefix(&self) -> String {
        let raw = match self {
            ServiceSpec::Detailed {
                path: Some(path), ..
            } => path.as_str(),
            _ => self.id(),
        };
        raw.trim_start_matches("./").trim_end_matches('/').to_string()
    }
}

/// Commands used for the install and test stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainSpec {
    /// File whose presence means the service declares dependencies
    #[serde(default = "default_dependency_manifest")]
    pub dependency_manifest: String,

    /// Run in the service directory when the manifest exists
    #[serde(default = "default_install_command")]
    pub install_command: Vec<String>,

    /// Run in the service directory when test files exist
    #[serde(default = "default_test_command")]
    pub test_command: Vec<String>,

    /// Glob patterns (relative to the service directory) identifying test files
    #[serde(default = "default_test_patterns")]
    pub test_patterns: Vec<String>,

    /// Exit code the test runner uses for "no tests collected"
    #[serde(default = "default_no_tests_exit_code")]
    pub no_tests_exit_code: Option<i32>,
}

fn default_dependency_manifest() -> String {
    "requirements.txt".to_string()
}
fn default_install_command() -> Vec<String> {
    vec![
        "pip".to_string(),
        "install".to_string(),
        "-r".to_string(),
        "requirements.txt".to_string(),
    ]
}
fn default_test_command() -> Vec<String> {
    vec!["pytest".to_string()]
}
fn default_test_patterns() -> Vec<String> {
    vec![
        "test_*.py".to_string(),
        "*_test.py".to_string(),
        "tests/**/*.py".to_string(),
    ]
}
fn default_no_tests_exit_code() -> Option<i32> {
    Some(5) // pytest: no tests collected
}

impl Default for ToolchainSpec {
    fn default() -> Self {
        Self {
            dependency_manifest: default_dependency_manifest(),
            install_command: default_install_command(),
            test_command: default_test_command(),
            test_patterns: default_test_patterns(),
            no_tests_exit_code: default_no_tests_exit_code(),
        }
    }
}

/// Retry policy for registry pushes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
